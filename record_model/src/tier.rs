//! Tier classification - the pure mapping from charge to tier.
//!
//! The 71 and 86 boundaries recur across the queue, the fusion engine, and
//! the dispatcher; the named predicates here are their single home.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the pure model layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Charge outside the 0-100 interval.
    #[error("charge {0} is outside the valid range 0-100")]
    OutOfRange(u8),
}

/// One of five named, contiguous ranges partitioning charge 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Charge 0-25.
    Latent,
    /// Charge 26-50.
    Processing,
    /// Charge 51-70.
    Active,
    /// Charge 71-85.
    Intense,
    /// Charge 86-100.
    Critical,
}

impl Tier {
    /// Inclusive charge range covered by this tier.
    pub fn range(&self) -> (u8, u8) {
        match self {
            Tier::Latent => (0, 25),
            Tier::Processing => (26, 50),
            Tier::Active => (51, 70),
            Tier::Intense => (71, 85),
            Tier::Critical => (86, 100),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Latent => "latent",
            Tier::Processing => "processing",
            Tier::Active => "active",
            Tier::Intense => "intense",
            Tier::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// Map a charge to its tier. Total over 0-100, errors above 100.
pub fn tier_of(charge: u8) -> Result<Tier, ModelError> {
    match charge {
        0..=25 => Ok(Tier::Latent),
        26..=50 => Ok(Tier::Processing),
        51..=70 => Ok(Tier::Active),
        71..=85 => Ok(Tier::Intense),
        86..=100 => Ok(Tier::Critical),
        _ => Err(ModelError::OutOfRange(charge)),
    }
}

/// Charge high enough for a fusion to be considered for canonization.
pub fn is_canonization_eligible(charge: u8) -> bool {
    charge >= 71
}

/// Charge in the emergency band.
pub fn is_emergency(charge: u8) -> bool {
    charge >= 86
}
