//! Fusion result shapes and charge combination strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::id::{FusionId, RecordId};
use crate::tag::Tag;

/// How the charges of fused constituents combine into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChargeStrategy {
    /// Result charge = max of the inputs.
    #[default]
    InheritedMax,
    /// Result charge = rounded mean of the inputs.
    Averaged,
    /// Result charge = sum of the inputs, capped at 100.
    SummedCapped,
}

impl ChargeStrategy {
    /// Combine constituent charges. Returns 0 for an empty slice.
    pub fn combine(&self, charges: &[u8]) -> u8 {
        if charges.is_empty() {
            return 0;
        }
        match self {
            ChargeStrategy::InheritedMax => charges.iter().copied().max().unwrap_or(0),
            ChargeStrategy::Averaged => {
                let sum: u32 = charges.iter().map(|&c| c as u32).sum();
                ((sum as f64 / charges.len() as f64).round()) as u8
            }
            ChargeStrategy::SummedCapped => {
                let sum: u32 = charges.iter().map(|&c| c as u32).sum();
                sum.min(100) as u8
            }
        }
    }
}

/// The result of fusing two or more records.
///
/// Constituents are not deleted, only marked `Fused`; this shape owns their
/// ids. The fusion stays reversible until `lock` is set or the rollback
/// window expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedRecord {
    pub id: FusionId,

    /// Ids of the source records this fusion absorbed.
    pub constituents: Vec<RecordId>,

    /// Combined charge, per `strategy`.
    pub charge: u8,

    /// Union of the constituents' tags.
    pub tags: HashSet<Tag>,

    pub strategy: ChargeStrategy,

    pub fused_at: DateTime<Utc>,

    /// End of the rollback window.
    pub expires_at: DateTime<Utc>,

    /// Permanent once set; never cleared.
    pub lock: bool,

    /// Whether the eligibility gate was bypassed (`Forced` mode).
    pub forced: bool,
}

impl FusedRecord {
    /// Make this fusion permanent. One-way.
    pub fn lock(&mut self) {
        self.lock = true;
    }

    /// Whether a rollback is still possible at `now`.
    pub fn is_revertible(&self, now: DateTime<Utc>) -> bool {
        !self.lock && now < self.expires_at
    }
}
