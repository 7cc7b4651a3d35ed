//! Depth guard - the ladder of recursion ceilings.
//!
//! Every dequeue runs the ladder before the handler is invoked. Which ceiling
//! applies depends on the record's control tags: an override tag raises the
//! ceiling to the emergency limit, an extended tag to the extended limit,
//! everything else stops at the standard limit. The absolute limit applies
//! unconditionally and halts the entire core.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use record_model::Tag;

/// The four recursion ceilings, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DepthLimit {
    /// Default ceiling: pause and hand to manual review.
    Standard,
    /// Extended-processing ceiling: force-terminate, preserve partial result.
    Extended,
    /// Override ceiling: force-terminate with fan-out alert.
    Emergency,
    /// Unconditional ceiling: panic-stop the whole core.
    Absolute,
}

impl DepthLimit {
    /// The depth at which this ceiling triggers.
    pub fn threshold(&self) -> u32 {
        match self {
            DepthLimit::Standard => 7,
            DepthLimit::Extended => 12,
            DepthLimit::Emergency => 21,
            DepthLimit::Absolute => 33,
        }
    }
}

impl std::fmt::Display for DepthLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DepthLimit::Standard => "standard",
            DepthLimit::Extended => "extended",
            DepthLimit::Emergency => "emergency",
            DepthLimit::Absolute => "absolute",
        };
        write!(f, "{}", name)
    }
}

/// Stateless evaluator for the depth ladder.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthGuard;

impl DepthGuard {
    /// Evaluate the ladder for a record about to be handed to a handler.
    /// Returns the breached ceiling, if any.
    pub fn evaluate(depth: u32, tags: &HashSet<Tag>) -> Option<DepthLimit> {
        if depth >= DepthLimit::Absolute.threshold() {
            return Some(DepthLimit::Absolute);
        }
        if tags.contains(&Tag::Override) {
            if depth >= DepthLimit::Emergency.threshold() {
                return Some(DepthLimit::Emergency);
            }
        } else if tags.contains(&Tag::Extended) {
            if depth >= DepthLimit::Extended.threshold() {
                return Some(DepthLimit::Extended);
            }
        } else if depth >= DepthLimit::Standard.threshold() {
            return Some(DepthLimit::Standard);
        }
        None
    }
}
