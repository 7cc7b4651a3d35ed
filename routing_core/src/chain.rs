//! Chain tables - explicit hop history for deadlock detection.
//!
//! A chain is the ordered list of (source, destination) hops one logical
//! record has taken. Keeping it as a table makes deadlock detection a
//! membership check instead of recursion over a call stack.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use record_model::{HandlerId, RecordId};

use crate::error::CoreError;

/// One routing hop.
pub type Hop = (HandlerId, HandlerId);

/// Tracks the hop chain of every record that has been re-routed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainTable {
    chains: HashMap<RecordId, Vec<Hop>>,
    deadlocks: u64,
}

impl ChainTable {
    /// Create an empty chain table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hop for a record's chain.
    ///
    /// A (source, destination) pair repeating within one chain is a deadlock:
    /// the error fires on the second occurrence of the pair, never the first.
    /// The offending hop is not recorded.
    pub fn record_hop(
        &mut self,
        id: RecordId,
        source: HandlerId,
        destination: HandlerId,
    ) -> Result<(), CoreError> {
        let chain = self.chains.entry(id).or_default();
        let hop = (source, destination);

        if chain.contains(&hop) {
            self.deadlocks += 1;
            return Err(CoreError::Deadlocked);
        }

        chain.push(hop);
        Ok(())
    }

    /// The hop chain of a record, if it has one.
    pub fn chain_of(&self, id: RecordId) -> Option<&[Hop]> {
        self.chains.get(&id).map(|c| c.as_slice())
    }

    /// Every destination a record has visited, in hop order.
    pub fn destination_history(&self, id: RecordId) -> Vec<HandlerId> {
        self.chains
            .get(&id)
            .map(|chain| chain.iter().map(|(_, to)| to.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop a record's chain (terminated, fused, or completed).
    pub fn remove(&mut self, id: RecordId) -> Option<Vec<Hop>> {
        self.chains.remove(&id)
    }

    /// Number of deadlocks detected so far.
    pub fn deadlock_count(&self) -> u64 {
        self.deadlocks
    }

    /// Number of live chains.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Whether no chains are tracked.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
