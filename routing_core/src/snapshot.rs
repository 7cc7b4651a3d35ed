//! Full-state snapshots for panic recovery and process restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use record_model::{FusionId, Record};

use crate::chain::ChainTable;

/// Observability counters for the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreMetrics {
    /// Collision merges performed by the queue.
    pub collisions: u64,
    /// Deadlocked chains detected.
    pub deadlocks: u64,
    /// Fusions performed.
    pub fusions: u64,
    /// Fusions reverted.
    pub reverts: u64,
    /// Records that reached a terminal handler result.
    pub completed: u64,
    /// Records force-terminated (depth, deadlock, fault, cancellation).
    pub terminated: u64,
}

/// Everything the persistence collaborator needs to rebuild the core:
/// queue contents, the per-chain deadlock table, and open fusion rollback
/// windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSnapshot {
    pub taken_at: DateTime<Utc>,
    pub halted: bool,
    /// Pending queue contents in arrival order.
    pub pending: Vec<Record>,
    pub chains: ChainTable,
    /// Fusion id -> rollback window expiry.
    pub fusion_windows: HashMap<FusionId, DateTime<Utc>>,
    pub metrics: CoreMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_model::RecordId;

    #[test]
    fn test_snapshot_round_trips_through_json() {
        let record = Record::new("a", "b", 50);
        let id = record.id;

        let snapshot = CoreSnapshot {
            taken_at: Utc::now(),
            halted: true,
            pending: vec![record],
            chains: ChainTable::new(),
            fusion_windows: HashMap::from([(FusionId::new(), Utc::now())]),
            metrics: CoreMetrics {
                deadlocks: 2,
                ..Default::default()
            },
        };

        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: CoreSnapshot = serde_json::from_str(&encoded).unwrap();

        assert!(decoded.halted);
        assert_eq!(decoded.pending.len(), 1);
        assert_eq!(decoded.pending[0].id, id);
        assert_eq!(decoded.fusion_windows.len(), 1);
        assert_eq!(decoded.metrics.deadlocks, 2);
        assert_ne!(decoded.pending[0].id, RecordId::nil());
    }
}
