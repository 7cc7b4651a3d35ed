//! Append-only transition log entries.
//!
//! One entry per state transition; entries are constructed once and never
//! mutated. The persistence collaborator must round-trip every field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{EntryId, RecordId};
use crate::record::RecordStatus;

/// The state transitions the core records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Enqueue,
    Dequeue,
    DepthEscalate,
    Fuse,
    RevertFuse,
    Terminate,
    Panic,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Transition::Enqueue => "enqueue",
            Transition::Dequeue => "dequeue",
            Transition::DepthEscalate => "depth_escalate",
            Transition::Fuse => "fuse",
            Transition::RevertFuse => "revert_fuse",
            Transition::Terminate => "terminate",
            Transition::Panic => "panic",
        };
        write!(f, "{}", name)
    }
}

/// An immutable record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: EntryId,
    pub record_id: RecordId,
    pub transition: Transition,
    pub timestamp: DateTime<Utc>,
    pub before_status: Option<RecordStatus>,
    pub after_status: Option<RecordStatus>,

    /// Free-form transition-specific data (e.g. fused constituent ids).
    pub detail: BTreeMap<String, serde_json::Value>,
}

impl LogEntry {
    /// Create an entry for a transition, stamped now.
    pub fn new(
        record_id: RecordId,
        transition: Transition,
        before_status: Option<RecordStatus>,
        after_status: Option<RecordStatus>,
    ) -> Self {
        Self {
            entry_id: EntryId::new(),
            record_id,
            transition,
            timestamp: Utc::now(),
            before_status,
            after_status,
            detail: BTreeMap::new(),
        }
    }

    /// Attach a detail value. Used while assembling the entry, before it is
    /// handed to the persistence collaborator.
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }
}
