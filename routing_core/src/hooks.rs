//! Collaborator traits - the seams where the core talks to the outside.
//!
//! Handlers interpret payloads, the log sink persists the transition trail,
//! and the review/alert/storage sinks absorb escalation outcomes. The core
//! never implements any domain behaviour behind these traits; callers
//! register implementations.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use record_model::{HandlerId, LogEntry, Record, RecordId, Tag};

use crate::snapshot::CoreSnapshot;

/// Failure reported by a handler implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// What the dispatcher hands to a handler. Payloads stay opaque.
#[derive(Debug, Clone)]
pub struct HandlerCall {
    pub id: RecordId,
    pub destination: HandlerId,
    pub charge: u8,
    pub tags: HashSet<Tag>,
    pub payload_ref: Option<String>,
}

impl HandlerCall {
    /// Build a call from a record about to be processed.
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id,
            destination: record.destination.clone(),
            charge: record.charge,
            tags: record.tags.clone(),
            payload_ref: record.payload_ref.clone(),
        }
    }
}

/// The only two shapes a handler may answer with. Anything else - an error
/// or a timeout - is a handler fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResponse {
    /// The record is done; carry the result forward.
    Terminal(String),
    /// Route the record onward to a new destination.
    Reroute(HandlerId),
}

/// A named processing unit. Registered against a destination identifier.
pub trait Handler: Send + Sync {
    /// Process one record. The call must not be interrupted; timeouts are
    /// enforced by the dispatcher around it.
    fn invoke(&self, call: HandlerCall) -> Result<HandlerResponse, HandlerError>;
}

/// Registry mapping destination identifiers to handlers. New handlers are
/// added by registration, never by modifying the dispatcher. Handlers are
/// held behind `Arc` so an invocation can run on its own thread while the
/// dispatcher keeps driving cycles.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerId, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a destination, replacing any previous one.
    pub fn register(&mut self, destination: impl Into<HandlerId>, handler: Box<dyn Handler>) {
        self.handlers.insert(destination.into(), Arc::from(handler));
    }

    /// Whether a destination names a registered handler.
    pub fn contains(&self, destination: &HandlerId) -> bool {
        self.handlers.contains_key(destination)
    }

    /// Look up the handler for a destination.
    pub fn get(&self, destination: &HandlerId) -> Option<Arc<dyn Handler>> {
        self.handlers.get(destination).cloned()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Persistence collaborator: receives the append-only transition trail and
/// periodic full-state snapshots.
pub trait LogSink: Send + Sync {
    /// Persist one transition. Entries arrive in emission order.
    fn append(&self, entry: LogEntry);

    /// Persist a full-state snapshot (panic recovery, process restart).
    fn snapshot(&self, snapshot: &CoreSnapshot);
}

/// Manual-review collaborator: receives paused and deadlocked records.
pub trait ReviewSink: Send + Sync {
    fn review(&self, record: &Record, reason: &str);
}

/// Long-term storage collaborator: receives force-terminated records with
/// whatever partial result they carried.
pub trait StorageSink: Send + Sync {
    fn store(&self, record: &Record, partial: Option<&str>);
}

/// A component interested in emergency terminations for some handler.
pub trait AlertSink: Send + Sync {
    fn notify(&self, destination: &HandlerId, record: &Record);
}

/// In-memory log sink. Useful for tests and as a reference implementation.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
    snapshots: Mutex<Vec<CoreSnapshot>>,
}

impl MemoryLog {
    /// Create an empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries appended so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// All snapshots written so far.
    pub fn snapshots(&self) -> Vec<CoreSnapshot> {
        self.snapshots.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl LogSink for MemoryLog {
    fn append(&self, entry: LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    fn snapshot(&self, snapshot: &CoreSnapshot) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.push(snapshot.clone());
        }
    }
}

/// Review sink that remembers what it was handed. For tests.
#[derive(Default)]
pub struct MemoryReview {
    received: Mutex<Vec<(RecordId, String)>>,
}

impl MemoryReview {
    /// Create an empty review sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything handed to review so far.
    pub fn received(&self) -> Vec<(RecordId, String)> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ReviewSink for MemoryReview {
    fn review(&self, record: &Record, reason: &str) {
        if let Ok(mut received) = self.received.lock() {
            received.push((record.id, reason.to_string()));
        }
    }
}
