//! Record definitions - a unit of work in flight through the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::id::{HandlerId, RecordId};
use crate::priority::Priority;
use crate::tag::Tag;
use crate::tier::{tier_of, ModelError, Tier};

/// Lifecycle states of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Waiting in the dispatch queue.
    Pending,
    /// Dequeued; a handler call is (or was) in flight.
    Active,
    /// Claimed by a fusion; the fused result carries it forward.
    Fused,
    /// Terminated before a terminal result (deadlock, fault, depth ceiling).
    TerminatedIncomplete,
    /// Terminated by the emergency depth ceiling.
    TerminatedEmergency,
    /// Stopped by the absolute depth ceiling; the whole core halts.
    Panicked,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Active => "active",
            RecordStatus::Fused => "fused",
            RecordStatus::TerminatedIncomplete => "terminated_incomplete",
            RecordStatus::TerminatedEmergency => "terminated_emergency",
            RecordStatus::Panicked => "panicked",
        };
        write!(f, "{}", name)
    }
}

/// A unit of work moving through the core.
///
/// `charge` is immutable for a given record version; it changes only through
/// [`Record::rescore`] or fusion, never implicitly. `priority` and `tier` are
/// derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,

    /// Origin identifiers. A single element normally; junction records list
    /// every merged origin.
    pub sources: Vec<HandlerId>,

    /// The handler this record is currently routed to.
    pub destination: HandlerId,

    /// Significance score, 0-100.
    pub charge: u8,

    /// Labels attached to this record.
    pub tags: HashSet<Tag>,

    /// Number of re-routes this record has undergone. Never decreases.
    pub depth: u32,

    /// Stamped when the record enters the queue.
    pub enqueued_at: Option<DateTime<Utc>>,

    /// Stamped when the record is dequeued.
    pub processed_at: Option<DateTime<Utc>>,

    pub status: RecordStatus,

    /// Cooperative cancellation flag, checked at the top of each cycle.
    pub cancelled: bool,

    /// Opaque reference to the payload; the core never interprets it.
    pub payload_ref: Option<String>,
}

impl Record {
    /// Create a new pending record.
    pub fn new(source: impl Into<HandlerId>, destination: impl Into<HandlerId>, charge: u8) -> Self {
        Self {
            id: RecordId::new(),
            sources: vec![source.into()],
            destination: destination.into(),
            charge,
            tags: HashSet::new(),
            depth: 0,
            enqueued_at: None,
            processed_at: None,
            status: RecordStatus::Pending,
            cancelled: false,
            payload_ref: None,
        }
    }

    /// Add a tag to this record.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.insert(tag);
        self
    }

    /// Add multiple tags to this record.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Attach a payload reference.
    pub fn with_payload_ref(mut self, payload_ref: impl Into<String>) -> Self {
        self.payload_ref = Some(payload_ref.into());
        self
    }

    /// The primary origin of this record.
    pub fn source(&self) -> &HandlerId {
        // Records always carry at least one source.
        &self.sources[0]
    }

    /// Check if this record has a specific tag.
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    /// Number of tags shared with another record.
    pub fn tag_overlap(&self, other: &Record) -> usize {
        self.tags.intersection(&other.tags).count()
    }

    /// Derived dispatch priority. Pure over (charge, tags).
    pub fn priority(&self) -> Priority {
        Priority::of(self.charge, &self.tags)
    }

    /// Derived tier for the current charge.
    pub fn tier(&self) -> Result<Tier, ModelError> {
        tier_of(self.charge)
    }

    /// Explicitly re-score the record. The only way charge changes outside
    /// of fusion.
    pub fn rescore(&mut self, charge: u8) -> Result<(), ModelError> {
        tier_of(charge)?;
        self.charge = charge;
        Ok(())
    }

    /// Re-route to a new destination: depth increases by exactly 1, the
    /// previous destination becomes the source of the next hop, and the
    /// record returns to `Pending` for re-enqueue.
    pub fn reroute_to(&mut self, new_destination: HandlerId) {
        self.depth += 1;
        self.sources = vec![std::mem::replace(&mut self.destination, new_destination)];
        self.status = RecordStatus::Pending;
        self.enqueued_at = None;
        self.processed_at = None;
    }
}
