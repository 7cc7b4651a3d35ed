//! Dispatch queue - bounded priority ordering with collision junctions.
//!
//! Ordering is priority descending, then arrival ascending: strict FIFO
//! within a priority band. Arrival order is tracked with a monotonic
//! sequence number so two records enqueued in the same instant still
//! dequeue in arrival order.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use record_model::{Priority, Record, RecordId, RecordStatus};

use crate::error::CoreError;

/// What happened to an accepted enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Stored as-is.
    Accepted(RecordId),
    /// Stored after evicting the given lowest-priority resident.
    Evicted { stored: RecordId, evicted: Record },
    /// Merged with a same-destination resident into a junction record.
    Merged {
        junction: RecordId,
        /// The resident record the junction absorbed.
        resident: RecordId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
    seq: u64,
    record: Record,
}

/// The bounded priority structure holding all pending records.
///
/// Not internally synchronized; the dispatcher owns it behind the core
/// state lock so enqueue/dequeue/evict are atomic with respect to each
/// other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchQueue {
    capacity: usize,
    entries: Vec<QueueEntry>,
    next_seq: u64,
    collisions: u64,
}

impl DispatchQueue {
    /// Create a queue with a fixed maximum size.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
            next_seq: 0,
            collisions: 0,
        }
    }

    /// Offer a record to the queue. Never blocks; returns immediately.
    ///
    /// Capacity policy on a full queue: a `Background` incomer is rejected;
    /// anything else evicts the single lowest-priority resident, unless that
    /// resident is of equal-or-higher priority than the incomer, in which
    /// case the incomer is rejected and the queue is left untouched.
    ///
    /// Two pending records sharing a destination are collision candidates
    /// and merge into a synthetic junction record (union of tags, max of
    /// charges, both source lists).
    pub fn enqueue(&mut self, mut record: Record) -> Result<EnqueueOutcome, CoreError> {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.record.destination == record.destination)
        {
            let resident = self.entries.remove(pos).record;
            let resident_id = resident.id;
            let junction = Self::make_junction(resident, record);
            let id = junction.id;
            self.push(junction);
            self.collisions += 1;
            tracing::debug!(junction = %id, "collision merged into junction record");
            return Ok(EnqueueOutcome::Merged {
                junction: id,
                resident: resident_id,
            });
        }

        if self.entries.len() >= self.capacity {
            let incoming = record.priority();
            if incoming == Priority::Background {
                return Err(CoreError::QueueFull);
            }

            let victim_pos = match self.eviction_candidate() {
                Some(pos) => pos,
                None => return Err(CoreError::QueueFull),
            };
            if self.entries[victim_pos].record.priority() >= incoming {
                return Err(CoreError::QueueFull);
            }

            let evicted = self.entries.remove(victim_pos).record;
            tracing::warn!(evicted = %evicted.id, "queue at capacity, evicted lowest-priority record");
            let stored = record.id;
            record.status = RecordStatus::Pending;
            record.enqueued_at = Some(Utc::now());
            self.push(record);
            return Ok(EnqueueOutcome::Evicted { stored, evicted });
        }

        let id = record.id;
        record.status = RecordStatus::Pending;
        record.enqueued_at = Some(Utc::now());
        self.push(record);
        Ok(EnqueueOutcome::Accepted(id))
    }

    /// Remove and return the highest-priority record, oldest first within a
    /// band. Explicit empty result; never blocks, never errors. The record
    /// comes back `Active` with `processed_at` stamped.
    pub fn dequeue(&mut self) -> Option<Record> {
        let pos = self
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.record.priority(), std::cmp::Reverse(e.seq)))
            .map(|(i, _)| i)?;

        let mut record = self.entries.remove(pos).record;
        record.status = RecordStatus::Active;
        record.processed_at = Some(Utc::now());
        Some(record)
    }

    /// Set the cooperative cancellation flag on a pending record.
    pub fn cancel(&mut self, id: RecordId) -> bool {
        match self.entries.iter_mut().find(|e| e.record.id == id) {
            Some(entry) => {
                entry.record.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Remove a specific pending record (e.g. claimed by a fusion).
    pub fn take(&mut self, id: RecordId) -> Option<Record> {
        let pos = self.entries.iter().position(|e| e.record.id == id)?;
        Some(self.entries.remove(pos).record)
    }

    /// Look at a pending record without removing it.
    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.entries.iter().find(|e| e.record.id == id).map(|e| &e.record)
    }

    /// Iterate over pending records in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue holds no pending records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The fixed maximum size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of collision merges performed so far.
    pub fn collision_count(&self) -> u64 {
        self.collisions
    }

    fn push(&mut self, record: Record) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueueEntry { seq, record });
    }

    /// The resident to evict: youngest within the lowest priority band, so
    /// the band keeps its FIFO head.
    fn eviction_candidate(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.record.priority(), std::cmp::Reverse(e.seq)))
            .map(|(i, _)| i)
    }

    /// Merge two same-destination records into one junction record.
    fn make_junction(a: Record, b: Record) -> Record {
        let mut junction = Record::new(a.source().clone(), a.destination.clone(), a.charge.max(b.charge));
        junction.sources = a.sources.iter().chain(b.sources.iter()).cloned().collect();
        junction.tags = a.tags.union(&b.tags).cloned().collect();
        junction.depth = a.depth.max(b.depth);
        junction.status = RecordStatus::Pending;
        junction.enqueued_at = Some(Utc::now());
        junction
    }
}
