//! Fusion engine - eligibility detection, merging, and time-boxed rollback.
//!
//! Constituents are never deleted: a fusion claims them, marks them `Fused`,
//! and keeps them so a revert can restore each one to its pre-fusion status
//! and charge. A fusion becomes permanent when its lock is set or its
//! rollback window elapses, whichever comes first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use record_model::{ChargeStrategy, FusedRecord, FusionId, Record, RecordId, RecordStatus};

use crate::error::CoreError;

/// How a fusion was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionMode {
    /// Detected by the engine during normal dispatch.
    Auto,
    /// Explicitly requested by a caller; eligibility still enforced.
    Invoked,
    /// Eligibility gate bypassed. Only for emergency consolidation; the
    /// bypass is always visible on the resulting record.
    Forced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FusionEntry {
    record: FusedRecord,
    /// Constituents with their pre-fusion status, kept verbatim for revert.
    constituents: Vec<(Record, RecordStatus)>,
}

/// Detects and executes reversible merges of high-significance records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionEngine {
    #[serde(with = "window_serde")]
    rollback_window: Duration,
    entries: HashMap<FusionId, FusionEntry>,
    fused_total: u64,
    reverted_total: u64,
}

impl FusionEngine {
    /// Create an engine with the given rollback window.
    pub fn new(rollback_window: Duration) -> Self {
        Self {
            rollback_window,
            entries: HashMap::new(),
            fused_total: 0,
            reverted_total: 0,
        }
    }

    /// Whether a pair of records passes the auto-detection gate:
    /// both charges >= 70 with at least 2 shared tags, or either charge
    /// >= 90 with at least 1 shared tag.
    pub fn eligible_pair(a: &Record, b: &Record) -> bool {
        let overlap = a.tag_overlap(b);
        if a.charge >= 90 || b.charge >= 90 {
            return overlap >= 1;
        }
        a.charge >= 70 && b.charge >= 70 && overlap >= 2
    }

    /// Pick the best fusion partner for a record from a candidate pool:
    /// the eligible candidate with the largest tag overlap, charge as the
    /// tie-break.
    pub fn best_candidate<'a>(
        record: &Record,
        pool: impl Iterator<Item = &'a Record>,
    ) -> Option<RecordId> {
        pool.filter(|c| c.id != record.id)
            .filter(|c| Self::eligible_pair(record, c))
            .max_by_key(|c| (record.tag_overlap(c), c.charge))
            .map(|c| c.id)
    }

    /// Validate a prospective fusion without claiming anything: at least two
    /// records, every constituent still claimable (`Pending` or `Active` -
    /// the compare-and-set side of the merge), and the eligibility gate for
    /// non-forced modes.
    pub fn check(mode: FusionMode, records: &[&Record]) -> Result<(), CoreError> {
        if records.len() < 2 {
            return Err(CoreError::FusionIneligible(
                "fusion requires at least two records".to_string(),
            ));
        }

        for record in records {
            if !matches!(record.status, RecordStatus::Pending | RecordStatus::Active) {
                return Err(CoreError::FusionIneligible(format!(
                    "record {} is {} and cannot be claimed",
                    record.id, record.status
                )));
            }
        }

        if mode != FusionMode::Forced {
            Self::check_gate(records)?;
        }
        Ok(())
    }

    /// Merge records into a fused result.
    ///
    /// Each constituent must still be claimable (`Pending` or `Active`);
    /// a record already taken by a concurrent fusion or terminated aborts
    /// the merge with nothing claimed. `Forced` mode skips the eligibility
    /// gate and marks the result accordingly.
    pub fn fuse(
        &mut self,
        mode: FusionMode,
        strategy: ChargeStrategy,
        records: Vec<Record>,
    ) -> Result<FusedRecord, CoreError> {
        Self::check(mode, &records.iter().collect::<Vec<_>>())?;

        let charges: Vec<u8> = records.iter().map(|r| r.charge).collect();
        let fused_at = Utc::now();
        let fused = FusedRecord {
            id: FusionId::new(),
            constituents: records.iter().map(|r| r.id).collect(),
            charge: strategy.combine(&charges),
            tags: records.iter().flat_map(|r| r.tags.iter().cloned()).collect(),
            strategy,
            fused_at,
            expires_at: fused_at + self.rollback_window,
            lock: false,
            forced: mode == FusionMode::Forced,
        };

        let constituents = records
            .into_iter()
            .map(|mut r| {
                let prior = r.status;
                r.status = RecordStatus::Fused;
                (r, prior)
            })
            .collect();

        self.entries.insert(
            fused.id,
            FusionEntry {
                record: fused.clone(),
                constituents,
            },
        );
        self.fused_total += 1;
        tracing::debug!(fusion = %fused.id, mode = ?mode, "records fused");

        Ok(fused)
    }

    /// Revert a fusion, restoring each constituent to its pre-fusion status
    /// and charge. Fails with `FusionLocked` once the lock is set or the
    /// rollback window has elapsed; the fusion is left untouched.
    pub fn revert(&mut self, id: FusionId, now: DateTime<Utc>) -> Result<Vec<Record>, CoreError> {
        let mut entry = self
            .entries
            .remove(&id)
            .ok_or_else(|| CoreError::FusionIneligible(format!("unknown fusion {}", id)))?;

        if !entry.record.is_revertible(now) {
            // Lazy expiry: an elapsed window is the same as an explicit lock.
            entry.record.lock = true;
            self.entries.insert(id, entry);
            return Err(CoreError::FusionLocked);
        }

        self.reverted_total += 1;
        tracing::debug!(fusion = %id, "fusion reverted");

        Ok(entry
            .constituents
            .into_iter()
            .map(|(mut record, prior)| {
                record.status = prior;
                record
            })
            .collect())
    }

    /// Make a fusion permanent. One-way; idempotent.
    pub fn lock(&mut self, id: FusionId) -> Result<(), CoreError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| CoreError::FusionIneligible(format!("unknown fusion {}", id)))?;
        entry.record.lock();
        Ok(())
    }

    /// Eagerly lock every fusion whose rollback window has elapsed.
    /// Returns the ids that became permanent in this sweep.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<FusionId> {
        let mut locked = Vec::new();
        for entry in self.entries.values_mut() {
            if !entry.record.lock && now >= entry.record.expires_at {
                entry.record.lock = true;
                locked.push(entry.record.id);
            }
        }
        locked
    }

    /// Open rollback windows: fusion id -> expiry. Captured in snapshots.
    pub fn open_windows(&self) -> HashMap<FusionId, DateTime<Utc>> {
        self.entries
            .values()
            .filter(|e| !e.record.lock)
            .map(|e| (e.record.id, e.record.expires_at))
            .collect()
    }

    /// Look up a fusion result.
    pub fn get(&self, id: FusionId) -> Option<&FusedRecord> {
        self.entries.get(&id).map(|e| &e.record)
    }

    /// Total fusions performed.
    pub fn fused_count(&self) -> u64 {
        self.fused_total
    }

    /// Total fusions reverted.
    pub fn revert_count(&self) -> u64 {
        self.reverted_total
    }

    fn check_gate(records: &[&Record]) -> Result<(), CoreError> {
        for (i, a) in records.iter().enumerate() {
            for b in records.iter().skip(i + 1) {
                if Self::eligible_pair(a, b) {
                    return Ok(());
                }
            }
        }
        Err(CoreError::FusionIneligible(
            "no record pair meets the charge/overlap criteria".to_string(),
        ))
    }
}

mod window_serde {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(window: &Duration, s: S) -> Result<S::Ok, S::Error> {
        window.num_seconds().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let seconds = i64::deserialize(d)?;
        Ok(Duration::seconds(seconds))
    }
}
