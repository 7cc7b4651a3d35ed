//! Dispatcher - the orchestrating cycle and the one owner of shared state.
//!
//! A cycle: dequeue the highest-priority record, run the depth ladder,
//! invoke the destination handler, then either re-enqueue a re-route or
//! complete the record and scan for auto-fusion partners. Every state change
//! a cycle produces is appended to the log sink before the cycle returns.
//!
//! Multiple workers may drive `tick` concurrently; all queue, chain, and
//! fusion mutation happens under one `CoreState` lock, the halt flag is an
//! atomic checked at the top of every cycle, and handler invocation happens
//! outside the lock.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use record_model::{
    tier_of, ChargeStrategy, FusionId, HandlerId, LogEntry, Record, RecordId, RecordStatus,
    Transition,
};

use crate::chain::ChainTable;
use crate::depth::{DepthGuard, DepthLimit};
use crate::error::CoreError;
use crate::fusion::{FusionEngine, FusionMode};
use crate::hooks::{
    AlertSink, HandlerCall, HandlerRegistry, HandlerResponse, LogSink, ReviewSink, StorageSink,
};
use crate::queue::{DispatchQueue, EnqueueOutcome};
use crate::snapshot::{CoreMetrics, CoreSnapshot};

/// Tunables for the core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Fixed maximum size of the dispatch queue.
    pub queue_capacity: usize,

    /// Budget for one handler invocation. An over-budget response is treated
    /// as a failure result, never as a success.
    pub handler_timeout: Duration,

    /// How long a fusion stays revertible.
    pub rollback_window: chrono::Duration,

    /// Whether terminal results trigger the auto-fusion scan.
    pub auto_fusion: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            handler_timeout: Duration::from_secs(30),
            rollback_window: chrono::Duration::days(7),
            auto_fusion: true,
        }
    }
}

/// What one dispatcher cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The queue was empty.
    Idle,
    /// A record reached a terminal result (and possibly fused).
    Completed {
        record: RecordId,
        fused: Option<FusionId>,
    },
    /// A record was re-enqueued under a new destination.
    Rerouted(RecordId),
    /// The standard depth ceiling paused a record into manual review.
    Escalated(RecordId),
    /// A record was force-terminated (depth, deadlock, fault, cancellation).
    Terminated {
        record: RecordId,
        status: RecordStatus,
    },
    /// The absolute ceiling fired; the core is now halted.
    Panicked(RecordId),
}

struct CoreInner {
    queue: DispatchQueue,
    chains: ChainTable,
    fusion: FusionEngine,
    /// Records that reached a terminal result; still fusion candidates.
    completed: HashMap<RecordId, Record>,
    /// Records the core force-terminated, kept for inspection.
    terminated: HashMap<RecordId, Record>,
    completed_total: u64,
    terminated_total: u64,
}

/// The single owner of all shared mutable state. Workers hold it through an
/// `Arc`; there are no ambient singletons.
pub struct CoreState {
    inner: Mutex<CoreInner>,
    halted: AtomicBool,
}

impl CoreState {
    fn new(config: &CoreConfig) -> Self {
        Self {
            inner: Mutex::new(CoreInner {
                queue: DispatchQueue::new(config.queue_capacity),
                chains: ChainTable::new(),
                fusion: FusionEngine::new(config.rollback_window),
                completed: HashMap::new(),
                terminated: HashMap::new(),
                completed_total: 0,
                terminated_total: 0,
            }),
            halted: AtomicBool::new(false),
        }
    }

    /// Whether the core is suspended by a panic-stop.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

/// The orchestrating loop. The only component with side effects that cross
/// the core boundary.
pub struct Dispatcher {
    config: CoreConfig,
    state: Arc<CoreState>,
    registry: HandlerRegistry,
    log: Arc<dyn LogSink>,
    review: Option<Arc<dyn ReviewSink>>,
    storage: Option<Arc<dyn StorageSink>>,
    alerts: Mutex<HashMap<HandlerId, Vec<Arc<dyn AlertSink>>>>,
}

impl Dispatcher {
    /// Create a dispatcher over a handler registry and a log sink.
    pub fn new(config: CoreConfig, registry: HandlerRegistry, log: Arc<dyn LogSink>) -> Self {
        let state = Arc::new(CoreState::new(&config));
        Self {
            config,
            state,
            registry,
            log,
            review: None,
            storage: None,
            alerts: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the manual-review collaborator.
    pub fn with_review_sink(mut self, sink: Arc<dyn ReviewSink>) -> Self {
        self.review = Some(sink);
        self
    }

    /// Attach the long-term storage collaborator.
    pub fn with_storage_sink(mut self, sink: Arc<dyn StorageSink>) -> Self {
        self.storage = Some(sink);
        self
    }

    /// Subscribe an alert sink to emergency terminations touching a handler.
    pub fn subscribe_alerts(&self, destination: impl Into<HandlerId>, sink: Arc<dyn AlertSink>) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.entry(destination.into()).or_default().push(sink);
        }
    }

    /// Shared state handle, for callers coordinating multiple workers.
    pub fn state(&self) -> Arc<CoreState> {
        Arc::clone(&self.state)
    }

    /// Accept a validated record into the queue.
    ///
    /// Fails fast with `InvalidRecord` when the upstream contract is broken:
    /// charge above 100, an empty destination, or a destination that names no
    /// registered handler. Returns the id to track - the junction's id if the
    /// record collided with a same-destination resident.
    pub fn submit(&self, record: Record) -> Result<RecordId, CoreError> {
        if self.state.is_halted() {
            return Err(CoreError::PanicHalted);
        }
        tier_of(record.charge).map_err(|e| CoreError::InvalidRecord(e.to_string()))?;
        if record.destination.is_empty() {
            return Err(CoreError::InvalidRecord("empty destination".to_string()));
        }
        if !self.registry.contains(&record.destination) {
            return Err(CoreError::InvalidRecord(format!(
                "destination '{}' names no registered handler",
                record.destination
            )));
        }

        let mut inner = self.lock_inner();
        let id = record.id;
        inner
            .chains
            .record_hop(id, record.source().clone(), record.destination.clone())?;

        let outcome = match inner.queue.enqueue(record) {
            Ok(outcome) => outcome,
            Err(err) => {
                inner.chains.remove(id);
                return Err(err);
            }
        };
        match outcome {
            EnqueueOutcome::Accepted(id) => {
                self.log
                    .append(LogEntry::new(id, Transition::Enqueue, None, Some(RecordStatus::Pending)));
                tracing::debug!(record = %id, "record enqueued");
                Ok(id)
            }
            EnqueueOutcome::Evicted { stored, evicted } => {
                self.log.append(
                    LogEntry::new(stored, Transition::Enqueue, None, Some(RecordStatus::Pending))
                        .with_detail("evicted", json!(evicted.id.to_string())),
                );
                self.terminate_record(&mut inner, evicted, "evicted at capacity");
                Ok(stored)
            }
            EnqueueOutcome::Merged { junction, resident } => {
                inner.chains.remove(id);
                inner.chains.remove(resident);
                self.log.append(
                    LogEntry::new(junction, Transition::Enqueue, None, Some(RecordStatus::Pending))
                        .with_detail("junction", json!(true))
                        .with_detail("merged", json!([id.to_string(), resident.to_string()])),
                );
                tracing::debug!(record = %id, junction = %junction, "collision junction enqueued");
                Ok(junction)
            }
        }
    }

    /// Run one dispatcher cycle. Fails only with `PanicHalted`; every other
    /// failure mode is absorbed into a status change and reported through
    /// the outcome.
    pub fn tick(&self) -> Result<TickOutcome, CoreError> {
        if self.state.is_halted() {
            return Err(CoreError::PanicHalted);
        }

        let record = {
            let mut inner = self.lock_inner();
            match inner.queue.dequeue() {
                Some(record) => record,
                None => return Ok(TickOutcome::Idle),
            }
        };

        self.log.append(LogEntry::new(
            record.id,
            Transition::Dequeue,
            Some(RecordStatus::Pending),
            Some(RecordStatus::Active),
        ));

        // Cooperative cancellation, checked between cycles only.
        if record.cancelled {
            let id = record.id;
            let mut inner = self.lock_inner();
            self.terminate_record(&mut inner, record, "cancelled");
            return Ok(TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            });
        }

        if let Some(limit) = DepthGuard::evaluate(record.depth, &record.tags) {
            return Ok(self.apply_depth_breach(record, limit));
        }

        let call = HandlerCall::from_record(&record);
        let handler = match self.registry.get(&record.destination) {
            Some(handler) => handler,
            None => {
                let id = record.id;
                let mut inner = self.lock_inner();
                self.terminate_record(&mut inner, record, "destination no longer registered");
                return Ok(TickOutcome::Terminated {
                    record: id,
                    status: RecordStatus::TerminatedIncomplete,
                });
            }
        };

        // The call runs on its own thread so an unresponsive handler cannot
        // wedge the worker; it is never interrupted, only abandoned. The
        // record must never linger in `Active` on a timeout.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(handler.invoke(call));
        });
        let response = match rx.recv_timeout(self.config.handler_timeout) {
            Ok(response) => response,
            Err(_) => Err(crate::hooks::HandlerError(format!(
                "no response within {:?}",
                self.config.handler_timeout
            ))),
        };

        match response {
            Ok(HandlerResponse::Terminal(result)) => Ok(self.complete_record(record, result)),
            Ok(HandlerResponse::Reroute(new_destination)) => {
                Ok(self.reroute_record(record, new_destination))
            }
            Err(fault) => {
                let id = record.id;
                tracing::warn!(record = %id, fault = %fault, "handler fault");
                let mut inner = self.lock_inner();
                self.terminate_record(&mut inner, record, &format!("handler fault: {}", fault));
                Ok(TickOutcome::Terminated {
                    record: id,
                    status: RecordStatus::TerminatedIncomplete,
                })
            }
        }
    }

    /// Set the cooperative cancellation flag on a pending record.
    pub fn cancel(&self, id: RecordId) -> bool {
        self.lock_inner().queue.cancel(id)
    }

    /// Explicitly request a fusion of two records (pending or completed).
    /// Eligibility is enforced unless `Forced`; a forced merge records the
    /// bypass in the log.
    pub fn request_fusion(
        &self,
        first: RecordId,
        second: RecordId,
        strategy: ChargeStrategy,
        mode: FusionMode,
    ) -> Result<FusionId, CoreError> {
        if self.state.is_halted() {
            return Err(CoreError::PanicHalted);
        }

        let mut inner = self.lock_inner();

        let find = |inner: &CoreInner, id: RecordId| -> Option<Record> {
            inner
                .queue
                .get(id)
                .cloned()
                .or_else(|| inner.completed.get(&id).cloned())
        };
        let a = find(&inner, first)
            .ok_or_else(|| CoreError::FusionIneligible(format!("unknown record {}", first)))?;
        let b = find(&inner, second)
            .ok_or_else(|| CoreError::FusionIneligible(format!("unknown record {}", second)))?;

        FusionEngine::check(mode, &[&a, &b])?;

        // Claim both only after the gate passed.
        let a = self.claim(&mut inner, first).unwrap_or(a);
        let b = self.claim(&mut inner, second).unwrap_or(b);
        self.finish_fusion(&mut inner, mode, strategy, vec![a, b])
    }

    /// Revert a fusion: constituents return to their pre-fusion status
    /// (pending ones re-enter the queue) and the fused record is destroyed.
    pub fn revert_fusion(&self, id: FusionId) -> Result<Vec<RecordId>, CoreError> {
        let mut inner = self.lock_inner();
        let restored = inner.fusion.revert(id, Utc::now())?;

        let mut ids = Vec::with_capacity(restored.len());
        for record in restored {
            ids.push(record.id);
            self.log.append(
                LogEntry::new(
                    record.id,
                    Transition::RevertFuse,
                    Some(RecordStatus::Fused),
                    Some(record.status),
                )
                .with_detail("fusion", json!(id.to_string())),
            );
            match record.status {
                RecordStatus::Pending => {
                    // A full queue cannot absorb the rollback; park the
                    // record with the completed set rather than lose it.
                    if inner.queue.enqueue(record.clone()).is_err() {
                        inner.completed.insert(record.id, record);
                    }
                }
                _ => {
                    inner.completed.insert(record.id, record);
                }
            }
        }
        Ok(ids)
    }

    /// Make a fusion permanent.
    pub fn lock_fusion(&self, id: FusionId) -> Result<(), CoreError> {
        self.lock_inner().fusion.lock(id)
    }

    /// Eagerly lock fusions whose rollback window elapsed.
    pub fn sweep_fusions(&self) -> Vec<FusionId> {
        self.lock_inner().fusion.sweep_expired(Utc::now())
    }

    /// Look up a fusion result.
    pub fn fusion(&self, id: FusionId) -> Option<record_model::FusedRecord> {
        self.lock_inner().fusion.get(id).cloned()
    }

    /// Current observability counters.
    pub fn metrics(&self) -> CoreMetrics {
        let inner = self.lock_inner();
        CoreMetrics {
            collisions: inner.queue.collision_count(),
            deadlocks: inner.chains.deadlock_count(),
            fusions: inner.fusion.fused_count(),
            reverts: inner.fusion.revert_count(),
            completed: inner.completed_total,
            terminated: inner.terminated_total,
        }
    }

    /// Capture a full-state snapshot.
    pub fn snapshot(&self) -> CoreSnapshot {
        let inner = self.lock_inner();
        self.build_snapshot(&inner)
    }

    /// Rebuild the pending queue and chain table from a snapshot, e.g. after
    /// a process restart. Fusion windows in the snapshot are informational;
    /// live fusions do not survive a restart.
    pub fn restore(&self, snapshot: CoreSnapshot) -> Result<(), CoreError> {
        let mut inner = self.lock_inner();
        inner.queue = DispatchQueue::new(self.config.queue_capacity);
        inner.chains = snapshot.chains;
        for record in snapshot.pending {
            inner.queue.enqueue(record)?;
        }
        Ok(())
    }

    /// Lift the panic halt after manual intervention.
    pub fn resume(&self) {
        self.state.halted.store(false, Ordering::SeqCst);
        tracing::warn!("core resumed after panic halt");
    }

    fn lock_inner(&self) -> MutexGuard<'_, CoreInner> {
        match self.state.inner.lock() {
            Ok(guard) => guard,
            // A worker that panicked mid-cycle must not wedge the core.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pull a record out of the pending queue or the completed set.
    fn claim(&self, inner: &mut CoreInner, id: RecordId) -> Option<Record> {
        inner
            .queue
            .take(id)
            .or_else(|| inner.completed.remove(&id))
    }

    fn finish_fusion(
        &self,
        inner: &mut CoreInner,
        mode: FusionMode,
        strategy: ChargeStrategy,
        records: Vec<Record>,
    ) -> Result<FusionId, CoreError> {
        let priors: Vec<(RecordId, RecordStatus)> =
            records.iter().map(|r| (r.id, r.status)).collect();
        let fused = inner.fusion.fuse(mode, strategy, records)?;

        for (record_id, prior) in priors {
            inner.chains.remove(record_id);
            self.log.append(
                LogEntry::new(record_id, Transition::Fuse, Some(prior), Some(RecordStatus::Fused))
                    .with_detail("fusion", json!(fused.id.to_string()))
                    .with_detail("strategy", json!(format!("{:?}", strategy)))
                    .with_detail("forced", json!(fused.forced)),
            );
        }
        tracing::debug!(fusion = %fused.id, charge = fused.charge, "fusion completed");
        Ok(fused.id)
    }

    fn complete_record(&self, record: Record, result: String) -> TickOutcome {
        let id = record.id;
        let mut inner = self.lock_inner();
        inner.chains.remove(id);
        inner.completed_total += 1;
        inner.completed.insert(id, record);

        let mut fused_id = None;
        if self.config.auto_fusion {
            fused_id = self.try_auto_fusion(&mut inner, id);
        }
        tracing::debug!(record = %id, result = %result, "record completed");
        TickOutcome::Completed {
            record: id,
            fused: fused_id,
        }
    }

    /// Scan pending and completed records for an eligible partner and fuse
    /// under the default strategy. A pending partner is pulled straight out
    /// of the queue; taking it is the claim.
    fn try_auto_fusion(&self, inner: &mut CoreInner, id: RecordId) -> Option<FusionId> {
        let record = inner.completed.get(&id)?.clone();
        let partner_id = FusionEngine::best_candidate(
            &record,
            inner.completed.values().chain(inner.queue.iter()),
        )?;

        let record = self.claim(inner, id)?;
        let partner = match self.claim(inner, partner_id) {
            Some(partner) => partner,
            None => {
                inner.completed.insert(record.id, record);
                return None;
            }
        };

        match self.finish_fusion(
            inner,
            FusionMode::Auto,
            ChargeStrategy::default(),
            vec![record.clone(), partner.clone()],
        ) {
            Ok(fusion) => Some(fusion),
            Err(_) => {
                // Hand both constituents back where they came from.
                for rec in [record, partner] {
                    if rec.status == RecordStatus::Pending
                        && inner.queue.enqueue(rec.clone()).is_ok()
                    {
                        continue;
                    }
                    inner.completed.insert(rec.id, rec);
                }
                None
            }
        }
    }

    fn reroute_record(&self, mut record: Record, new_destination: HandlerId) -> TickOutcome {
        let id = record.id;

        if new_destination.is_empty() || !self.registry.contains(&new_destination) {
            let mut inner = self.lock_inner();
            self.terminate_record(
                &mut inner,
                record,
                &format!("reroute to unregistered destination '{}'", new_destination),
            );
            return TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            };
        }

        record.reroute_to(new_destination);

        let mut inner = self.lock_inner();
        let hop_check = inner.chains.record_hop(
            id,
            record.source().clone(),
            record.destination.clone(),
        );
        if hop_check.is_err() {
            // Deadlocked chain: terminate and hand over for manual
            // adjudication instead of retrying.
            tracing::warn!(record = %id, "routing chain deadlocked");
            let for_review = record.clone();
            self.terminate_record(&mut inner, record, "deadlocked chain");
            drop(inner);
            if let Some(review) = &self.review {
                review.review(&for_review, "deadlocked chain");
            }
            return TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            };
        }

        let fallback = record.clone();
        match inner.queue.enqueue(record) {
            Ok(outcome) => {
                let stored = match &outcome {
                    EnqueueOutcome::Accepted(id) => *id,
                    EnqueueOutcome::Merged { junction, resident } => {
                        // The junction starts a fresh chain; neither merged
                        // record's history survives.
                        inner.chains.remove(id);
                        inner.chains.remove(*resident);
                        *junction
                    }
                    EnqueueOutcome::Evicted { stored, .. } => *stored,
                };
                if let EnqueueOutcome::Evicted { evicted, .. } = outcome {
                    self.log.append(
                        LogEntry::new(stored, Transition::Enqueue, Some(RecordStatus::Active), Some(RecordStatus::Pending))
                            .with_detail("evicted", json!(evicted.id.to_string())),
                    );
                    self.terminate_record(&mut inner, evicted, "evicted at capacity");
                } else {
                    self.log.append(LogEntry::new(
                        stored,
                        Transition::Enqueue,
                        Some(RecordStatus::Active),
                        Some(RecordStatus::Pending),
                    ));
                }
                tracing::debug!(record = %id, "record rerouted");
                TickOutcome::Rerouted(id)
            }
            Err(_) => {
                // The queue cannot absorb the reroute; terminate rather than
                // lose the record silently.
                self.terminate_record(&mut inner, fallback, "queue full on reroute");
                TickOutcome::Terminated {
                    record: id,
                    status: RecordStatus::TerminatedIncomplete,
                }
            }
        }
    }

    fn apply_depth_breach(&self, mut record: Record, limit: DepthLimit) -> TickOutcome {
        let id = record.id;
        tracing::warn!(record = %id, limit = %limit, depth = record.depth, "depth ceiling breached");

        match limit {
            DepthLimit::Standard => {
                // Paused, not terminated: the manual reviewer owns it now.
                self.log.append(
                    LogEntry::new(id, Transition::DepthEscalate, Some(RecordStatus::Active), Some(RecordStatus::Active))
                        .with_detail("limit", json!(limit.to_string()))
                        .with_detail("depth", json!(record.depth)),
                );
                let mut inner = self.lock_inner();
                inner.chains.remove(id);
                drop(inner);
                if let Some(review) = &self.review {
                    review.review(&record, "standard depth ceiling");
                }
                TickOutcome::Escalated(id)
            }
            DepthLimit::Extended => {
                record.status = RecordStatus::TerminatedIncomplete;
                self.log.append(
                    LogEntry::new(id, Transition::DepthEscalate, Some(RecordStatus::Active), Some(record.status))
                        .with_detail("limit", json!(limit.to_string()))
                        .with_detail("depth", json!(record.depth)),
                );
                if let Some(storage) = &self.storage {
                    storage.store(&record, record.payload_ref.as_deref());
                }
                let mut inner = self.lock_inner();
                inner.chains.remove(id);
                inner.terminated_total += 1;
                inner.terminated.insert(id, record);
                TickOutcome::Terminated {
                    record: id,
                    status: RecordStatus::TerminatedIncomplete,
                }
            }
            DepthLimit::Emergency => {
                record.status = RecordStatus::TerminatedEmergency;
                self.log.append(
                    LogEntry::new(id, Transition::DepthEscalate, Some(RecordStatus::Active), Some(record.status))
                        .with_detail("limit", json!(limit.to_string()))
                        .with_detail("depth", json!(record.depth)),
                );
                let mut inner = self.lock_inner();
                let mut history = inner.chains.destination_history(id);
                history.push(record.destination.clone());
                let mut seen = std::collections::HashSet::new();
                history.retain(|h| seen.insert(h.clone()));
                inner.chains.remove(id);
                inner.terminated_total += 1;
                inner.terminated.insert(id, record.clone());
                drop(inner);

                // Fan out to everything registered against the destination
                // history of this record.
                if let Ok(alerts) = self.alerts.lock() {
                    for destination in &history {
                        if let Some(sinks) = alerts.get(destination) {
                            for sink in sinks {
                                sink.notify(destination, &record);
                            }
                        }
                    }
                }
                TickOutcome::Terminated {
                    record: id,
                    status: RecordStatus::TerminatedEmergency,
                }
            }
            DepthLimit::Absolute => {
                record.status = RecordStatus::Panicked;
                let mut inner = self.lock_inner();
                inner.chains.remove(id);
                inner.terminated_total += 1;
                inner.terminated.insert(id, record);

                // Barrier: raise the flag first, then persist the snapshot.
                // Workers finish their current cycle and fail before their
                // next dequeue.
                self.state.halted.store(true, Ordering::SeqCst);
                let snapshot = self.build_snapshot(&inner);
                drop(inner);
                self.log.snapshot(&snapshot);
                self.log.append(
                    LogEntry::new(id, Transition::Panic, Some(RecordStatus::Active), Some(RecordStatus::Panicked))
                        .with_detail("limit", json!(limit.to_string())),
                );
                tracing::error!(record = %id, "absolute depth ceiling breached, core halted");
                TickOutcome::Panicked(id)
            }
        }
    }

    fn terminate_record(&self, inner: &mut CoreInner, mut record: Record, reason: &str) {
        let id = record.id;
        let before = record.status;
        record.status = RecordStatus::TerminatedIncomplete;
        self.log.append(
            LogEntry::new(id, Transition::Terminate, Some(before), Some(record.status))
                .with_detail("reason", json!(reason)),
        );
        inner.chains.remove(id);
        inner.terminated_total += 1;
        inner.terminated.insert(id, record);
    }

    fn build_snapshot(&self, inner: &CoreInner) -> CoreSnapshot {
        CoreSnapshot {
            taken_at: Utc::now(),
            halted: self.state.is_halted(),
            pending: inner.queue.iter().cloned().collect(),
            chains: inner.chains.clone(),
            fusion_windows: inner.fusion.open_windows(),
            metrics: CoreMetrics {
                collisions: inner.queue.collision_count(),
                deadlocks: inner.chains.deadlock_count(),
                fusions: inner.fusion.fused_count(),
                reverts: inner.fusion.revert_count(),
                completed: inner.completed_total,
                terminated: inner.terminated_total,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Handler, HandlerError, MemoryLog, MemoryReview};
    use record_model::Tag;

    struct Terminal;

    impl Handler for Terminal {
        fn invoke(&self, call: HandlerCall) -> Result<HandlerResponse, HandlerError> {
            Ok(HandlerResponse::Terminal(format!("handled {}", call.id)))
        }
    }

    struct Router(&'static str);

    impl Handler for Router {
        fn invoke(&self, _call: HandlerCall) -> Result<HandlerResponse, HandlerError> {
            Ok(HandlerResponse::Reroute(HandlerId::new(self.0)))
        }
    }

    struct Faulty;

    impl Handler for Faulty {
        fn invoke(&self, _call: HandlerCall) -> Result<HandlerResponse, HandlerError> {
            Err(HandlerError("backend unavailable".to_string()))
        }
    }

    struct Slow;

    impl Handler for Slow {
        fn invoke(&self, _call: HandlerCall) -> Result<HandlerResponse, HandlerError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(HandlerResponse::Terminal("late".to_string()))
        }
    }

    #[derive(Default)]
    struct MemoryAlert {
        hits: Mutex<Vec<(HandlerId, RecordId)>>,
    }

    impl crate::hooks::AlertSink for MemoryAlert {
        fn notify(&self, destination: &HandlerId, record: &Record) {
            if let Ok(mut hits) = self.hits.lock() {
                hits.push((destination.clone(), record.id));
            }
        }
    }

    #[derive(Default)]
    struct MemoryStorage {
        stored: Mutex<Vec<RecordId>>,
    }

    impl crate::hooks::StorageSink for MemoryStorage {
        fn store(&self, record: &Record, _partial: Option<&str>) {
            if let Ok(mut stored) = self.stored.lock() {
                stored.push(record.id);
            }
        }
    }

    fn build(
        config: CoreConfig,
        handlers: Vec<(&str, Box<dyn Handler>)>,
    ) -> (Dispatcher, Arc<MemoryLog>) {
        let mut registry = HandlerRegistry::new();
        for (name, handler) in handlers {
            registry.register(name, handler);
        }
        let log = Arc::new(MemoryLog::new());
        let dispatcher = Dispatcher::new(config, registry, log.clone());
        (dispatcher, log)
    }

    #[test]
    fn test_submit_enforces_upstream_contract() {
        let (dispatcher, _) = build(CoreConfig::default(), vec![("sink", Box::new(Terminal))]);

        let over = Record::new("src", "sink", 101);
        assert!(matches!(
            dispatcher.submit(over),
            Err(CoreError::InvalidRecord(_))
        ));

        let empty = Record::new("src", "", 50);
        assert!(matches!(
            dispatcher.submit(empty),
            Err(CoreError::InvalidRecord(_))
        ));

        let unknown = Record::new("src", "nowhere", 50);
        assert!(matches!(
            dispatcher.submit(unknown),
            Err(CoreError::InvalidRecord(_))
        ));

        assert!(dispatcher.submit(Record::new("src", "sink", 50)).is_ok());
    }

    #[test]
    fn test_end_to_end_dispatch_order_across_bands() {
        // Auto-fusion off so every record runs its own full cycle.
        let config = CoreConfig {
            auto_fusion: false,
            ..Default::default()
        };
        let (dispatcher, _) = build(
            config,
            vec![
                ("alpha", Box::new(Terminal)),
                ("beta", Box::new(Terminal)),
                ("gamma", Box::new(Terminal)),
            ],
        );

        let critical = Record::new("src", "alpha", 90)
            .with_tags([Tag::label("x"), Tag::label("y")]);
        let standard = Record::new("src", "beta", 65)
            .with_tags([Tag::label("x"), Tag::label("y")]);
        let background = Record::new("src", "gamma", 40).with_tag(Tag::label("z"));
        let expected = [critical.id, standard.id, background.id];

        // Scrambled arrival order; dequeue order is 90, 65, 40.
        dispatcher.submit(background).unwrap();
        dispatcher.submit(standard).unwrap();
        dispatcher.submit(critical).unwrap();

        for id in expected {
            assert_eq!(
                dispatcher.tick().unwrap(),
                TickOutcome::Completed {
                    record: id,
                    fused: None,
                }
            );
        }
        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Idle);
        assert_eq!(dispatcher.metrics().completed, 3);
    }

    #[test]
    fn test_critical_auto_fuse_matches_pending_record() {
        let (dispatcher, log) = build(
            CoreConfig::default(),
            vec![("alpha", Box::new(Terminal)), ("beta", Box::new(Terminal))],
        );

        let critical = Record::new("src", "alpha", 90)
            .with_tags([Tag::label("x"), Tag::label("y")]);
        let standard = Record::new("src", "beta", 65)
            .with_tags([Tag::label("x"), Tag::label("y")]);
        let (critical_id, standard_id) = (critical.id, standard.id);
        dispatcher.submit(standard).unwrap();
        dispatcher.submit(critical).unwrap();

        // The 90 record completes first and immediately claims the still-
        // pending 65: shared tags {x, y}, one charge >= 90.
        match dispatcher.tick().unwrap() {
            TickOutcome::Completed { record, fused } => {
                assert_eq!(record, critical_id);
                let fusion = dispatcher.fusion(fused.expect("auto fusion")).unwrap();
                assert_eq!(fusion.charge, 90); // default InheritedMax
                assert!(fusion.constituents.contains(&critical_id));
                assert!(fusion.constituents.contains(&standard_id));
            }
            other => panic!("expected completion, got {:?}", other),
        }

        // The pending partner left the queue with the fusion.
        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Idle);
        assert_eq!(dispatcher.metrics().fusions, 1);

        let fuse_entries = log
            .entries()
            .iter()
            .filter(|e| e.transition == Transition::Fuse)
            .count();
        assert_eq!(fuse_entries, 2);
    }

    #[test]
    fn test_reroute_increments_depth_exactly_once() {
        let (dispatcher, _) = build(
            CoreConfig::default(),
            vec![("relay", Box::new(Router("sink"))), ("sink", Box::new(Terminal))],
        );

        let record = Record::new("src", "relay", 55);
        let id = record.id;
        dispatcher.submit(record).unwrap();

        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Rerouted(id));
        match dispatcher.tick().unwrap() {
            TickOutcome::Completed { record, .. } => assert_eq!(record, id),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_reroute_collision_drops_both_chains() {
        let (dispatcher, _) = build(
            CoreConfig::default(),
            vec![("relay", Box::new(Router("shared"))), ("shared", Box::new(Terminal))],
        );

        let resident = Record::new("one", "shared", 50).with_tag(Tag::label("x"));
        let incoming = Record::new("two", "relay", 80).with_tag(Tag::label("y"));
        dispatcher.submit(resident).unwrap();
        let incoming_id = dispatcher.submit(incoming).unwrap();

        // The 80 dequeues first and reroutes into the resident's
        // destination, merging into a junction.
        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Rerouted(incoming_id));
        assert_eq!(dispatcher.metrics().collisions, 1);

        // Neither merged record's chain survives the junction.
        assert!(dispatcher.snapshot().chains.is_empty());
    }

    #[test]
    fn test_deadlock_detected_on_second_pair_occurrence() {
        let review = Arc::new(MemoryReview::new());
        let (dispatcher, _) = build(
            CoreConfig::default(),
            vec![("a", Box::new(Router("b"))), ("b", Box::new(Router("a")))],
        );
        let dispatcher = dispatcher.with_review_sink(review.clone());

        // Chain a -> b -> a -> b: the second (a, b) hop is the deadlock.
        let record = Record::new("a", "b", 60);
        let id = record.id;
        dispatcher.submit(record).unwrap();

        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Rerouted(id));
        assert_eq!(
            dispatcher.tick().unwrap(),
            TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            }
        );

        assert_eq!(dispatcher.metrics().deadlocks, 1);
        let received = review.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, id);
    }

    #[test]
    fn test_handler_fault_terminates_record() {
        let (dispatcher, log) = build(CoreConfig::default(), vec![("broken", Box::new(Faulty))]);

        let record = Record::new("src", "broken", 60);
        let id = record.id;
        dispatcher.submit(record).unwrap();

        assert_eq!(
            dispatcher.tick().unwrap(),
            TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            }
        );
        assert!(log
            .entries()
            .iter()
            .any(|e| e.transition == Transition::Terminate && e.record_id == id));
    }

    #[test]
    fn test_handler_timeout_is_a_fault() {
        let config = CoreConfig {
            handler_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        let (dispatcher, _) = build(config, vec![("slow", Box::new(Slow))]);

        let record = Record::new("src", "slow", 60);
        let id = record.id;
        dispatcher.submit(record).unwrap();

        // The handler answered, but over budget: failure result, never a
        // silent Active record.
        assert_eq!(
            dispatcher.tick().unwrap(),
            TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            }
        );
    }

    #[test]
    fn test_unresponsive_handler_does_not_wedge_the_worker() {
        struct Stuck;

        impl Handler for Stuck {
            fn invoke(&self, _call: HandlerCall) -> Result<HandlerResponse, HandlerError> {
                std::thread::sleep(Duration::from_secs(60));
                Ok(HandlerResponse::Terminal("never seen".to_string()))
            }
        }

        let config = CoreConfig {
            handler_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (dispatcher, _) = build(config, vec![("stuck", Box::new(Stuck))]);

        let record = Record::new("src", "stuck", 60);
        let id = record.id;
        dispatcher.submit(record).unwrap();

        // tick returns once the budget elapses; the handler call is
        // abandoned, not interrupted.
        let started = std::time::Instant::now();
        assert_eq!(
            dispatcher.tick().unwrap(),
            TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            }
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_standard_escalation_fires_at_seven_not_before() {
        let review = Arc::new(MemoryReview::new());
        let (dispatcher, log) = build(
            CoreConfig::default(),
            vec![("relay", Box::new(Router("sink"))), ("sink", Box::new(Terminal))],
        );
        let dispatcher = dispatcher.with_review_sink(review.clone());

        let mut record = Record::new("src", "relay", 55);
        record.depth = 6;
        let id = record.id;
        dispatcher.submit(record).unwrap();

        // Depth 6 passes the guard and re-routes to depth 7.
        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Rerouted(id));
        // The next dequeue trips the standard ceiling.
        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Escalated(id));

        assert_eq!(review.received().len(), 1);
        assert!(log
            .entries()
            .iter()
            .any(|e| e.transition == Transition::DepthEscalate && e.record_id == id));
        // Paused, not terminated.
        assert_eq!(dispatcher.metrics().terminated, 0);
    }

    #[test]
    fn test_extended_ceiling_routes_to_storage() {
        let storage = Arc::new(MemoryStorage::default());
        let (dispatcher, _) = build(CoreConfig::default(), vec![("sink", Box::new(Terminal))]);
        let dispatcher = dispatcher.with_storage_sink(storage.clone());

        let mut record = Record::new("src", "sink", 55).with_tag(Tag::Extended);
        record.depth = 12;
        let id = record.id;
        dispatcher.submit(record).unwrap();

        assert_eq!(
            dispatcher.tick().unwrap(),
            TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            }
        );
        assert_eq!(storage.stored.lock().unwrap().as_slice(), &[id]);
    }

    #[test]
    fn test_emergency_ceiling_fans_out_alerts() {
        let alert = Arc::new(MemoryAlert::default());
        let (dispatcher, _) = build(CoreConfig::default(), vec![("omega", Box::new(Terminal))]);
        dispatcher.subscribe_alerts("omega", alert.clone());

        let mut record = Record::new("src", "omega", 55).with_tag(Tag::Override);
        record.depth = 21;
        let id = record.id;
        dispatcher.submit(record).unwrap();

        assert_eq!(
            dispatcher.tick().unwrap(),
            TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedEmergency,
            }
        );
        let hits = alert.hits.lock().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], (HandlerId::new("omega"), id));
    }

    #[test]
    fn test_absolute_ceiling_halts_the_core_until_resume() {
        let (dispatcher, log) = build(CoreConfig::default(), vec![("sink", Box::new(Terminal))]);

        let mut record = Record::new("src", "sink", 55);
        record.depth = 33;
        let id = record.id;
        dispatcher.submit(record).unwrap();

        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Panicked(id));

        // Everything refuses until manual resume.
        assert_eq!(dispatcher.tick(), Err(CoreError::PanicHalted));
        assert_eq!(
            dispatcher.submit(Record::new("src", "sink", 10)),
            Err(CoreError::PanicHalted)
        );

        // The snapshot and the panic entry were persisted before returning.
        assert_eq!(log.snapshots().len(), 1);
        assert!(log.snapshots()[0].halted);
        assert!(log.entries().iter().any(|e| e.transition == Transition::Panic));

        dispatcher.resume();
        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Idle);
    }

    #[test]
    fn test_cancellation_between_cycles() {
        let (dispatcher, _) = build(CoreConfig::default(), vec![("sink", Box::new(Terminal))]);

        let record = Record::new("src", "sink", 55);
        let id = record.id;
        dispatcher.submit(record).unwrap();
        assert!(dispatcher.cancel(id));

        assert_eq!(
            dispatcher.tick().unwrap(),
            TickOutcome::Terminated {
                record: id,
                status: RecordStatus::TerminatedIncomplete,
            }
        );
    }

    #[test]
    fn test_invoked_fusion_and_revert_round_trip() {
        // Auto-fusion off so the restored pair does not immediately re-fuse.
        let config = CoreConfig {
            auto_fusion: false,
            ..Default::default()
        };
        let (dispatcher, _) = build(
            config,
            vec![("left", Box::new(Terminal)), ("right", Box::new(Terminal))],
        );

        let a = Record::new("src", "left", 80).with_tags([Tag::label("x"), Tag::label("y")]);
        let b = Record::new("src", "right", 75).with_tags([Tag::label("x"), Tag::label("y")]);
        let (a_id, b_id) = (a.id, b.id);
        dispatcher.submit(a).unwrap();
        dispatcher.submit(b).unwrap();

        let fusion = dispatcher
            .request_fusion(a_id, b_id, ChargeStrategy::Averaged, FusionMode::Invoked)
            .unwrap();

        // Both constituents left the queue.
        assert_eq!(dispatcher.tick().unwrap(), TickOutcome::Idle);
        assert_eq!(dispatcher.fusion(fusion).unwrap().charge, 78); // round(77.5)

        // Revert restores both to pending with original charges.
        let restored = dispatcher.revert_fusion(fusion).unwrap();
        assert_eq!(restored.len(), 2);
        for _ in 0..2 {
            match dispatcher.tick().unwrap() {
                TickOutcome::Completed { record, .. } => {
                    assert!(record == a_id || record == b_id);
                }
                other => panic!("expected completion, got {:?}", other),
            }
        }
        assert_eq!(dispatcher.metrics().reverts, 1);
    }

    #[test]
    fn test_locked_fusion_cannot_be_reverted() {
        let (dispatcher, _) = build(
            CoreConfig::default(),
            vec![("left", Box::new(Terminal)), ("right", Box::new(Terminal))],
        );

        let a = Record::new("src", "left", 80).with_tags([Tag::label("x"), Tag::label("y")]);
        let b = Record::new("src", "right", 75).with_tags([Tag::label("x"), Tag::label("y")]);
        let (a_id, b_id) = (a.id, b.id);
        dispatcher.submit(a).unwrap();
        dispatcher.submit(b).unwrap();

        let fusion = dispatcher
            .request_fusion(a_id, b_id, ChargeStrategy::default(), FusionMode::Invoked)
            .unwrap();
        dispatcher.lock_fusion(fusion).unwrap();

        assert_eq!(dispatcher.revert_fusion(fusion), Err(CoreError::FusionLocked));
        // The fused record is untouched.
        assert!(dispatcher.fusion(fusion).unwrap().lock);
    }

    #[test]
    fn test_invoked_fusion_rejects_ineligible_pair() {
        let (dispatcher, _) = build(
            CoreConfig::default(),
            vec![("left", Box::new(Terminal)), ("right", Box::new(Terminal))],
        );

        let a = Record::new("src", "left", 30).with_tag(Tag::label("x"));
        let b = Record::new("src", "right", 20).with_tag(Tag::label("y"));
        let (a_id, b_id) = (a.id, b.id);
        dispatcher.submit(a).unwrap();
        dispatcher.submit(b).unwrap();

        assert!(matches!(
            dispatcher.request_fusion(a_id, b_id, ChargeStrategy::default(), FusionMode::Invoked),
            Err(CoreError::FusionIneligible(_))
        ));
        // Nothing was claimed.
        assert_eq!(dispatcher.snapshot().pending.len(), 2);

        // Forced mode bypasses the gate and says so on the result.
        let fusion = dispatcher
            .request_fusion(a_id, b_id, ChargeStrategy::default(), FusionMode::Forced)
            .unwrap();
        assert!(dispatcher.fusion(fusion).unwrap().forced);
    }

    #[test]
    fn test_collision_submit_returns_junction() {
        let (dispatcher, _) = build(CoreConfig::default(), vec![("shared", Box::new(Terminal))]);

        let first = Record::new("one", "shared", 40).with_tag(Tag::label("x"));
        let second = Record::new("two", "shared", 70).with_tag(Tag::label("y"));
        let first_id = first.id;

        dispatcher.submit(first).unwrap();
        let junction = dispatcher.submit(second).unwrap();
        assert_ne!(junction, first_id);
        assert_eq!(dispatcher.metrics().collisions, 1);

        match dispatcher.tick().unwrap() {
            TickOutcome::Completed { record, .. } => assert_eq!(record, junction),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let (dispatcher, _) = build(CoreConfig::default(), vec![("sink", Box::new(Terminal))]);

        dispatcher.submit(Record::new("src", "sink", 60)).unwrap();
        let snapshot = dispatcher.snapshot();
        assert_eq!(snapshot.pending.len(), 1);

        let (fresh, _) = build(CoreConfig::default(), vec![("sink", Box::new(Terminal))]);
        fresh.restore(snapshot).unwrap();
        match fresh.tick().unwrap() {
            TickOutcome::Completed { .. } => {}
            other => panic!("expected completion, got {:?}", other),
        }
    }
}
