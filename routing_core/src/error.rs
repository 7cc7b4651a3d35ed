//! Error taxonomy for the routing core.

use thiserror::Error;

use crate::depth::DepthLimit;

/// Everything that can go wrong inside the core.
///
/// `InvalidRecord`, `QueueFull`, `FusionIneligible`, and `FusionLocked` are
/// ordinary recoverable results for the caller. `Deadlocked` and
/// `HandlerFault` terminate the affected chain or record while the core keeps
/// running. `PanicHalted` is the single fatal condition: the core refuses all
/// dispatch until a manual resume.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Input violated the upstream validation contract.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Enqueue rejected at capacity.
    #[error("dispatch queue is full")]
    QueueFull,

    /// A depth ceiling was breached.
    #[error("depth ceiling breached at the {0} limit")]
    DepthExceeded(DepthLimit),

    /// A (source, destination) pair repeated within one routing chain.
    #[error("routing chain deadlocked")]
    Deadlocked,

    /// An invoked fusion failed the eligibility gate.
    #[error("fusion ineligible: {0}")]
    FusionIneligible(String),

    /// Rollback attempted on a locked fusion.
    #[error("fusion is locked and can no longer be reverted")]
    FusionLocked,

    /// The downstream handler returned an invalid shape or timed out.
    #[error("handler fault: {0}")]
    HandlerFault(String),

    /// The core is suspended after an absolute depth breach.
    #[error("core halted by panic-stop; manual resume required")]
    PanicHalted,
}
