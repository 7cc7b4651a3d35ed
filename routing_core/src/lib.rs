//! # Routing Core (The Relay)
//!
//! A priority-ordered dispatch core: accepts validated records, routes them
//! to registered handlers, bounds recursive re-routing with a ladder of depth
//! ceilings, and opportunistically merges related records under a reversible
//! fusion protocol. Payloads are opaque; the core only reasons about charges,
//! tags, and identifiers.
//!
//! ## Core Components
//!
//! - **queue**: Bounded priority queue with collision junctions
//! - **chain**: Per-record hop tables for deadlock detection
//! - **depth**: The recursion ceiling ladder
//! - **fusion**: Eligibility checks, merges, and time-boxed rollback
//! - **dispatch**: The orchestrating cycle and shared core state
//! - **hooks**: Traits for the external handler/review/alert/log collaborators
//!
//! ## Design Philosophy
//!
//! - **No ambient state**: one `CoreState` owns all shared mutable state and
//!   is handed to workers explicitly
//! - **Registration over dispatch tables**: handlers are looked up in a
//!   registry, never matched on inside the dispatcher
//! - **Absorb what is expected**: depth escalations and deadlocks are
//!   steady-state outcomes surfaced as status changes, not errors

pub mod chain;
pub mod depth;
pub mod dispatch;
pub mod error;
pub mod fusion;
pub mod hooks;
pub mod queue;
pub mod snapshot;

pub use chain::*;
pub use depth::*;
pub use dispatch::*;
pub use error::*;
pub use fusion::*;
pub use hooks::*;
pub use queue::*;
pub use snapshot::*;
