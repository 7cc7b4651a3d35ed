//! # Record Model
//!
//! Shared data shapes for The Relay routing core. This crate is the single
//! source of truth for what a unit of work looks like in flight and contains
//! no dispatch logic.
//!
//! ## Core Components
//!
//! - **id / tag**: Opaque identifiers and the tag vocabulary
//! - **tier / priority**: Pure classification of charge into tiers and of
//!   (charge, tags) into dispatch priorities
//! - **record**: The `Record` shape and its status lifecycle
//! - **fused**: Fusion result shapes and charge combination strategies
//! - **log**: Append-only transition log entries

pub mod fused;
pub mod id;
pub mod log;
pub mod priority;
pub mod record;
pub mod tag;
pub mod tier;

pub use fused::*;
pub use id::*;
pub use log::*;
pub use priority::*;
pub use record::*;
pub use tag::*;
pub use tier::*;
