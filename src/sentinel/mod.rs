//! Reliability watchdog
//!
//! Samples gateway connection signals and agent heartbeats, judges a fixed
//! set of named checks and escalates persistent failures into an
//! append-only audit trail.

mod engine;
pub mod rules;
mod store;
mod types;

pub use engine::{ReliabilityEngine, AUDIT_ACTOR, DEFAULT_MAX_AUDIT_ENTRIES};
pub use store::{JsonFileStore, MemoryStore, SentinelStore};
pub use types::*;
