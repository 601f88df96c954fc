//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod anchors;
pub mod classifier;
pub mod digest;
pub mod scheduler;
pub mod state_store;
pub mod types;
