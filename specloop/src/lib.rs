//! Task orchestration with self-healing verification loops.
//!
//! Tasks form a dependency graph. Each eligible task is handed to a
//! verification gateway; when verification fails, the failure is analyzed, a
//! correction is synthesized for one anchored section of the specification
//! document and applied, and the task is retried until it passes or its
//! attempt budget runs out. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, scheduling, error
//!   analysis, anchored-document parsing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, process execution,
//!   persistence, external reasoners). Isolated behind traits to enable
//!   mocking in tests.
//!
//! Orchestration modules ([`coordinator`], [`orchestrator`], [`synthesize`],
//! [`start`], [`validate`]) coordinate core logic with I/O to implement CLI
//! commands.

pub mod cancel;
pub mod coordinator;
pub mod core;
pub mod exit_codes;
pub mod graph;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod start;
pub mod synthesize;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
