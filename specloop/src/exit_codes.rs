//! Stable exit codes for specloop CLI commands.

/// Command succeeded; for `run`, every task completed.
pub const OK: i32 = 0;
/// Command failed due to invalid config, task graph, specification or other errors.
pub const INVALID: i32 = 1;
/// `specloop run` stopped with tasks waiting on dependencies that can never complete.
pub const BLOCKED: i32 = 2;
/// `specloop run` ended with at least one task halted after exhausting its attempts.
pub const HALTED: i32 = 3;
/// `specloop run` was cancelled before finishing.
pub const CANCELLED: i32 = 4;
