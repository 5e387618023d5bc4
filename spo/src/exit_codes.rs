//! Stable exit codes for `spo` commands.

/// Command succeeded; a run finished its budget or converged.
pub const OK: i32 = 0;
/// Invalid configuration or input, or any unexpected failure.
pub const INVALID: i32 = 1;
/// A run aborted mid-way (optimizer failure or empty candidate).
pub const HALTED: i32 = 2;
/// A run was cancelled by the operator before its budget ran out.
pub const CANCELLED: i32 = 3;
