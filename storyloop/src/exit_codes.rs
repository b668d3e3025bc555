//! Stable exit codes for storyloop CLI commands.

/// Command succeeded, or the build loop stopped gracefully.
pub const OK: i32 = 0;
/// Missing input, invalid config or ledger, agent not launchable, or any other error.
pub const INVALID: i32 = 1;
/// `storyloop status` found no story left to build.
pub const COMPLETE: i32 = 2;
/// Second Ctrl-C during `storyloop build`.
pub const HARD_INTERRUPT: i32 = 130;
