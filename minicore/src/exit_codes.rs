//! Stable exit codes for `mini` commands.

/// The command succeeded, or the agent loop ran to any stop reason.
pub const OK: i32 = 0;
/// The agent could not be run: bad arguments, config or workspace.
pub const INVALID: i32 = 1;
