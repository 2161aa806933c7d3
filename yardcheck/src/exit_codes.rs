//! Stable exit codes for the `yardcheck` binary.

/// Every recorded phase passed.
pub const OK: i32 = 0;
/// A recorded phase failed, or the run could not start (auth, transport, config).
pub const FAILED: i32 = 1;
