//! Stable exit codes for the harness CLIs.

/// Command succeeded; for `run`, every iteration passed.
pub const OK: i32 = 0;
/// At least one iteration failed, or a command hit a runtime error.
pub const FAILURES: i32 = 1;
/// Configuration or test case files are invalid.
pub const CONFIG: i32 = 2;
