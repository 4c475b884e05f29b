//! Stable exit codes for flowrun CLI commands.
//!
//! `flowrun flow` and `flowrun step` exit with the failing step's own code
//! instead of [`FAILED`] when one is known.

/// Command succeeded; every unit ended in success or warning.
pub const OK: i32 = 0;
/// Invalid manifest, configuration or storage, or a unit failure without an
/// exit code of its own.
pub const INVALID: i32 = 1;
/// `flowrun build` or `flowrun conduct` finished with at least one failure.
pub const FAILED: i32 = 2;
