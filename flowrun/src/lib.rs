//! Isolated, cached execution of parameterized units with status reporting.
//!
//! A project declares flows (ordered shell steps), builds (ordered flows) and
//! a conductor (builds swept over scenarios) in `flowrun.toml`. Every
//! `(unit, instance)` pair runs in its own directory under the run root,
//! with a configuration snapshot, a tee'd log and a result record.
//!
//! - **[`core`]**: Pure, deterministic logic (flattening, classification,
//!   aggregation, build graphs). No I/O.
//! - **[`io`]**: Storage, processes, log capture, manifest and report files.
//!
//! [`run`] executes a single unit; [`orchestrate`] schedules flows, builds and
//! scenario sweeps on top of it; [`cli`] implements the `flowrun` commands.

pub mod cli;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrate;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
