//! Side-effecting operations: storage, process execution, log capture.
//!
//! Everything that touches the filesystem or spawns processes lives here so
//! the orchestration layers can be driven by in-memory fakes in tests.

pub mod capture;
pub mod executor;
pub mod instance;
pub mod manifest;
pub mod process;
pub mod report;
pub mod storage;
