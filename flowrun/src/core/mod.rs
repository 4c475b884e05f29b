//! Deterministic, pure logic shared by the flowrun engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod aggregate;
pub mod classifier;
pub mod config;
pub mod flatten;
pub mod graph;
pub mod path;
pub mod scenario;
pub mod types;
