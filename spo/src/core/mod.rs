//! Deterministic, pure logic shared by the optimization loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod decision;
pub mod history;
pub mod invariants;
pub mod samples;
pub mod types;
