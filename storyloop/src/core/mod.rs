//! Deterministic, pure logic shared by the build loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod ids;
pub mod invariants;
pub mod response;
pub mod selector;
pub mod sentinel;
pub mod stream;
pub mod types;
