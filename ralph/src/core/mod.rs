//! Deterministic, pure logic shared by the iteration core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod feedback;
pub mod parser;
pub mod render;
pub mod types;
