//! I/O helpers for the iteration supervisor.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod iteration_log;
pub mod process;
pub mod prompt;
pub mod sink;
