//! Commit-gated supervisor for long-running coding agents.
//!
//! `ralph` launches an agent CLI once per iteration, streams its output into
//! a compact console view and a durable log, and decides after each
//! iteration whether the goal is done. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (stream parsing, rendering, exit
//!   classification, feedback). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process supervision, sinks, git,
//!   config, checkpoints). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`iteration`], [`looping`]) coordinate core logic
//! with I/O to implement `ralph run`.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
