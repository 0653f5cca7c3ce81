//! Stable exit codes for `ralph` commands.

use crate::looping::LoopStop;

/// Command succeeded, or the loop completed with a commit.
pub const OK: i32 = 0;
/// Invalid config or arguments, launch failure, escalation or other errors.
pub const INVALID: i32 = 1;
/// `max_iterations` ran out before completion.
pub const BUDGET_EXHAUSTED: i32 = 2;
/// Stopped at a human checkpoint or by Ctrl-C.
pub const STOPPED: i32 = 3;

pub fn for_stop(stop: LoopStop) -> i32 {
    match stop {
        LoopStop::Complete => OK,
        LoopStop::MaxIterations => BUDGET_EXHAUSTED,
        LoopStop::HumanStop | LoopStop::Interrupted => STOPPED,
    }
}
