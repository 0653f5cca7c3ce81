//! Shared time budget helpers for deterministic orchestration.

use std::time::{Duration, Instant};

/// Remaining time until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

/// Next wait slice: at most `poll`, never past `deadline`.
pub fn wait_slice(deadline: Instant, poll: Duration) -> Option<Duration> {
    remaining_budget(deadline).map(|remaining| remaining.min(poll))
}

/// True once `interval` has elapsed since `last`.
pub fn interval_elapsed(last: Instant, now: Instant, interval: Duration) -> bool {
    now.saturating_duration_since(last) >= interval
}
