//! Deterministic classification of how an iteration ended.

use crate::core::types::FailureKind;

/// Phrases the agent prints when it starts summarising its own conversation.
const COMPACTION_PATTERNS: &[&str] = &[
    "conversation has been automatically summarized",
    "conversation has unlimited context through automatic summarization",
    "the conversation has been compacted",
    "compacting the conversation",
    "summarizing previous messages",
    "context window is nearly full",
];

/// True when `text` announces conversation compaction.
pub fn is_compaction_notice(text: &str) -> bool {
    let lower = text.to_lowercase();
    COMPACTION_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// True when `text` reports that the turn budget ran out.
pub fn mentions_max_turns(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("max turns") || lower.contains("max_turns") || lower.contains("maximum turns")
}

/// Everything observed about an iteration that bears on its outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitSignals {
    pub timed_out: bool,
    pub interrupted: bool,
    pub compacted: bool,
    pub stopped_on_commit: bool,
    pub hit_turn_budget: bool,
    /// The protocol normally ends with a run summary.
    pub expects_summary: bool,
    pub summary_seen: bool,
    pub summary_is_error: bool,
    pub exit_code: Option<i32>,
}

/// Assign at most one failure kind.
///
/// Precedence: timeout, interruption, compaction, commit stop (success),
/// turn budget, missing summary, non-zero exit.
pub fn classify_exit(signals: &ExitSignals) -> Option<FailureKind> {
    if signals.timed_out {
        return Some(FailureKind::TimeoutExceeded);
    }
    if signals.interrupted {
        return Some(FailureKind::Interrupted);
    }
    if signals.compacted {
        return Some(FailureKind::ContextCompacted);
    }
    if signals.stopped_on_commit {
        return None;
    }
    if signals.hit_turn_budget {
        return Some(FailureKind::TurnBudgetExceeded);
    }
    if signals.expects_summary && !signals.summary_seen {
        return Some(FailureKind::StreamTruncated);
    }
    if signals.exit_code != Some(0) || signals.summary_is_error {
        return Some(FailureKind::NonZeroExit);
    }
    None
}
