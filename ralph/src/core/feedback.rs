//! Feedback text for the next iteration and failure escalation tracking.

use crate::core::render::truncate_text;
use crate::core::types::{FailureKind, IterationResult};

const TAIL_CHARS: usize = 500;

/// Guidance sentence for an iteration outcome.
pub fn guidance(failure: Option<FailureKind>) -> &'static str {
    match failure {
        None => "The previous iteration finished cleanly. Continue with the next step.",
        Some(FailureKind::ContextCompacted) => {
            "Your context was compacted before you finished. Work in smaller steps and commit progress early."
        }
        Some(FailureKind::TurnBudgetExceeded) => {
            "The turn limit was reached. Break the work down into smaller steps and commit after each one."
        }
        Some(FailureKind::TimeoutExceeded) => {
            "The iteration timed out. Simplify the approach or split the task before continuing."
        }
        Some(FailureKind::NonZeroExit) => {
            "The agent exited with an error. Read the output below and fix the cause first."
        }
        Some(FailureKind::StreamTruncated) => {
            "The output stream ended unexpectedly. Re-check the repository state before continuing."
        }
        Some(FailureKind::Interrupted) => "The previous iteration was interrupted.",
    }
}

/// Inputs beyond the iteration result that shape the feedback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackContext {
    pub commit_detected: bool,
    /// The completion marker appeared but no commit exists since the loop started.
    pub marker_without_commit: bool,
}

/// Plain-text summary of `result` injected into the next prompt.
pub fn build_feedback(result: &IterationResult, context: FeedbackContext) -> String {
    let mut out = format!(
        "Previous iteration {}: {}\n",
        result.iteration,
        result.outcome_label()
    );
    let commit = if context.commit_detected { "yes" } else { "no" };
    out.push_str(&format!("Commit detected: {commit}\n"));
    out.push_str(guidance(result.failure));
    out.push('\n');
    if context.marker_without_commit {
        out.push_str(
            "You reported completion, but no commit was found. The work is not complete until it is committed.\n",
        );
    }
    if result.orphaned_count() > 0 {
        out.push_str(&format!(
            "{} tool call(s) never returned a result.\n",
            result.orphaned_count()
        ));
    }
    let tail = result.output_tail.join("\n");
    let tail = tail.trim();
    if !tail.is_empty() {
        let heading = if result.failure.is_some() {
            "Last output:\n"
        } else {
            "Where you left off:\n"
        };
        out.push_str(heading);
        out.push_str(&truncate_text(tail, TAIL_CHARS));
        out.push('\n');
    }
    out
}

/// Run of consecutive iterations that failed the same way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureStreak {
    kind: Option<FailureKind>,
    count: u32,
}

impl FailureStreak {
    /// Record an outcome; success or a different kind restarts the streak.
    pub fn record(&mut self, failure: Option<FailureKind>) {
        match failure {
            None => self.reset(),
            Some(kind) if self.kind == Some(kind) => self.count += 1,
            Some(kind) => {
                self.kind = Some(kind);
                self.count = 1;
            }
        }
    }

    pub fn reset(&mut self) {
        self.kind = None;
        self.count = 0;
    }

    pub fn kind(&self) -> Option<FailureKind> {
        self.kind
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reached(&self, threshold: u32) -> bool {
        threshold > 0 && self.count >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(failure: Option<FailureKind>, tail: &[&str]) -> IterationResult {
        IterationResult {
            iteration: 2,
            success: failure.is_none(),
            failure,
            duration_ms: 10,
            input_tokens: 0,
            output_tokens: 0,
            tokens_estimated: true,
            invocations: Vec::new(),
            exit_code: Some(0),
            summary: None,
            completion_marker_seen: false,
            stopped_on_commit: false,
            parse_anomalies: 0,
            event_count: 0,
            output_tail: tail.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn success_feedback_carries_tail() {
        let text = build_feedback(
            &result(None, &["implemented parser, tests green"]),
            FeedbackContext {
                commit_detected: true,
                marker_without_commit: false,
            },
        );
        assert!(text.starts_with("Previous iteration 2: success\nCommit detected: yes\n"));
        assert!(text.contains("Where you left off:\nimplemented parser, tests green\n"));
        assert!(!text.contains("Last output:"));
    }

    #[test]
    fn blank_tail_adds_no_heading() {
        let text = build_feedback(&result(None, &["  ", ""]), FeedbackContext::default());
        assert!(!text.contains("Where you left off"));
    }

    #[test]
    fn failure_feedback_includes_guidance_and_tail() {
        let text = build_feedback(
            &result(Some(FailureKind::TurnBudgetExceeded), &["Reached max turns"]),
            FeedbackContext::default(),
        );
        assert!(text.contains("TurnBudgetExceeded"));
        assert!(text.contains("Break the work down into smaller steps"));
        assert!(text.contains("Last output:\nReached max turns"));
    }

    #[test]
    fn marker_without_commit_is_called_out() {
        let text = build_feedback(
            &result(None, &[]),
            FeedbackContext {
                commit_detected: false,
                marker_without_commit: true,
            },
        );
        assert!(text.contains("no commit was found"));
    }

    #[test]
    fn streak_counts_identical_kinds_only() {
        let mut streak = FailureStreak::default();
        streak.record(Some(FailureKind::NonZeroExit));
        streak.record(Some(FailureKind::NonZeroExit));
        assert_eq!(streak.count(), 2);
        streak.record(Some(FailureKind::TimeoutExceeded));
        assert_eq!(streak.count(), 1);
        assert_eq!(streak.kind(), Some(FailureKind::TimeoutExceeded));
        streak.record(None);
        assert_eq!(streak.count(), 0);
        assert!(!streak.reached(1));
    }

    #[test]
    fn zero_threshold_never_escalates() {
        let mut streak = FailureStreak::default();
        streak.record(Some(FailureKind::NonZeroExit));
        assert!(!streak.reached(0));
        assert!(streak.reached(1));
    }
}
