//! Multi-iteration outer loop for `ralph run`.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::feedback::{FailureStreak, FeedbackContext, build_feedback};
use crate::core::render::RunTotals;
use crate::core::types::{FailureKind, IterationResult, duration_ms};
use crate::io::agent::{Agent, LaunchSettings};
use crate::io::checkpoint::{Checkpoint, CheckpointDecision};
use crate::io::config::RalphConfig;
use crate::io::git::{CommitGate, CommitMark};
use crate::io::iteration_log::{IterationRecord, append_record};
use crate::io::process::CancelToken;
use crate::io::prompt::{PromptInputs, PromptRenderer};
use crate::io::sink::{DualSinkLogger, wall_clock};
use crate::iteration::{IterationConfig, IterationController};

/// The same failure kind repeated too many times in a row.
#[derive(Debug, Error)]
#[error("{count} consecutive iterations failed with {kind}, giving up")]
pub struct EscalationError {
    pub kind: FailureKind,
    pub count: u32,
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Completion marker seen with at least one commit since the loop started.
    Complete,
    /// `max_iterations` ran without completion.
    MaxIterations,
    /// A human chose to stop at the checkpoint.
    HumanStop,
    /// External stop request (Ctrl-C).
    Interrupted,
}

impl LoopStop {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopStop::Complete => "complete",
            LoopStop::MaxIterations => "max-iterations",
            LoopStop::HumanStop => "human-stop",
            LoopStop::Interrupted => "interrupted",
        }
    }
}

/// Everything the loop needs that does not change between iterations.
#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub max_iterations: u32,
    pub per_iteration_timeout: Duration,
    pub grace: Duration,
    pub max_turns: u32,
    pub max_consecutive_failures: u32,
    pub iteration: IterationConfig,
    /// Where iteration records go; `None` disables them.
    pub records_path: Option<PathBuf>,
}

impl LoopRequest {
    pub fn from_config(prompt: &str, workdir: PathBuf, cfg: &RalphConfig) -> Self {
        Self {
            prompt: prompt.to_string(),
            workdir,
            max_iterations: cfg.max_iterations,
            per_iteration_timeout: cfg.iteration_timeout(),
            grace: cfg.grace_period(),
            max_turns: cfg.max_turns,
            max_consecutive_failures: cfg.max_consecutive_failures,
            iteration: IterationConfig::from_config(cfg),
            records_path: None,
        }
    }

    fn launch_settings(&self) -> LaunchSettings {
        LaunchSettings {
            workdir: self.workdir.clone(),
            timeout: self.per_iteration_timeout,
            grace: self.grace,
            max_turns: self.max_turns,
        }
    }

    fn header_settings(&self, agent: &str) -> Vec<(String, String)> {
        vec![
            ("agent".to_string(), agent.to_string()),
            (
                "max iterations".to_string(),
                self.max_iterations.to_string(),
            ),
            ("max turns".to_string(), self.max_turns.to_string()),
            (
                "timeout".to_string(),
                format!("{}s", self.per_iteration_timeout.as_secs()),
            ),
            (
                "completion marker".to_string(),
                self.iteration.completion_marker.clone(),
            ),
            (
                "stop on commit".to_string(),
                self.iteration.stop_on_commit.to_string(),
            ),
            (
                "detect compaction".to_string(),
                self.iteration.detect_compaction.to_string(),
            ),
        ]
    }
}

/// Loop state threaded through every iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunState {
    pub iteration: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Feedback text injected into the next prompt.
    pub feedback: Option<String>,
    pub commits_observed: u32,
    pub streak: FailureStreak,
    pub terminal: bool,
}

impl RunState {
    fn record(&mut self, result: &IterationResult, commit: bool) {
        self.input_tokens += result.input_tokens;
        self.output_tokens += result.output_tokens;
        self.streak.record(result.failure);
        if commit {
            self.commits_observed += 1;
            self.streak.reset();
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub iterations: Vec<IterationResult>,
    pub run_state: RunState,
}

/// Run iterations until completion, budget exhaustion, a human stop or
/// an interrupt.
///
/// A launch failure or an escalation stops the loop with an error. The run
/// summary block is written on every exit path.
#[instrument(skip_all, fields(max_iterations = request.max_iterations, agent = agent.name()))]
pub fn run_loop<A, G, C, W>(
    request: &LoopRequest,
    agent: &A,
    gate: &G,
    checkpoint: &mut C,
    prompts: &PromptRenderer,
    logger: &mut DualSinkLogger<W>,
    cancel: &CancelToken,
) -> Result<LoopOutcome>
where
    A: Agent + ?Sized,
    G: CommitGate + ?Sized,
    C: Checkpoint + ?Sized,
    W: Write,
{
    let started = Instant::now();
    let settings = request.launch_settings();
    logger.begin_run(&request.workdir, &request.header_settings(agent.name()));

    let mut state = RunState::default();
    let mut iterations: Vec<IterationResult> = Vec::new();

    let stop = (|| -> Result<LoopStop> {
        for iteration in 1..=request.max_iterations {
            if cancel.is_cancelled() {
                return Ok(LoopStop::Interrupted);
            }
            state.iteration = iteration;

            let prompt = prompts.render(&PromptInputs {
                iteration,
                max_iterations: request.max_iterations,
                prompt: &request.prompt,
                feedback: state.feedback.as_deref(),
                completion_marker: &request.iteration.completion_marker,
            })?;

            let mark = gate.mark().unwrap_or_else(|err| {
                warn!(err = %err, "commit gate unavailable, commits will not be detected");
                CommitMark {
                    taken_at: chrono::Utc::now().timestamp(),
                    head: None,
                }
            });

            let mut controller = IterationController::new(
                agent,
                gate,
                &settings,
                &request.iteration,
                cancel.clone(),
            );
            let result = controller.run(iteration, &prompt, &mark, logger)?;

            let commit = result.stopped_on_commit
                || gate.has_new_commit(&mark).unwrap_or_else(|err| {
                    warn!(err = %err, "commit gate unavailable, treating as no commit");
                    false
                });
            state.record(&result, commit);

            let marker_without_commit =
                result.completion_marker_seen && state.commits_observed == 0;
            if marker_without_commit {
                warn!(
                    iteration,
                    "completion marker seen without any commit, not treating as complete"
                );
                logger.note("Completion marker seen but nothing committed yet; continuing.");
            }

            if let Some(path) = &request.records_path {
                append_record(
                    path,
                    &IterationRecord {
                        recorded_at: wall_clock(),
                        commit_detected: commit,
                        marker_without_commit,
                        result: &result,
                    },
                )
                .with_context(|| format!("record iteration {iteration}"))?;
            }

            state.feedback = Some(build_feedback(
                &result,
                FeedbackContext {
                    commit_detected: commit,
                    marker_without_commit,
                },
            ));
            info!(
                iteration,
                outcome = result.outcome_label(),
                commit,
                streak = state.streak.count(),
                "iteration recorded"
            );
            iterations.push(result.clone());

            if result.completion_marker_seen && state.commits_observed > 0 {
                return Ok(LoopStop::Complete);
            }
            if cancel.is_cancelled() {
                return Ok(LoopStop::Interrupted);
            }
            if state.streak.reached(request.max_consecutive_failures)
                && let Some(kind) = state.streak.kind()
            {
                return Err(EscalationError {
                    kind,
                    count: state.streak.count(),
                }
                .into());
            }
            if iteration < request.max_iterations {
                match checkpoint.pause(&result)? {
                    CheckpointDecision::Continue => {}
                    CheckpointDecision::Stop => return Ok(LoopStop::HumanStop),
                    CheckpointDecision::Interrupted => return Ok(LoopStop::Interrupted),
                }
            }
        }
        Ok(LoopStop::MaxIterations)
    })();

    state.terminal = true;
    let stop_reason = match &stop {
        Ok(stop) => stop.as_str().to_string(),
        Err(err) => format!("error: {err}"),
    };
    let totals = RunTotals {
        iterations: u32::try_from(iterations.len()).unwrap_or(u32::MAX),
        input_tokens: state.input_tokens,
        output_tokens: state.output_tokens,
        commits: state.commits_observed,
        elapsed_ms: duration_ms(started.elapsed()),
        stop_reason,
    };
    if let Err(err) = logger.end_run(&totals) {
        warn!(err = %err, "failed to write run summary");
    }

    let stop = stop?;
    info!(stop = stop.as_str(), iterations = iterations.len(), "loop finished");
    Ok(LoopOutcome {
        stop,
        iterations,
        run_state: state,
    })
}
