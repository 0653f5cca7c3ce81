//! Orchestration for a single supervised iteration.
//!
//! The controller launches the agent through the supervisor, feeds every
//! chunk through the parser, routes the resulting events to the sinks and
//! its own accumulator, and classifies the outcome once the child is gone.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::interval_elapsed;
use crate::core::classifier::{
    ExitSignals, classify_exit, is_compaction_notice, mentions_max_turns,
};
use crate::core::parser::StreamParser;
use crate::core::types::{
    EventKind, FailureKind, IterationResult, OutputStream, RunSummary, StreamEvent,
    StreamProtocol, ToolInvocation, ToolState, duration_ms, estimate_tokens,
};
use crate::io::agent::{Agent, LaunchSettings};
use crate::io::config::RalphConfig;
use crate::io::git::{CommitGate, CommitMark};
use crate::io::process::{self, CancelToken, ExitOutcome, StopReason, Termination};
use crate::io::sink::DualSinkLogger;

const DELIVERY_POLL: Duration = Duration::from_millis(250);
/// How long to keep draining output after the child has been reaped.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);
const TAIL_LINES: usize = 40;

/// Controller settings derived from the run configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationConfig {
    pub max_iterations: u32,
    pub completion_marker: String,
    pub detect_compaction: bool,
    pub stop_on_commit: bool,
    pub commit_poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl IterationConfig {
    pub fn from_config(cfg: &RalphConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            completion_marker: cfg.completion_marker.clone(),
            detect_compaction: cfg.detect_compaction,
            stop_on_commit: cfg.stop_on_commit,
            commit_poll_interval: cfg.commit_poll_interval(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Launching,
    Streaming,
    Finalizing,
    Succeeded,
    Failed(FailureKind),
}

/// Drives one agent invocation from launch to a classified result.
pub struct IterationController<'a, A: Agent + ?Sized, G: CommitGate + ?Sized> {
    agent: &'a A,
    gate: &'a G,
    settings: &'a LaunchSettings,
    config: &'a IterationConfig,
    cancel: CancelToken,
    state: ControllerState,
}

impl<'a, A: Agent + ?Sized, G: CommitGate + ?Sized> IterationController<'a, A, G> {
    pub fn new(
        agent: &'a A,
        gate: &'a G,
        settings: &'a LaunchSettings,
        config: &'a IterationConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            agent,
            gate,
            settings,
            config,
            cancel,
            state: ControllerState::Idle,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    fn transition(&mut self, next: ControllerState) {
        debug!(from = ?self.state, to = ?next, "controller transition");
        self.state = next;
    }

    /// Run one iteration. Only a launch failure is returned as an error.
    #[instrument(skip_all, fields(iteration = iteration, agent = self.agent.name()))]
    pub fn run<W: Write>(
        &mut self,
        iteration: u32,
        prompt: &str,
        mark: &CommitMark,
        logger: &mut DualSinkLogger<W>,
    ) -> Result<IterationResult> {
        self.transition(ControllerState::Launching);
        let protocol = self.agent.protocol();
        let invocation = self.agent.invocation(prompt, iteration, self.settings);
        logger.begin_iteration(iteration, self.config.max_iterations, &invocation, prompt);
        info!(iteration, program = %invocation.program, "starting iteration");

        let (rx, handle) = process::spawn(&invocation, self.cancel.clone())?;

        self.transition(ControllerState::Streaming);
        let mut parser = StreamParser::new(protocol);
        let mut acc = Accumulator::new(&self.config.completion_marker);
        let started = Instant::now();
        let mut last_heartbeat = started;
        let mut last_poll = started;
        let mut drain_until: Option<Instant> = None;

        loop {
            match rx.recv_timeout(DELIVERY_POLL) {
                Ok(chunk) => {
                    for event in parser.push(&chunk) {
                        if let Some(reason) = self.deliver(&event, &mut acc, logger) {
                            handle.request_stop(reason);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if interval_elapsed(last_heartbeat, now, self.config.heartbeat_interval) {
                debug!(
                    iteration,
                    elapsed_secs = now.duration_since(started).as_secs(),
                    events = parser.emitted(),
                    open_tools = acc.open_count(),
                    "iteration heartbeat"
                );
                last_heartbeat = now;
            }
            if self.config.stop_on_commit
                && interval_elapsed(last_poll, now, self.config.commit_poll_interval)
            {
                last_poll = now;
                match self.gate.has_new_commit(mark) {
                    Ok(true) => {
                        info!(iteration, "commit landed, stopping agent");
                        handle.request_stop(StopReason::CommitLanded);
                    }
                    Ok(false) => {}
                    Err(err) => warn!(err = %err, "commit gate unavailable, treating as no commit"),
                }
            }
            if handle.is_finished() {
                let until = *drain_until.get_or_insert(now + DRAIN_WINDOW);
                if now >= until {
                    warn!(iteration, "output still open after child exit, abandoning pipes");
                    break;
                }
            }
        }

        let exit = settle(handle.wait(), started.elapsed());
        self.transition(ControllerState::Finalizing);
        for event in parser.finish() {
            self.deliver(&event, &mut acc, logger);
        }

        let result = acc.finalize(&FinalizeInputs {
            iteration,
            protocol,
            prompt,
            exit,
            anomalies: parser.anomalies().len(),
            events: parser.emitted(),
        });

        match result.failure {
            None => self.transition(ControllerState::Succeeded),
            Some(kind) => self.transition(ControllerState::Failed(kind)),
        }
        logger.end_iteration(&result)?;
        info!(
            iteration,
            outcome = result.outcome_label(),
            duration_ms = result.duration_ms,
            tools = result.invocations.len(),
            "iteration finished"
        );
        Ok(result)
    }

    /// Route one event to the sinks and the accumulator.
    fn deliver<W: Write>(
        &self,
        event: &StreamEvent,
        acc: &mut Accumulator,
        logger: &mut DualSinkLogger<W>,
    ) -> Option<StopReason> {
        logger.observe(event);
        let compaction = acc.apply(event);
        if compaction && self.config.detect_compaction && !acc.compaction_requested {
            acc.compaction_requested = true;
            warn!(seq = event.seq, "agent announced context compaction, stopping");
            return Some(StopReason::Compaction);
        }
        None
    }
}

/// Exit outcome to classify, even when supervision of the child failed.
///
/// A lost child counts as killed by a signal, which classifies as a failed
/// iteration instead of aborting the loop.
fn settle(waited: Result<ExitOutcome>, elapsed: Duration) -> ExitOutcome {
    waited.unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "lost track of the agent process");
        ExitOutcome {
            code: None,
            termination: Termination::Exited,
            elapsed,
        }
    })
}

struct FinalizeInputs<'a> {
    iteration: u32,
    protocol: StreamProtocol,
    prompt: &'a str,
    exit: ExitOutcome,
    anomalies: usize,
    events: u64,
}

/// Per-iteration state built on the delivery path.
#[derive(Debug)]
struct Accumulator {
    /// Invocations in start order.
    invocations: Vec<ToolInvocation>,
    summary: Option<RunSummary>,
    marker: String,
    marker_window: String,
    marker_seen: bool,
    text_chars: u64,
    partial_line: String,
    tail: VecDeque<String>,
    compaction_requested: bool,
}

impl Accumulator {
    fn new(marker: &str) -> Self {
        Self {
            invocations: Vec::new(),
            summary: None,
            marker: marker.to_string(),
            marker_window: String::new(),
            marker_seen: false,
            text_chars: 0,
            partial_line: String::new(),
            tail: VecDeque::with_capacity(TAIL_LINES),
            compaction_requested: false,
        }
    }

    fn open_count(&self) -> usize {
        self.invocations
            .iter()
            .filter(|inv| inv.state == ToolState::Open)
            .count()
    }

    /// Apply one event. Returns true when it announces compaction.
    fn apply(&mut self, event: &StreamEvent) -> bool {
        match &event.kind {
            EventKind::TextDelta { text } => {
                self.text_chars += text.chars().count() as u64;
                self.scan_marker(text);
                let mut compaction = is_compaction_notice(text);
                for line in self.push_text(text) {
                    compaction |= is_compaction_notice(&line);
                }
                compaction
            }
            EventKind::ToolInvocationStart {
                id,
                name,
                input,
                truncated,
            } => {
                if self.invocations.iter().any(|inv| &inv.id == id) {
                    warn!(id = %id, "duplicate tool start ignored");
                } else {
                    self.invocations.push(ToolInvocation::open(
                        id,
                        name,
                        input.clone(),
                        *truncated,
                        event.at,
                    ));
                }
                false
            }
            EventKind::ToolInvocationResult {
                id,
                output,
                is_error,
                truncated,
            } => {
                match self
                    .invocations
                    .iter_mut()
                    .find(|inv| &inv.id == id && inv.state == ToolState::Open)
                {
                    Some(invocation) => invocation.close(output, *is_error, *truncated, event.at),
                    None => warn!(id = %id, "tool result without a matching start"),
                }
                false
            }
            EventKind::RunSummary(summary) => {
                if let Some(text) = &summary.result {
                    self.scan_marker(text);
                }
                self.summary = Some(summary.clone());
                false
            }
            EventKind::UnrecognizedPayload { stream, raw } => {
                if *stream == OutputStream::Stderr {
                    self.push_tail(raw.clone());
                }
                is_compaction_notice(raw)
            }
        }
    }

    fn scan_marker(&mut self, text: &str) {
        if self.marker_seen {
            return;
        }
        self.marker_window.push_str(text);
        if self.marker_window.contains(&self.marker) {
            self.marker_seen = true;
            self.marker_window.clear();
            return;
        }
        // Keep just enough to match a marker split across deltas.
        let keep = self.marker.len();
        if self.marker_window.len() > keep {
            let mut cut = self.marker_window.len() - keep;
            while !self.marker_window.is_char_boundary(cut) {
                cut -= 1;
            }
            self.marker_window.drain(..cut);
        }
    }

    fn push_text(&mut self, text: &str) -> Vec<String> {
        self.partial_line.push_str(text);
        let mut completed = Vec::new();
        while let Some(pos) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=pos).collect();
            let line = line.trim_end().to_string();
            self.push_tail(line.clone());
            completed.push(line);
        }
        completed
    }

    fn push_tail(&mut self, line: String) {
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn finalize(mut self, inputs: &FinalizeInputs<'_>) -> IterationResult {
        if !self.partial_line.trim().is_empty() {
            let rest = std::mem::take(&mut self.partial_line);
            self.push_tail(rest.trim_end().to_string());
        }
        for invocation in &mut self.invocations {
            if invocation.state == ToolState::Open {
                invocation.orphan();
            }
        }

        let hit_turn_budget = self.summary.as_ref().is_some_and(RunSummary::hit_turn_budget)
            || self
                .summary
                .as_ref()
                .and_then(|s| s.result.as_deref())
                .is_some_and(mentions_max_turns)
            || self.tail.iter().any(|line| mentions_max_turns(line));
        let termination = inputs.exit.termination;
        let signals = ExitSignals {
            timed_out: termination == Termination::TimedOut,
            interrupted: termination == Termination::Stopped(StopReason::Cancelled),
            compacted: termination == Termination::Stopped(StopReason::Compaction),
            stopped_on_commit: termination == Termination::Stopped(StopReason::CommitLanded),
            hit_turn_budget,
            expects_summary: inputs.protocol.emits_run_summary(),
            summary_seen: self.summary.is_some(),
            summary_is_error: self.summary.as_ref().is_some_and(|s| s.is_error),
            exit_code: inputs.exit.code,
        };
        let failure = classify_exit(&signals);

        let reported = self
            .summary
            .as_ref()
            .and_then(|s| Some((s.input_tokens?, s.output_tokens?)));
        let (input_tokens, output_tokens, tokens_estimated) = match reported {
            Some((input, output)) => (input, output, false),
            None => (estimate_tokens(inputs.prompt), self.text_chars / 4, true),
        };

        IterationResult {
            iteration: inputs.iteration,
            success: failure.is_none(),
            failure,
            duration_ms: duration_ms(inputs.exit.elapsed),
            input_tokens,
            output_tokens,
            tokens_estimated,
            invocations: self.invocations,
            exit_code: inputs.exit.code,
            summary: self.summary,
            completion_marker_seen: self.marker_seen,
            stopped_on_commit: signals.stopped_on_commit,
            parse_anomalies: inputs.anomalies,
            event_count: inputs.events,
            output_tail: self.tail.into_iter().collect(),
        }
    }
}
