//! Shared deterministic types for the iteration execution core.
//!
//! These types define the contracts between the supervisor, the stream
//! parser, the sinks and the controllers. They carry no I/O handles and
//! render identically across runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable description of one child-process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Environment overrides applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Payload written to the child's stdin (stdin is null when `None`).
    pub stdin: Option<String>,
    /// Wall-clock budget for the whole child lifetime.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL when the child must be stopped.
    pub grace: Duration,
    /// Turn budget passed to the agent, if it supports one.
    pub max_turns: Option<u32>,
}

impl Invocation {
    /// Render `program args...` for headers, eliding long arguments.
    pub fn display_command(&self, max_arg_len: usize) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            if arg.chars().count() > max_arg_len {
                parts.push(format!("[{} chars]", arg.chars().count()));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

/// Which child stream a chunk or payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One read from the child, stamped with the time since process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
    pub at: Duration,
}

/// How the agent encodes its standard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamProtocol {
    /// Newline-delimited JSON in the `stream-json` shape (Claude CLI).
    ClaudeStreamJson,
    /// Free text; every line is a text delta and no summary is emitted.
    PlainText,
}

impl StreamProtocol {
    /// Whether a well-behaved child ends its stream with a run summary.
    pub fn emits_run_summary(self) -> bool {
        matches!(self, StreamProtocol::ClaudeStreamJson)
    }
}

/// Terminal summary reported by the agent protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Protocol stop reason (`success`, `error_max_turns`, ...).
    pub stop_reason: String,
    pub is_error: bool,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub result: Option<String>,
}

impl RunSummary {
    pub fn hit_turn_budget(&self) -> bool {
        self.stop_reason == "error_max_turns"
    }
}

/// Typed event reconstructed from the child's output.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    TextDelta {
        text: String,
    },
    ToolInvocationStart {
        id: String,
        name: String,
        input: Value,
        /// Payload was cut off before its closing marker.
        truncated: bool,
    },
    ToolInvocationResult {
        id: String,
        output: String,
        is_error: bool,
        truncated: bool,
    },
    RunSummary(RunSummary),
    UnrecognizedPayload {
        stream: OutputStream,
        raw: String,
    },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::TextDelta { .. } => "TEXT",
            EventKind::ToolInvocationStart { .. } => "TOOL_START",
            EventKind::ToolInvocationResult { .. } => "TOOL_RESULT",
            EventKind::RunSummary(_) => "RUN_SUMMARY",
            EventKind::UnrecognizedPayload { .. } => "UNRECOGNIZED",
        }
    }
}

/// A parsed event with its gap-free sequence number and capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// 1-based, gap-free within one iteration.
    pub seq: u64,
    /// Time since process start, millisecond precision.
    pub at: Duration,
    pub kind: EventKind,
}

/// Lifecycle of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolState {
    Open,
    Closed,
    /// The process exited while the invocation was still open.
    Orphaned,
}

/// A tool invocation correlated with its result by id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub output: Option<String>,
    pub is_error: bool,
    pub truncated: bool,
    pub started_ms: u64,
    pub ended_ms: Option<u64>,
    pub state: ToolState,
}

impl ToolInvocation {
    pub fn open(id: &str, name: &str, input: Value, truncated: bool, at: Duration) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            input,
            output: None,
            is_error: false,
            truncated,
            started_ms: duration_ms(at),
            ended_ms: None,
            state: ToolState::Open,
        }
    }

    pub fn close(&mut self, output: &str, is_error: bool, truncated: bool, at: Duration) {
        self.output = Some(output.to_string());
        self.is_error = is_error;
        self.truncated |= truncated;
        self.ended_ms = Some(duration_ms(at));
        self.state = ToolState::Closed;
    }

    pub fn orphan(&mut self) {
        self.state = ToolState::Orphaned;
    }
}

/// Recoverable reasons an iteration did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    TimeoutExceeded,
    TurnBudgetExceeded,
    NonZeroExit,
    /// The stream ended without the protocol's run summary.
    StreamTruncated,
    /// The agent announced conversation compaction and was stopped early.
    ContextCompacted,
    /// An external stop request aborted the iteration.
    Interrupted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::TimeoutExceeded => "TimeoutExceeded",
            FailureKind::TurnBudgetExceeded => "TurnBudgetExceeded",
            FailureKind::NonZeroExit => "NonZeroExit",
            FailureKind::StreamTruncated => "StreamTruncated",
            FailureKind::ContextCompacted => "ContextCompacted",
            FailureKind::Interrupted => "Interrupted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome record of one iteration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Token counts are chars/4 estimates rather than reported usage.
    pub tokens_estimated: bool,
    pub invocations: Vec<ToolInvocation>,
    pub exit_code: Option<i32>,
    pub summary: Option<RunSummary>,
    pub completion_marker_seen: bool,
    /// The child was stopped early because a commit landed.
    pub stopped_on_commit: bool,
    pub parse_anomalies: usize,
    pub event_count: u64,
    /// Last lines of raw output, for diagnostics.
    pub output_tail: Vec<String>,
}

impl IterationResult {
    pub fn closed_count(&self) -> usize {
        self.count_state(ToolState::Closed)
    }

    pub fn orphaned_count(&self) -> usize {
        self.count_state(ToolState::Orphaned)
    }

    pub fn outcome_label(&self) -> &'static str {
        match self.failure {
            Some(kind) => kind.as_str(),
            None => "success",
        }
    }

    fn count_state(&self, state: ToolState) -> usize {
        self.invocations
            .iter()
            .filter(|inv| inv.state == state)
            .count()
    }
}

/// Saturating millisecond conversion used for every persisted timestamp.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Estimate token count from text length (chars / 4).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}
