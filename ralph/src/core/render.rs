//! Pure formatting for the compact console view and the durable log.
//!
//! Every function here is a deterministic function of its arguments so the
//! same event sequence always renders to the same bytes.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use similar::{ChangeTag, TextDiff};

use crate::core::types::{
    EventKind, IterationResult, StreamEvent, ToolInvocation, ToolState, duration_ms,
};

static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)exit code[:\s]+(\d+)").expect("valid exit code regex"));
static ERROR_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<error>(.*?)</error>").expect("valid error tag regex"));

pub const HEAVY_RULE: &str =
    "══════════════════════════════════════════════════════════════════════";
pub const LIGHT_RULE: &str =
    "──────────────────────────────────────────────────────────────────────";

/// Truncate to `max` characters, marking the cut with `...`.
pub fn truncate_text(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tool_emoji(name: &str) -> &'static str {
    match name {
        "Read" => "📖",
        "Edit" | "MultiEdit" => "✏️",
        "Write" => "📝",
        "Bash" => "⚡",
        "Glob" => "🔍",
        "Grep" => "🔎",
        "Task" => "🤖",
        "WebFetch" => "🌐",
        "WebSearch" => "🔍",
        "AskUserQuestion" => "❓",
        "TodoWrite" => "📋",
        _ => "🔧",
    }
}

fn input_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

/// One-line description of a tool input for the compact view.
pub fn tool_input_summary(name: &str, input: &Value) -> String {
    if let Value::String(raw) = input {
        return format!("(partial) {}", truncate_text(&single_line(raw), 60));
    }
    match name {
        "Read" => {
            let path = input_str(input, "file_path").unwrap_or("?");
            let offset = input.get("offset").and_then(Value::as_u64);
            let limit = input.get("limit").and_then(Value::as_u64);
            match (offset, limit) {
                (Some(offset), Some(limit)) => {
                    format!("{path} (lines {offset}-{})", offset.saturating_add(limit))
                }
                (Some(offset), None) => format!("{path} (from line {offset})"),
                _ => path.to_string(),
            }
        }
        "Edit" | "MultiEdit" | "Write" => input_str(input, "file_path").unwrap_or("?").to_string(),
        "Bash" => truncate_text(&single_line(input_str(input, "command").unwrap_or("")), 60),
        "Glob" => input_str(input, "pattern").unwrap_or("?").to_string(),
        "Grep" => {
            let pattern = truncate_text(input_str(input, "pattern").unwrap_or("?"), 50);
            match input_str(input, "path") {
                Some(path) => format!("{pattern} in {path}"),
                None => pattern,
            }
        }
        "Task" => truncate_text(
            &single_line(
                input_str(input, "description")
                    .or_else(|| input_str(input, "prompt"))
                    .unwrap_or(""),
            ),
            50,
        ),
        "WebFetch" => input_str(input, "url").unwrap_or("?").to_string(),
        "WebSearch" => truncate_text(input_str(input, "query").unwrap_or("?"), 60),
        "TodoWrite" => todo_summary(input),
        _ => truncate_text(&single_line(&input.to_string()), 60),
    }
}

fn todo_summary(input: &Value) -> String {
    let Some(todos) = input.get("todos").and_then(Value::as_array) else {
        return "0 items".to_string();
    };
    let count = |status: &str| {
        todos
            .iter()
            .filter(|t| t.get("status").and_then(Value::as_str) == Some(status))
            .count()
    };
    format!(
        "{} items ({} done, {} in progress, {} pending)",
        todos.len(),
        count("completed"),
        count("in_progress"),
        count("pending")
    )
}

/// Second line of a compact tool block.
pub fn tool_result_line(name: &str, output: &str, is_error: bool) -> String {
    if let Some(caps) = ERROR_TAG_RE.captures(output) {
        let message = caps.get(1).map_or("", |m| m.as_str());
        return format!("  ✗ Error: {}", truncate_text(&single_line(message), 200));
    }
    if is_error {
        return format!("  ✗ Error: {}", truncate_text(&single_line(output), 200));
    }
    if name == "Bash" {
        let code = EXIT_CODE_RE
            .captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<i32>().ok())
            .unwrap_or(0);
        let mark = if code == 0 { "✓" } else { "✗" };
        let preview = truncate_text(&single_line(output), 64);
        return if preview.is_empty() {
            format!("  {mark} Exit {code}")
        } else {
            format!("  {mark} Exit {code}: {preview}")
        };
    }
    let len = output.chars().count();
    if len > 1000 {
        format!("  ✓ Completed ({len} chars)")
    } else {
        "  ✓ Completed".to_string()
    }
}

/// Atomic two-line compact block for one tool invocation.
pub fn compact_block(invocation: &ToolInvocation) -> String {
    let first = format!(
        "{} {}: {}",
        tool_emoji(&invocation.name),
        invocation.name,
        tool_input_summary(&invocation.name, &invocation.input)
    );
    let second = match (&invocation.state, &invocation.output) {
        (ToolState::Closed, Some(output)) => {
            tool_result_line(&invocation.name, output, invocation.is_error)
        }
        _ => "  ⚠ No result (process ended first)".to_string(),
    };
    format!("{first}\n{second}\n")
}

/// Compact line for a finished iteration.
pub fn compact_outcome(result: &IterationResult) -> String {
    match result.failure {
        None => format!(
            "✅ Iteration {} complete ({:.1}s, {} tools)\n",
            result.iteration,
            result.duration_ms as f64 / 1000.0,
            result.invocations.len()
        ),
        Some(kind) => {
            let detail = result
                .output_tail
                .iter()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(|line| truncate_text(&single_line(line), 100))
                .unwrap_or_default();
            format!(
                "❌ Iteration {} failed: {kind}\n   {detail}\n",
                result.iteration
            )
        }
    }
}

/// Indent every line after the first so continuation lines stay attached.
fn indent_continuation(text: &str) -> String {
    let mut lines = text.split('\n');
    let mut out = lines.next().unwrap_or_default().to_string();
    for line in lines {
        out.push_str("\n    ");
        out.push_str(line);
    }
    out
}

/// Durable entry for one event: `[+000123ms #0004] KIND ...`.
pub fn durable_event(event: &StreamEvent) -> String {
    let prefix = format!(
        "[+{:06}ms #{:04}] {}",
        duration_ms(event.at),
        event.seq,
        event.kind.label()
    );
    let body = match &event.kind {
        EventKind::TextDelta { text } => format!(" {text:?}"),
        EventKind::ToolInvocationStart {
            id,
            name,
            input,
            truncated,
        } => {
            let payload = match input {
                Value::String(raw) => raw.clone(),
                other => {
                    serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
                }
            };
            let flag = if *truncated { " [truncated]" } else { "" };
            format!(" {name} id={id}{flag}\n{payload}")
        }
        EventKind::ToolInvocationResult {
            id,
            output,
            is_error,
            truncated,
        } => {
            let status = if *is_error { "error" } else { "ok" };
            let flag = if *truncated { " [truncated]" } else { "" };
            format!(" id={id} status={status}{flag}\n{output}")
        }
        EventKind::RunSummary(summary) => {
            let json = serde_json::to_string(summary).unwrap_or_default();
            format!(" {json}")
        }
        EventKind::UnrecognizedPayload { stream, raw } => {
            format!(" [{}] {raw}", stream.as_str())
        }
    };
    format!("{}\n", indent_continuation(&format!("{prefix}{body}")))
}

/// Run-level header written once when the durable log is opened.
pub fn run_header(started_at: &str, workdir: &str, settings: &[(String, String)]) -> String {
    let mut out = String::new();
    out.push_str(HEAVY_RULE);
    out.push_str("\nRALPH RUN\n");
    out.push_str(HEAVY_RULE);
    out.push('\n');
    out.push_str(&format!("started:  {started_at}\nworkdir:  {workdir}\n"));
    for (key, value) in settings {
        out.push_str(&format!("{key}: {value}\n"));
    }
    out.push_str(HEAVY_RULE);
    out.push_str("\n\n");
    out
}

/// Per-iteration header: start marker, command, settings and prompt.
pub fn iteration_header(
    iteration: u32,
    started_at: &str,
    command: &str,
    env: &[(String, String)],
    settings: &[(String, String)],
    prompt_section: &str,
) -> String {
    let mut out = format!("=== ITERATION {iteration} START ===\n");
    out.push_str(LIGHT_RULE);
    out.push('\n');
    out.push_str(&format!("started: {started_at}\ncommand: {command}\n"));
    if !env.is_empty() {
        out.push_str("env:\n");
        for (key, value) in env {
            out.push_str(&format!("  {key}={value}\n"));
        }
    }
    for (key, value) in settings {
        out.push_str(&format!("{key}: {value}\n"));
    }
    out.push_str(prompt_section);
    out.push_str(LIGHT_RULE);
    out.push('\n');
    out
}

const PROMPT_DIFF_LINES: usize = 20;

/// The prompt sent to the agent: in full the first time, afterwards as the
/// lines that changed since the previous iteration.
pub fn prompt_block(iteration: u32, prompt: &str, previous: Option<&str>) -> String {
    let chars = prompt.chars().count();
    let Some(previous) = previous else {
        let mut out = format!("prompt ({chars} chars):\n");
        for line in prompt.lines() {
            out.push_str(&format!("  | {line}\n"));
        }
        return out;
    };

    let delta = chars as i64 - previous.chars().count() as i64;
    let mut out = format!(
        "prompt ({chars} chars, {delta:+} since iteration {}):\n",
        iteration.saturating_sub(1)
    );
    let diff = TextDiff::from_lines(previous, prompt);
    let mut changed = Vec::new();
    let mut unchanged_chars = 0;
    for change in diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n');
        match change.tag() {
            ChangeTag::Equal => unchanged_chars += line.chars().count(),
            ChangeTag::Delete => changed.push(format!("  - {line}")),
            ChangeTag::Insert => changed.push(format!("  + {line}")),
        }
    }
    if changed.is_empty() {
        out.push_str("  (unchanged)\n");
        return out;
    }
    for line in changed.iter().take(PROMPT_DIFF_LINES) {
        out.push_str(line);
        out.push('\n');
    }
    if changed.len() > PROMPT_DIFF_LINES {
        out.push_str(&format!(
            "  ... {} more changed lines\n",
            changed.len() - PROMPT_DIFF_LINES
        ));
    }
    if unchanged_chars > 0 {
        out.push_str(&format!("  ({unchanged_chars} unchanged chars omitted)\n"));
    }
    out
}

/// Per-iteration footer: outcome details, diagnostic tail on failure, end marker.
pub fn iteration_footer(result: &IterationResult) -> String {
    let mut out = String::new();
    out.push_str(LIGHT_RULE);
    out.push('\n');
    out.push_str(&format!(
        "duration: {:.1}s\n",
        result.duration_ms as f64 / 1000.0
    ));
    let estimated = if result.tokens_estimated {
        " (estimated)"
    } else {
        ""
    };
    out.push_str(&format!(
        "tokens: {} in / {} out{estimated}\n",
        result.input_tokens, result.output_tokens
    ));
    out.push_str(&format!(
        "tools: {} total, {} closed, {} orphaned\n",
        result.invocations.len(),
        result.closed_count(),
        result.orphaned_count()
    ));
    let exit = match result.exit_code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    };
    out.push_str(&format!("exit: {exit}\n"));
    out.push_str(&format!("outcome: {}\n", result.outcome_label()));
    if result.parse_anomalies > 0 {
        out.push_str(&format!("parse anomalies: {}\n", result.parse_anomalies));
    }
    if result.completion_marker_seen {
        out.push_str("completion marker: seen\n");
    }
    if result.stopped_on_commit {
        out.push_str("stopped: commit landed\n");
    }
    if result.failure.is_some() && !result.output_tail.is_empty() {
        out.push_str("last output:\n");
        for line in &result.output_tail {
            out.push_str(&format!("  | {line}\n"));
        }
    }
    out.push_str(LIGHT_RULE);
    out.push('\n');
    out.push_str(&format!("=== ITERATION {} END ===\n\n", result.iteration));
    out
}

/// Totals written when the loop exits, on every exit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTotals {
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub commits: u32,
    pub elapsed_ms: u64,
    pub stop_reason: String,
}

pub fn run_summary(totals: &RunTotals, finished_at: &str) -> String {
    let mut out = String::new();
    out.push_str(HEAVY_RULE);
    out.push_str("\nRUN SUMMARY\n");
    out.push_str(HEAVY_RULE);
    out.push('\n');
    out.push_str(&format!("finished:   {finished_at}\n"));
    out.push_str(&format!("iterations: {}\n", totals.iterations));
    out.push_str(&format!(
        "tokens:     {} in / {} out\n",
        totals.input_tokens, totals.output_tokens
    ));
    out.push_str(&format!("commits:    {}\n", totals.commits));
    out.push_str(&format!(
        "elapsed:    {:.1}s\n",
        totals.elapsed_ms as f64 / 1000.0
    ));
    out.push_str(&format!("stop:       {}\n", totals.stop_reason));
    out.push_str(HEAVY_RULE);
    out.push('\n');
    out
}
