//! Incremental decoder for the agent's output stream.
//!
//! The parser is push-driven: the controller hands it raw chunks exactly as
//! the supervisor read them, and it returns the events those bytes complete.
//! Nothing here assumes that a read holds a whole line, or that a line holds
//! a whole tool payload. Tool inputs streamed as `input_json_delta` fragments
//! are accumulated per invocation id until the block closes.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::core::types::{
    EventKind, OutputChunk, OutputStream, RunSummary, StreamEvent, StreamProtocol, duration_ms,
};

static TOOL_USE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""type"\s*:\s*"tool_use""#).expect("valid tool_use regex"));
static TOOL_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""id"\s*:\s*"([^"\\]+)""#).expect("valid id regex"));
static TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""name"\s*:\s*"([^"\\]+)""#).expect("valid name regex"));
static TOOL_RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""tool_use_id"\s*:\s*"([^"\\]+)""#).expect("valid tool_result regex")
});
static INPUT_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""input"\s*:\s*"#).expect("valid input regex"));
static CONTENT_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""content"\s*:\s*"#).expect("valid content regex"));

/// A malformed unit that was passed through instead of aborting the iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAnomaly {
    pub at: Duration,
    pub reason: String,
    pub excerpt: String,
}

/// Tool input being assembled from streamed fragments.
#[derive(Debug, Clone)]
struct Fragment {
    id: String,
    name: String,
    partial_json: String,
}

/// Push-model parser for one iteration's output.
#[derive(Debug)]
pub struct StreamParser {
    protocol: StreamProtocol,
    next_seq: u64,
    last_at: Duration,
    stdout_line: Vec<u8>,
    stderr_line: Vec<u8>,
    /// Open fragments in start order.
    fragments: Vec<Fragment>,
    /// Streamed content block index -> invocation id.
    block_ids: HashMap<u64, String>,
    streamed_messages: HashSet<String>,
    started_tools: HashSet<String>,
    anomalies: Vec<ParseAnomaly>,
}

impl StreamParser {
    pub fn new(protocol: StreamProtocol) -> Self {
        Self {
            protocol,
            next_seq: 0,
            last_at: Duration::ZERO,
            stdout_line: Vec::new(),
            stderr_line: Vec::new(),
            fragments: Vec::new(),
            block_ids: HashMap::new(),
            streamed_messages: HashSet::new(),
            started_tools: HashSet::new(),
            anomalies: Vec::new(),
        }
    }

    pub fn protocol(&self) -> StreamProtocol {
        self.protocol
    }

    /// Anomalies seen so far, in arrival order.
    pub fn anomalies(&self) -> &[ParseAnomaly] {
        &self.anomalies
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_seq
    }

    /// Consume one chunk and return every event it completes.
    pub fn push(&mut self, chunk: &OutputChunk) -> Vec<StreamEvent> {
        self.last_at = self.last_at.max(chunk.at);
        let mut events = Vec::new();

        let mut pending = std::mem::take(self.line_buffer(chunk.stream));
        pending.extend_from_slice(&chunk.bytes);
        let mut start = 0;
        while let Some(pos) = pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let line = String::from_utf8_lossy(&pending[start..end]);
            let line = line.trim_end_matches('\r').to_string();
            self.handle_line(chunk.stream, &line, chunk.at, &mut events);
            start = end + 1;
        }
        pending.drain(..start);
        *self.line_buffer(chunk.stream) = pending;

        events
    }

    /// Flush everything still buffered once the stream has closed.
    ///
    /// Partial lines and unclosed tool fragments are emitted with
    /// `truncated = true` rather than dropped.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let at = self.last_at;
        let mut events = Vec::new();

        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let pending = std::mem::take(self.line_buffer(stream));
            if pending.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(&pending).to_string();
            self.handle_trailing_line(stream, &line, at, &mut events);
        }

        let open = std::mem::take(&mut self.fragments);
        self.block_ids.clear();
        for fragment in open {
            debug!(id = %fragment.id, "tool input fragment left open at end of stream");
            self.finalize_fragment(fragment, true, at, &mut events);
        }

        events
    }

    fn line_buffer(&mut self, stream: OutputStream) -> &mut Vec<u8> {
        match stream {
            OutputStream::Stdout => &mut self.stdout_line,
            OutputStream::Stderr => &mut self.stderr_line,
        }
    }

    fn handle_line(
        &mut self,
        stream: OutputStream,
        line: &str,
        at: Duration,
        events: &mut Vec<StreamEvent>,
    ) {
        if line.trim().is_empty() {
            return;
        }
        match (stream, self.protocol) {
            (OutputStream::Stderr, _) => self.emit(
                EventKind::UnrecognizedPayload {
                    stream,
                    raw: line.to_string(),
                },
                at,
                events,
            ),
            (OutputStream::Stdout, StreamProtocol::PlainText) => self.emit(
                EventKind::TextDelta {
                    text: format!("{line}\n"),
                },
                at,
                events,
            ),
            (OutputStream::Stdout, StreamProtocol::ClaudeStreamJson) => {
                match serde_json::from_str::<Value>(line) {
                    Ok(value) => self.handle_json(&value, line, at, events),
                    Err(err) => {
                        self.record_anomaly(at, &format!("non-JSON stdout line: {err}"), line);
                        self.emit(
                            EventKind::UnrecognizedPayload {
                                stream,
                                raw: line.to_string(),
                            },
                            at,
                            events,
                        );
                    }
                }
            }
        }
    }

    fn handle_trailing_line(
        &mut self,
        stream: OutputStream,
        line: &str,
        at: Duration,
        events: &mut Vec<StreamEvent>,
    ) {
        if line.trim().is_empty() {
            return;
        }
        if stream == OutputStream::Stdout
            && self.protocol == StreamProtocol::ClaudeStreamJson
            && serde_json::from_str::<Value>(line).is_err()
        {
            self.salvage_partial(line, at, events);
            return;
        }
        self.handle_line(stream, line, at, events);
    }

    fn handle_json(
        &mut self,
        value: &Value,
        raw: &str,
        at: Duration,
        events: &mut Vec<StreamEvent>,
    ) {
        match value.get("type").and_then(Value::as_str) {
            Some("assistant") => self.handle_assistant(value, raw, at, events),
            Some("user") => self.handle_user(value, raw, at, events),
            Some("result") => self.emit(EventKind::RunSummary(parse_summary(value)), at, events),
            Some("stream_event") => match value.get("event") {
                Some(event) => self.handle_stream_event(event, raw, at, events),
                None => self.unrecognized(raw, at, events),
            },
            _ => self.unrecognized(raw, at, events),
        }
    }

    fn handle_assistant(
        &mut self,
        value: &Value,
        raw: &str,
        at: Duration,
        events: &mut Vec<StreamEvent>,
    ) {
        let message = value.get("message");
        let Some(content) = message
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            self.unrecognized(raw, at, events);
            return;
        };
        // Text already delivered through partial deltas must not repeat.
        let streamed = message
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .is_some_and(|id| self.streamed_messages.contains(id));

        for item in content {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
                    if !streamed && !text.is_empty() {
                        self.emit(
                            EventKind::TextDelta {
                                text: format!("{text}\n"),
                            },
                            at,
                            events,
                        );
                    }
                }
                Some("tool_use") => {
                    let id = match item.get("id").and_then(Value::as_str) {
                        Some(id) => id.to_string(),
                        None => {
                            self.record_anomaly(at, "tool_use without id", &item.to_string());
                            format!("anonymous-{}", self.next_seq + 1)
                        }
                    };
                    let name = item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let input = item.get("input").cloned().unwrap_or_else(|| json!({}));
                    self.start_tool(&id, &name, input, false, at, events);
                }
                Some("thinking") | Some("redacted_thinking") => {}
                _ => self.emit(
                    EventKind::UnrecognizedPayload {
                        stream: OutputStream::Stdout,
                        raw: item.to_string(),
                    },
                    at,
                    events,
                ),
            }
        }
    }

    fn handle_user(
        &mut self,
        value: &Value,
        raw: &str,
        at: Duration,
        events: &mut Vec<StreamEvent>,
    ) {
        let Some(content) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            self.unrecognized(raw, at, events);
            return;
        };
        for item in content {
            if item.get("type").and_then(Value::as_str) != Some("tool_result") {
                self.emit(
                    EventKind::UnrecognizedPayload {
                        stream: OutputStream::Stdout,
                        raw: item.to_string(),
                    },
                    at,
                    events,
                );
                continue;
            }
            let id = item
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if id.is_empty() {
                self.record_anomaly(at, "tool_result without tool_use_id", &item.to_string());
            }
            let output = flatten_content(item.get("content").unwrap_or(&Value::Null));
            let is_error = item
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            self.emit(
                EventKind::ToolInvocationResult {
                    id,
                    output,
                    is_error,
                    truncated: false,
                },
                at,
                events,
            );
        }
    }

    fn handle_stream_event(
        &mut self,
        event: &Value,
        raw: &str,
        at: Duration,
        events: &mut Vec<StreamEvent>,
    ) {
        let index = event.get("index").and_then(Value::as_u64);
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(id) = event
                    .get("message")
                    .and_then(|m| m.get("id"))
                    .and_then(Value::as_str)
                {
                    self.streamed_messages.insert(id.to_string());
                }
            }
            Some("content_block_start") => {
                let block = event.get("content_block").unwrap_or(&Value::Null);
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let Some(id) = block.get("id").and_then(Value::as_str) else {
                            self.record_anomaly(at, "streamed tool_use without id", raw);
                            return;
                        };
                        let name = block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        if let Some(index) = index {
                            self.block_ids.insert(index, id.to_string());
                        }
                        self.fragments.push(Fragment {
                            id: id.to_string(),
                            name: name.to_string(),
                            partial_json: String::new(),
                        });
                    }
                    Some("text") => {
                        let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                        if !text.is_empty() {
                            self.emit(
                                EventKind::TextDelta {
                                    text: text.to_string(),
                                },
                                at,
                                events,
                            );
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_delta") => {
                let delta = event.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        if !text.is_empty() {
                            self.emit(
                                EventKind::TextDelta {
                                    text: text.to_string(),
                                },
                                at,
                                events,
                            );
                        }
                    }
                    Some("input_json_delta") => {
                        let part = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let fragment = index
                            .and_then(|index| self.block_ids.get(&index))
                            .and_then(|id| self.fragments.iter_mut().find(|f| &f.id == id));
                        match fragment {
                            Some(fragment) => fragment.partial_json.push_str(part),
                            None => self.record_anomaly(at, "input fragment for unknown block", raw),
                        }
                    }
                    Some("thinking_delta") | Some("signature_delta") => {}
                    _ => self.unrecognized(raw, at, events),
                }
            }
            Some("content_block_stop") => {
                let Some(id) = index.and_then(|index| self.block_ids.remove(&index)) else {
                    return;
                };
                if let Some(pos) = self.fragments.iter().position(|f| f.id == id) {
                    let fragment = self.fragments.remove(pos);
                    self.finalize_fragment(fragment, false, at, events);
                }
            }
            Some("message_delta") | Some("message_stop") | Some("ping") => {}
            _ => self.unrecognized(raw, at, events),
        }
    }

    fn finalize_fragment(
        &mut self,
        fragment: Fragment,
        truncated: bool,
        at: Duration,
        events: &mut Vec<StreamEvent>,
    ) {
        let input = if fragment.partial_json.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str::<Value>(&fragment.partial_json) {
                Ok(value) => value,
                Err(err) => {
                    if !truncated {
                        self.record_anomaly(
                            at,
                            &format!("assembled tool input is not JSON: {err}"),
                            &fragment.partial_json,
                        );
                    }
                    Value::String(fragment.partial_json.clone())
                }
            }
        };
        self.start_tool(&fragment.id, &fragment.name, input, truncated, at, events);
    }

    fn start_tool(
        &mut self,
        id: &str,
        name: &str,
        input: Value,
        truncated: bool,
        at: Duration,
        events: &mut Vec<StreamEvent>,
    ) {
        if !self.started_tools.insert(id.to_string()) {
            debug!(id, "tool invocation already started, skipping repeat");
            return;
        }
        self.emit(
            EventKind::ToolInvocationStart {
                id: id.to_string(),
                name: name.to_string(),
                input,
                truncated,
            },
            at,
            events,
        );
    }

    /// Best-effort recovery of a line cut off mid-emission.
    ///
    /// The raw line is always passed through first so the durable log keeps
    /// whatever text the salvaged events leave out.
    fn salvage_partial(&mut self, line: &str, at: Duration, events: &mut Vec<StreamEvent>) {
        self.record_anomaly(at, "stream ended mid-line", line);
        self.unrecognized(line, at, events);

        let tool_starts: Vec<usize> = TOOL_USE_RE.find_iter(line).map(|m| m.start()).collect();
        if !tool_starts.is_empty() {
            for (i, start) in tool_starts.iter().enumerate() {
                let end = tool_starts.get(i + 1).copied().unwrap_or(line.len());
                let segment = &line[*start..end];
                let Some(id) = capture(&TOOL_ID_RE, segment) else {
                    continue;
                };
                let name = capture(&TOOL_NAME_RE, segment).unwrap_or_else(|| "unknown".to_string());
                let partial = tail_after(&INPUT_KEY_RE, segment).unwrap_or(segment);
                self.start_tool(
                    &id,
                    &name,
                    Value::String(partial.to_string()),
                    true,
                    at,
                    events,
                );
            }
            return;
        }

        let result_ids: Vec<(usize, String)> = TOOL_RESULT_RE
            .captures_iter(line)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some((whole.start(), caps.get(1)?.as_str().to_string()))
            })
            .collect();
        if !result_ids.is_empty() {
            for (i, (start, id)) in result_ids.iter().enumerate() {
                let end = result_ids.get(i + 1).map_or(line.len(), |(next, _)| *next);
                let segment = &line[*start..end];
                let output = tail_after(&CONTENT_KEY_RE, segment).unwrap_or_default();
                self.emit(
                    EventKind::ToolInvocationResult {
                        id: id.clone(),
                        output: output.to_string(),
                        is_error: false,
                        truncated: true,
                    },
                    at,
                    events,
                );
            }
        }
    }

    fn unrecognized(&mut self, raw: &str, at: Duration, events: &mut Vec<StreamEvent>) {
        self.emit(
            EventKind::UnrecognizedPayload {
                stream: OutputStream::Stdout,
                raw: raw.to_string(),
            },
            at,
            events,
        );
    }

    fn record_anomaly(&mut self, at: Duration, reason: &str, raw: &str) {
        let excerpt: String = raw.chars().take(200).collect();
        warn!(at_ms = duration_ms(at), reason, "parse anomaly");
        self.anomalies.push(ParseAnomaly {
            at,
            reason: reason.to_string(),
            excerpt,
        });
    }

    fn emit(&mut self, kind: EventKind, at: Duration, events: &mut Vec<StreamEvent>) {
        self.next_seq += 1;
        events.push(StreamEvent {
            seq: self.next_seq,
            at: Duration::from_millis(duration_ms(at)),
            kind,
        });
    }
}

fn parse_summary(value: &Value) -> RunSummary {
    let usage = value.get("usage");
    let usage_field = |key: &str| usage.and_then(|u| u.get(key)).and_then(Value::as_u64);
    RunSummary {
        stop_reason: value
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        num_turns: value
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        input_tokens: usage_field("input_tokens"),
        output_tokens: usage_field("output_tokens"),
        total_cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
        result: value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Flatten tool result content (a string or a list of content blocks).
fn flatten_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item.get("type").and_then(Value::as_str) {
                Some("text") => item.get("text").and_then(Value::as_str).map(str::to_string),
                Some(other) => Some(format!("[{other}]")),
                None => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn tail_after<'a>(re: &Regex, haystack: &'a str) -> Option<&'a str> {
    re.find(haystack).map(|m| &haystack[m.end()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::OutputChunk;

    fn chunk(stream: OutputStream, bytes: &[u8], at_ms: u64) -> OutputChunk {
        OutputChunk {
            stream,
            bytes: bytes.to_vec(),
            at: Duration::from_millis(at_ms),
        }
    }

    fn stdout(bytes: &[u8]) -> OutputChunk {
        chunk(OutputStream::Stdout, bytes, 0)
    }

    fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind.label()).collect()
    }

    fn parse_all(protocol: StreamProtocol, chunks: &[OutputChunk]) -> Vec<StreamEvent> {
        let mut parser = StreamParser::new(protocol);
        let mut events = Vec::new();
        for c in chunks {
            events.extend(parser.push(c));
        }
        events.extend(parser.finish());
        events
    }

    fn tool_starts(events: &[StreamEvent]) -> Vec<(String, String, Value, bool)> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ToolInvocationStart {
                    id,
                    name,
                    input,
                    truncated,
                } => Some((id.clone(), name.clone(), input.clone(), *truncated)),
                _ => None,
            })
            .collect()
    }

    const SCRIPTED: &str = concat!(
        r#"{"type":"system","subtype":"init","session_id":"s1"}"#,
        "\n",
        r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"hi"}]}}"#,
        "\n",
        r#"{"type":"assistant","message":{"id":"m2","content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"src/lib.rs"}}]}}"#,
        "\n",
        r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#,
        "\n",
        r#"{"type":"result","subtype":"success","is_error":false,"num_turns":2,"duration_ms":1200,"usage":{"input_tokens":7,"output_tokens":3},"result":"done"}"#,
        "\n",
    );

    const STREAMED: &str = concat!(
        r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"m9"}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Let me look."}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_stop","index":0}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t7","name":"Bash","input":{}}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"comm"}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"and\": \"cargo"}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":" test\"}"}}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"content_block_stop","index":1}}"#,
        "\n",
        r#"{"type":"assistant","message":{"id":"m9","content":[{"type":"text","text":"Let me look."},{"type":"tool_use","id":"t7","name":"Bash","input":{"command":"cargo test"}}]}}"#,
        "\n",
        r#"{"type":"stream_event","event":{"type":"message_stop"}}"#,
        "\n",
    );

    #[test]
    fn decodes_scripted_stream_in_order() {
        let events = parse_all(StreamProtocol::ClaudeStreamJson, &[stdout(SCRIPTED.as_bytes())]);
        assert_eq!(
            kinds(&events),
            vec!["UNRECOGNIZED", "TEXT", "TOOL_START", "TOOL_RESULT", "RUN_SUMMARY"]
        );
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        let EventKind::RunSummary(summary) = &events[4].kind else {
            panic!("expected summary, got {:?}", events[4].kind);
        };
        assert_eq!(summary.stop_reason, "success");
        assert_eq!(summary.num_turns, Some(2));
        assert_eq!(summary.input_tokens, Some(7));
        assert_eq!(summary.output_tokens, Some(3));
        assert_eq!(summary.result.as_deref(), Some("done"));
    }

    #[test]
    fn assembles_streamed_tool_input_and_skips_repeated_message() {
        let events = parse_all(StreamProtocol::ClaudeStreamJson, &[stdout(STREAMED.as_bytes())]);
        assert_eq!(kinds(&events), vec!["TEXT", "TOOL_START"]);
        assert_eq!(
            tool_starts(&events),
            vec![(
                "t7".to_string(),
                "Bash".to_string(),
                json!({"command": "cargo test"}),
                false
            )]
        );
    }

    #[test]
    fn chunk_boundaries_do_not_change_tool_invocations() {
        let whole = parse_all(StreamProtocol::ClaudeStreamJson, &[stdout(STREAMED.as_bytes())]);
        let bytes = STREAMED.as_bytes();
        for split in 1..bytes.len() {
            let events = parse_all(
                StreamProtocol::ClaudeStreamJson,
                &[stdout(&bytes[..split]), stdout(&bytes[split..])],
            );
            assert_eq!(events, whole, "split at byte {split}");
        }

        let byte_by_byte: Vec<OutputChunk> = bytes.iter().map(|b| stdout(&[*b])).collect();
        let events = parse_all(StreamProtocol::ClaudeStreamJson, &byte_by_byte);
        assert_eq!(tool_starts(&events), tool_starts(&whole));
    }

    #[test]
    fn non_json_line_is_passed_through_as_anomaly() {
        let mut parser = StreamParser::new(StreamProtocol::ClaudeStreamJson);
        let events = parser.push(&stdout(b"warning: not json\n"));
        assert_eq!(
            events[0].kind,
            EventKind::UnrecognizedPayload {
                stream: OutputStream::Stdout,
                raw: "warning: not json".to_string()
            }
        );
        assert_eq!(parser.anomalies().len(), 1);
    }

    #[test]
    fn stderr_lines_are_tagged_and_reassembled() {
        let events = parse_all(
            StreamProtocol::ClaudeStreamJson,
            &[
                chunk(OutputStream::Stderr, b"rate lim", 3),
                chunk(OutputStream::Stderr, b"ited\r\n", 4),
            ],
        );
        assert_eq!(
            events,
            vec![StreamEvent {
                seq: 1,
                at: Duration::from_millis(4),
                kind: EventKind::UnrecognizedPayload {
                    stream: OutputStream::Stderr,
                    raw: "rate limited".to_string(),
                },
            }]
        );
    }

    #[test]
    fn open_fragment_at_end_of_stream_is_truncated() {
        let stream = concat!(
            r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t2","name":"Write","input":{}}}}"#,
            "\n",
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"file_path\": \"a.rs\", \"cont"}}}"#,
            "\n",
        );
        let events = parse_all(StreamProtocol::ClaudeStreamJson, &[stdout(stream.as_bytes())]);
        assert_eq!(
            tool_starts(&events),
            vec![(
                "t2".to_string(),
                "Write".to_string(),
                Value::String(r#"{"file_path": "a.rs", "cont"#.to_string()),
                true
            )]
        );
    }

    #[test]
    fn partial_tool_use_line_is_salvaged() {
        let partial = r#"{"type":"assistant","message":{"id":"m3","content":[{"type":"tool_use","id":"t3","name":"Edit","input":{"file_path":"src/ma"#;
        let mut parser = StreamParser::new(StreamProtocol::ClaudeStreamJson);
        assert!(parser.push(&stdout(partial.as_bytes())).is_empty());
        let events = parser.finish();
        assert_eq!(
            tool_starts(&events),
            vec![(
                "t3".to_string(),
                "Edit".to_string(),
                Value::String(r#"{"file_path":"src/ma"#.to_string()),
                true
            )]
        );
    }

    #[test]
    fn partial_tool_result_line_is_salvaged() {
        let partial = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t4","content":"line one"#;
        let events = parse_all(StreamProtocol::ClaudeStreamJson, &[stdout(partial.as_bytes())]);
        assert_eq!(kinds(&events), vec!["UNRECOGNIZED", "TOOL_RESULT"]);
        assert_eq!(
            events[1].kind,
            EventKind::ToolInvocationResult {
                id: "t4".to_string(),
                output: r#""line one"#.to_string(),
                is_error: false,
                truncated: true,
            }
        );
    }

    #[test]
    fn partial_line_with_text_and_tool_keeps_raw_text() {
        let partial = r#"{"type":"assistant","message":{"id":"m4","content":[{"type":"text","text":"Checking the build first."},{"type":"tool_use","id":"t6","name":"Bash","input":{"command":"cargo b"#;
        let mut parser = StreamParser::new(StreamProtocol::ClaudeStreamJson);
        assert!(parser.push(&stdout(partial.as_bytes())).is_empty());
        let events = parser.finish();
        assert_eq!(kinds(&events), vec!["UNRECOGNIZED", "TOOL_START"]);
        let EventKind::UnrecognizedPayload { raw, .. } = &events[0].kind else {
            panic!("expected raw payload, got {:?}", events[0].kind);
        };
        assert!(raw.contains("Checking the build first."));
        assert_eq!(tool_starts(&events)[0].0, "t6");
        assert_eq!(parser.anomalies().len(), 1);
    }

    #[test]
    fn tool_result_blocks_are_flattened() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t5","is_error":true,"content":[{"type":"text","text":"a"},{"type":"image"},{"type":"text","text":"b"}]}]}}"#;
        let events = parse_all(
            StreamProtocol::ClaudeStreamJson,
            &[stdout(format!("{line}\n").as_bytes())],
        );
        assert_eq!(
            events[0].kind,
            EventKind::ToolInvocationResult {
                id: "t5".to_string(),
                output: "a\n[image]\nb".to_string(),
                is_error: true,
                truncated: false,
            }
        );
    }

    #[test]
    fn plain_text_protocol_emits_lines() {
        let events = parse_all(
            StreamProtocol::PlainText,
            &[stdout(b"first\nsec"), stdout(b"ond")],
        );
        let texts: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::TextDelta { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["first\n".to_string(), "second\n".to_string()]);
    }
}
