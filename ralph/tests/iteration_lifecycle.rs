//! End-to-end tests for one supervised iteration.
//!
//! Each test launches a real shell script as the agent, so the full path is
//! exercised: process supervision, chunk delivery, stream parsing, both
//! sinks and exit classification.
#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use ralph::core::types::{FailureKind, IterationResult, StreamProtocol, ToolState};
use ralph::io::agent::LaunchSettings;
use ralph::io::config::RalphConfig;
use ralph::io::git::CommitMark;
use ralph::io::process::CancelToken;
use ralph::io::sink::DualSinkLogger;
use ralph::iteration::{ControllerState, IterationConfig, IterationController};
use ralph::test_support::{FakeCommitGate, emit_lines, script_agent, write_script};

const TEXT: &str = r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Reading the entry point.\n"}]}}"#;
const TOOL_USE: &str = r#"{"type":"assistant","message":{"id":"m2","content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"src/lib.rs"}}]}}"#;
const TOOL_RESULT: &str = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"pub mod core;"}]}}"#;
const SUMMARY: &str = r#"{"type":"result","subtype":"success","is_error":false,"num_turns":2,"duration_ms":900,"usage":{"input_tokens":120,"output_tokens":45},"result":"read it"}"#;

struct Run {
    result: IterationResult,
    state: ControllerState,
    compact: String,
    blocks: usize,
    log: String,
    elapsed: Duration,
}

/// Knobs for one scripted iteration.
struct Setup<'a> {
    protocol: StreamProtocol,
    timeout: Duration,
    config: IterationConfig,
    gate: &'a FakeCommitGate,
    cancel: CancelToken,
}

impl<'a> Setup<'a> {
    fn new(protocol: StreamProtocol, timeout: Duration, gate: &'a FakeCommitGate) -> Self {
        Self {
            protocol,
            timeout,
            config: IterationConfig::from_config(&RalphConfig::default()),
            gate,
            cancel: CancelToken::new(),
        }
    }

    fn run(&self, dir: &Path, body: &str) -> Run {
        let script = write_script(dir, "agent.sh", body).expect("script");
        let agent = script_agent(&script, self.protocol);
        let settings = LaunchSettings {
            workdir: dir.to_path_buf(),
            timeout: self.timeout,
            grace: Duration::from_millis(500),
            max_turns: 5,
        };
        let log_path = dir.join("iteration.log");
        let mut logger = DualSinkLogger::new(Vec::new(), &log_path).expect("logger");
        let mark = CommitMark {
            taken_at: 0,
            head: None,
        };

        let started = Instant::now();
        let mut controller = IterationController::new(
            &agent,
            self.gate,
            &settings,
            &self.config,
            self.cancel.clone(),
        );
        let result = controller
            .run(1, "read the code", &mark, &mut logger)
            .expect("iteration");
        let elapsed = started.elapsed();
        let state = controller.state();

        let blocks = logger.compact().blocks_rendered();
        let compact = String::from_utf8(logger.finish().expect("finish")).expect("utf8");
        let log = fs::read_to_string(&log_path).expect("read log");
        Run {
            result,
            state,
            compact,
            blocks,
            log,
            elapsed,
        }
    }
}

fn run_script(dir: &Path, body: &str, protocol: StreamProtocol, timeout: Duration) -> Run {
    let gate = FakeCommitGate::new(Vec::new());
    Setup::new(protocol, timeout, &gate).run(dir, body)
}

fn event_lines(log: &str) -> Vec<&str> {
    log.lines().filter(|line| line.starts_with("[+")).collect()
}

#[test]
fn scripted_stream_produces_one_block_and_full_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let body = emit_lines(&[TEXT, TOOL_USE, TOOL_RESULT, SUMMARY]);
    let run = run_script(
        temp.path(),
        &body,
        StreamProtocol::ClaudeStreamJson,
        Duration::from_secs(10),
    );

    assert_eq!(run.result.failure, None);
    assert!(run.result.success);
    assert_eq!(run.state, ControllerState::Succeeded);
    assert_eq!(run.result.invocations.len(), 1);
    assert_eq!(run.result.invocations[0].state, ToolState::Closed);
    assert_eq!(run.result.input_tokens, 120);
    assert_eq!(run.result.output_tokens, 45);
    assert!(!run.result.tokens_estimated);
    assert_eq!(run.result.event_count, 4);

    assert_eq!(run.blocks, 1);
    assert!(run.compact.contains("Reading the entry point."));
    assert_eq!(run.compact.matches("📖 Read: src/lib.rs").count(), 1);

    let events = event_lines(&run.log);
    assert_eq!(events.len(), 4);
    assert!(events[0].contains("#0001] TEXT"));
    assert!(events[1].contains("#0002] TOOL_START Read id=t1"));
    assert!(events[2].contains("#0003] TOOL_RESULT id=t1 status=ok"));
    assert!(events[3].contains("#0004] RUN_SUMMARY"));
    assert!(run.log.contains("=== ITERATION 1 START ==="));
    assert!(run.log.contains("=== ITERATION 1 END ==="));
    assert!(run.log.contains("pub mod core;"));
}

#[test]
fn endless_child_is_stopped_at_the_deadline() {
    let temp = tempfile::tempdir().expect("tempdir");
    let run = run_script(
        temp.path(),
        "echo starting\nwhile :; do sleep 1; done\n",
        StreamProtocol::PlainText,
        Duration::from_secs(2),
    );

    assert_eq!(run.result.failure, Some(FailureKind::TimeoutExceeded));
    assert_eq!(run.state, ControllerState::Failed(FailureKind::TimeoutExceeded));
    // Deadline plus grace, with room for the drain window and CI jitter.
    assert!(run.elapsed < Duration::from_secs(6), "took {:?}", run.elapsed);
    assert!(run.compact.contains("failed: TimeoutExceeded"));
    assert!(run.log.contains("starting"));
}

#[test]
fn exit_mid_tool_orphans_the_invocation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let body = format!("{}exit 0\n", emit_lines(&[TEXT, TOOL_USE]));
    let run = run_script(
        temp.path(),
        &body,
        StreamProtocol::ClaudeStreamJson,
        Duration::from_secs(10),
    );

    assert_eq!(run.result.failure, Some(FailureKind::StreamTruncated));
    assert_eq!(run.result.orphaned_count(), 1);
    assert_eq!(run.result.closed_count(), 0);
    assert_eq!(run.blocks, 1);
    assert!(run.compact.contains("No result (process ended first)"));
    assert!(run.log.contains("1 orphaned"));
}

#[test]
fn plain_text_agent_succeeds_with_estimated_tokens() {
    let temp = tempfile::tempdir().expect("tempdir");
    let run = run_script(
        temp.path(),
        "echo \"iteration $RALPH_ITERATION\"\n",
        StreamProtocol::PlainText,
        Duration::from_secs(10),
    );

    assert_eq!(run.result.failure, None);
    assert!(run.result.tokens_estimated);
    assert!(run.compact.contains("iteration 1"));
    assert!(run.result.output_tail.iter().any(|line| line == "iteration 1"));
}

#[test]
fn prompt_is_recorded_in_the_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let run = run_script(
        temp.path(),
        "echo ok\n",
        StreamProtocol::PlainText,
        Duration::from_secs(10),
    );
    assert!(run.log.contains("prompt (13 chars):\n  | read the code\n"));
}

#[test]
fn landed_commit_stops_the_agent_as_success() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gate = FakeCommitGate::new(vec![true]);
    let mut setup = Setup::new(StreamProtocol::PlainText, Duration::from_secs(30), &gate);
    setup.config.stop_on_commit = true;
    setup.config.commit_poll_interval = Duration::from_millis(200);

    let run = setup.run(temp.path(), "echo committing\nsleep 30\n");

    assert!(run.result.stopped_on_commit);
    assert!(run.result.success);
    assert_eq!(run.result.failure, None);
    assert_eq!(run.state, ControllerState::Succeeded);
    assert!(gate.checks() >= 1);
    assert!(run.elapsed < Duration::from_secs(10), "took {:?}", run.elapsed);
    assert!(run.log.contains("stopped: commit landed"));
}

#[test]
fn compaction_notice_stops_the_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let run = run_script(
        temp.path(),
        "echo 'The conversation has been compacted.'\nsleep 30\n",
        StreamProtocol::PlainText,
        Duration::from_secs(30),
    );

    assert_eq!(run.result.failure, Some(FailureKind::ContextCompacted));
    assert_eq!(run.state, ControllerState::Failed(FailureKind::ContextCompacted));
    assert!(run.elapsed < Duration::from_secs(10), "took {:?}", run.elapsed);
}

#[test]
fn cancel_with_open_tool_yields_interrupted_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gate = FakeCommitGate::new(Vec::new());
    let setup = Setup::new(StreamProtocol::ClaudeStreamJson, Duration::from_secs(30), &gate);
    let trigger = setup.cancel.clone();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(800));
        trigger.cancel();
    });

    let body = format!("{}sleep 30\n", emit_lines(&[TEXT, TOOL_USE]));
    let run = setup.run(temp.path(), &body);
    interrupter.join().expect("interrupter");

    assert_eq!(run.result.failure, Some(FailureKind::Interrupted));
    assert_eq!(run.state, ControllerState::Failed(FailureKind::Interrupted));
    assert_eq!(run.result.invocations.len(), 1);
    assert_eq!(run.result.orphaned_count(), 1);
    assert_eq!(run.blocks, 1);
    assert!(run.log.contains("=== ITERATION 1 END ==="));
    assert!(run.elapsed < Duration::from_secs(10), "took {:?}", run.elapsed);
}
