//! Test-only helpers: scripted agents, temporary repositories and fakes.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{FailureKind, Invocation, IterationResult, StreamProtocol};
use crate::io::agent::CommandAgent;
use crate::io::checkpoint::{Checkpoint, CheckpointDecision};
use crate::io::git::{CommitGate, CommitMark};

/// Git repository in a temporary directory with a local identity.
#[derive(Debug)]
pub struct TestRepo {
    dir: TempDir,
    commits: Cell<u32>,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self {
            dir,
            commits: Cell::new(0),
        };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "ralph@example.com"])?;
        repo.git(&["config", "user.name", "Ralph Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file and commit it with `message`.
    pub fn commit(&self, message: &str) -> Result<()> {
        let n = self.commits.get() + 1;
        self.commits.set(n);
        let file = self.path().join(format!("change-{n}.txt"));
        fs::write(&file, message).with_context(|| format!("write {}", file.display()))?;
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Write an executable `sh` script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}"))
        .with_context(|| format!("write script {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(path)
}

/// Script body that prints `lines` verbatim, one per line.
pub fn emit_lines(lines: &[&str]) -> String {
    let mut body = String::from("cat <<'RALPH_EOF'\n");
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }
    body.push_str("RALPH_EOF\n");
    body
}

/// Agent that runs the script at `path`.
pub fn script_agent(path: &Path, protocol: StreamProtocol) -> CommandAgent {
    CommandAgent {
        program: path.display().to_string(),
        args: Vec::new(),
        protocol,
    }
}

/// `sh -c script` with a short grace window.
pub fn shell_invocation(workdir: &Path, script: &str, timeout: Duration) -> Invocation {
    Invocation {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        workdir: workdir.to_path_buf(),
        env: BTreeMap::new(),
        stdin: None,
        timeout,
        grace: Duration::from_secs(1),
        max_turns: None,
    }
}

/// Minimal iteration result with no tool activity.
pub fn sample_result(iteration: u32, failure: Option<FailureKind>) -> IterationResult {
    IterationResult {
        iteration,
        success: failure.is_none(),
        failure,
        duration_ms: 1_000,
        input_tokens: 10,
        output_tokens: 20,
        tokens_estimated: true,
        invocations: Vec::new(),
        exit_code: Some(if failure.is_some() { 1 } else { 0 }),
        summary: None,
        completion_marker_seen: false,
        stopped_on_commit: false,
        parse_anomalies: 0,
        event_count: 0,
        output_tail: vec!["last line".to_string()],
    }
}

/// Commit gate answering `has_new_commit` from a script (then `false`).
#[derive(Debug, Default)]
pub struct FakeCommitGate {
    answers: RefCell<VecDeque<bool>>,
    checks: Cell<usize>,
}

impl FakeCommitGate {
    pub fn new(answers: Vec<bool>) -> Self {
        Self {
            answers: RefCell::new(answers.into()),
            checks: Cell::new(0),
        }
    }

    /// Number of `has_new_commit` calls so far.
    pub fn checks(&self) -> usize {
        self.checks.get()
    }
}

impl CommitGate for FakeCommitGate {
    fn mark(&self) -> Result<CommitMark> {
        Ok(CommitMark {
            taken_at: 0,
            head: None,
        })
    }

    fn has_new_commit(&self, _mark: &CommitMark) -> Result<bool> {
        self.checks.set(self.checks.get() + 1);
        Ok(self.answers.borrow_mut().pop_front().unwrap_or(false))
    }
}

/// Checkpoint replaying scripted decisions (then `Continue`).
#[derive(Debug, Default)]
pub struct ScriptedCheckpoint {
    decisions: VecDeque<CheckpointDecision>,
    pauses: usize,
}

impl ScriptedCheckpoint {
    pub fn new(decisions: Vec<CheckpointDecision>) -> Self {
        Self {
            decisions: decisions.into(),
            pauses: 0,
        }
    }

    pub fn pauses(&self) -> usize {
        self.pauses
    }
}

impl Checkpoint for ScriptedCheckpoint {
    fn pause(&mut self, _completed: &IterationResult) -> Result<CheckpointDecision> {
        self.pauses += 1;
        Ok(self
            .decisions
            .pop_front()
            .unwrap_or(CheckpointDecision::Continue))
    }
}
