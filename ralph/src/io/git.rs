//! Git adapter for the commit gate.
//!
//! Ralph never writes to the repository. It only reads HEAD and commit
//! times to decide whether the agent committed during an iteration.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io::process::{BoundedOutput, run_bounded};

/// Deadline for one git query.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(10);
const GIT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Snapshot of the repository taken before an iteration starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMark {
    /// Unix seconds when the mark was taken.
    pub taken_at: i64,
    /// HEAD at mark time; `None` in a repository without commits.
    pub head: Option<String>,
}

/// The commit gate could not query version control.
#[derive(Debug, Error)]
#[error("commit gate unavailable: {0}")]
pub struct CommitGateUnavailable(pub String);

/// Detects whether new commits landed since a mark.
pub trait CommitGate {
    fn mark(&self) -> Result<CommitMark>;
    fn has_new_commit(&self, mark: &CommitMark) -> Result<bool>;
}

/// Wrapper for executing read-only git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the workdir is inside a git repository.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Full HEAD sha, or `None` when the repository has no commits yet.
    #[instrument(skip_all)]
    pub fn head(&self) -> Result<Option<String>> {
        if !self.is_repo() {
            return Err(CommitGateUnavailable(format!(
                "{} is not a git repository",
                self.workdir.display()
            ))
            .into());
        }
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            debug!("repository has no commits");
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok((!sha.is_empty()).then_some(sha))
    }

    /// Committer time of HEAD in unix seconds.
    pub fn head_commit_time(&self) -> Result<i64> {
        let out = self.run_capture(&["log", "-1", "--format=%H %ct", "HEAD"])?;
        parse_commit_time(&out)
    }

    /// `git status --short`, for the human checkpoint.
    pub fn status_short(&self) -> Result<String> {
        self.run_capture(&["status", "--short"])
    }

    /// Last five commits, one per line.
    pub fn recent_log(&self) -> Result<String> {
        self.run_capture(&["log", "--oneline", "-5"])
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<BoundedOutput> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<BoundedOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        self.execute(cmd, &format!("git {}", args.join(" ")))
    }

    fn execute(&self, cmd: Command, label: &str) -> Result<BoundedOutput> {
        let output = run_bounded(cmd, self.timeout, GIT_OUTPUT_LIMIT)
            .with_context(|| format!("run {label}"))?;
        if output.timed_out {
            return Err(CommitGateUnavailable(format!(
                "{label} did not finish within {}ms",
                self.timeout.as_millis()
            ))
            .into());
        }
        Ok(output)
    }
}

impl CommitGate for Git {
    #[instrument(skip_all)]
    fn mark(&self) -> Result<CommitMark> {
        let head = self.head()?;
        let mark = CommitMark {
            taken_at: chrono::Utc::now().timestamp(),
            head,
        };
        debug!(head = ?mark.head, taken_at = mark.taken_at, "commit mark taken");
        Ok(mark)
    }

    #[instrument(skip_all)]
    fn has_new_commit(&self, mark: &CommitMark) -> Result<bool> {
        let Some(head) = self.head()? else {
            return Ok(false);
        };
        if mark.head.as_deref() == Some(head.as_str()) {
            return Ok(false);
        }
        let committed_at = self.head_commit_time()?;
        if committed_at < mark.taken_at {
            // HEAD moved to an older commit (checkout or reset), not new work.
            warn!(head = %head, committed_at, "HEAD changed to a commit older than the mark");
            return Ok(false);
        }
        debug!(head = %head, "new commit detected");
        Ok(true)
    }
}

fn parse_commit_time(line: &str) -> Result<i64> {
    let field = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("unexpected git log output: '{}'", line.trim()))?;
    field
        .parse::<i64>()
        .with_context(|| format!("parse commit time '{field}'"))
}
