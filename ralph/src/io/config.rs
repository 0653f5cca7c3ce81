//! Ralph configuration stored in `.ralph.toml` at the workspace root.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::StreamProtocol;

/// Default config file name, relative to the working directory.
pub const CONFIG_FILE: &str = ".ralph.toml";

/// Default completion marker the agent prints when the goal is done.
pub const DEFAULT_COMPLETION_MARKER: &str = "RALPH_LOOP_COMPLETE";

/// Upper bound for `iteration_timeout_secs` (one week).
pub const MAX_ITERATION_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Loop configuration (TOML).
///
/// Missing fields fall back to defaults; CLI flags override file values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RalphConfig {
    pub max_iterations: u32,

    /// Turn budget passed to agents that support one.
    pub max_turns: u32,

    /// Wall-clock budget for one agent invocation, in seconds.
    pub iteration_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL when stopping the agent.
    pub grace_period_ms: u64,

    /// Identical failures in a row before the loop gives up.
    pub max_consecutive_failures: u32,

    pub completion_marker: String,

    /// Stop the agent early when it announces conversation compaction.
    pub detect_compaction: bool,

    /// Stop the agent as soon as it lands a commit.
    pub stop_on_commit: bool,

    pub commit_poll_interval_secs: u64,

    /// Pause for confirmation between iterations.
    pub human_in_the_loop: bool,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub kind: AgentKind,

    /// Model name for the Claude CLI.
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Program and arguments for `kind = "command"`. The prompt goes to stdin.
    pub command: Vec<String>,

    /// Output encoding of the custom command.
    pub protocol: StreamProtocol,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: AgentKind::Claude,
            model: "opus".to_string(),
            system_prompt: None,
            command: Vec::new(),
            protocol: StreamProtocol::PlainText,
        }
    }
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_turns: 50,
            iteration_timeout_secs: 600,
            grace_period_ms: 5_000,
            max_consecutive_failures: 3,
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            detect_compaction: true,
            stop_on_commit: false,
            commit_poll_interval_secs: 10,
            human_in_the_loop: false,
            agent: AgentConfig::default(),
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_turns == 0 {
            return Err(anyhow!("max_turns must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.iteration_timeout_secs > MAX_ITERATION_TIMEOUT_SECS {
            return Err(anyhow!(
                "iteration_timeout_secs must be <= {MAX_ITERATION_TIMEOUT_SECS}"
            ));
        }
        if self.completion_marker.trim().is_empty() {
            return Err(anyhow!("completion_marker must not be empty"));
        }
        if self.stop_on_commit && self.commit_poll_interval_secs == 0 {
            return Err(anyhow!(
                "commit_poll_interval_secs must be > 0 when stop_on_commit is set"
            ));
        }
        if self.agent.kind == AgentKind::Command
            && self
                .agent
                .command
                .first()
                .is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!(
                "agent.command must be a non-empty array when agent.kind = \"command\""
            ));
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn commit_poll_interval(&self) -> Duration {
        Duration::from_secs(self.commit_poll_interval_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
