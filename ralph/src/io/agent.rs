//! Agent abstraction for building child invocations.
//!
//! The [`Agent`] trait decouples the iteration controller from the actual
//! agent CLI. Each implementation only describes *how* to launch its binary
//! and how its stdout is encoded; supervision lives in `io::process`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::types::{Invocation, StreamProtocol};
use crate::io::config::{AgentConfig, AgentKind};

/// Per-run launch parameters shared by every iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Wall-clock budget for one invocation.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Turn budget for agents that accept one.
    pub max_turns: u32,
}

/// Abstraction over agent CLIs.
pub trait Agent {
    /// Short name for headers and tracing.
    fn name(&self) -> &str;

    /// How the agent encodes its standard output.
    fn protocol(&self) -> StreamProtocol;

    /// Describe the child launch for one iteration.
    fn invocation(&self, prompt: &str, iteration: u32, settings: &LaunchSettings) -> Invocation;
}

/// `claude --print` in `stream-json` mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeAgent {
    pub model: String,
    pub system_prompt: Option<String>,
}

impl Agent for ClaudeAgent {
    fn name(&self) -> &str {
        "claude"
    }

    fn protocol(&self) -> StreamProtocol {
        StreamProtocol::ClaudeStreamJson
    }

    fn invocation(&self, prompt: &str, _iteration: u32, settings: &LaunchSettings) -> Invocation {
        let mut args: Vec<String> = [
            "--print",
            "--dangerously-skip-permissions",
            "--verbose",
            "--output-format",
            "stream-json",
            "--max-turns",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(settings.max_turns.to_string());
        args.push("--model".to_string());
        args.push(self.model.clone());
        if let Some(system_prompt) = self
            .system_prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            args.push("--system-prompt".to_string());
            args.push(system_prompt.to_string());
        }
        args.push("-p".to_string());
        args.push(prompt.to_string());

        let mut env = BTreeMap::new();
        env.insert("CLAUDE_CODE_YOLO".to_string(), "1".to_string());

        Invocation {
            program: "claude".to_string(),
            args,
            workdir: settings.workdir.clone(),
            env,
            stdin: None,
            timeout: settings.timeout,
            grace: settings.grace,
            max_turns: Some(settings.max_turns),
        }
    }
}

/// `codex exec` with full sandbox access; plain-text output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodexAgent;

impl Agent for CodexAgent {
    fn name(&self) -> &str {
        "codex"
    }

    fn protocol(&self) -> StreamProtocol {
        StreamProtocol::PlainText
    }

    fn invocation(&self, prompt: &str, _iteration: u32, settings: &LaunchSettings) -> Invocation {
        Invocation {
            program: "codex".to_string(),
            args: vec![
                "exec".to_string(),
                "-s".to_string(),
                "danger-full-access".to_string(),
                prompt.to_string(),
            ],
            workdir: settings.workdir.clone(),
            env: BTreeMap::new(),
            stdin: None,
            timeout: settings.timeout,
            grace: settings.grace,
            max_turns: None,
        }
    }
}

/// Arbitrary program; the prompt is written to its stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAgent {
    pub program: String,
    pub args: Vec<String>,
    pub protocol: StreamProtocol,
}

impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.program
    }

    fn protocol(&self) -> StreamProtocol {
        self.protocol
    }

    fn invocation(&self, prompt: &str, iteration: u32, settings: &LaunchSettings) -> Invocation {
        let mut env = BTreeMap::new();
        env.insert("RALPH_ITERATION".to_string(), iteration.to_string());
        env.insert("RALPH_MAX_TURNS".to_string(), settings.max_turns.to_string());
        Invocation {
            program: self.program.clone(),
            args: self.args.clone(),
            workdir: settings.workdir.clone(),
            env,
            stdin: Some(prompt.to_string()),
            timeout: settings.timeout,
            grace: settings.grace,
            max_turns: Some(settings.max_turns),
        }
    }
}

/// Build the configured agent.
pub fn agent_from_config(cfg: &AgentConfig) -> Result<Box<dyn Agent>> {
    match cfg.kind {
        AgentKind::Claude => Ok(Box::new(ClaudeAgent {
            model: cfg.model.clone(),
            system_prompt: cfg.system_prompt.clone(),
        })),
        AgentKind::Codex => Ok(Box::new(CodexAgent)),
        AgentKind::Command => {
            let (program, args) = cfg
                .command
                .split_first()
                .ok_or_else(|| anyhow!("agent.command is empty"))?;
            Ok(Box::new(CommandAgent {
                program: program.clone(),
                args: args.to_vec(),
                protocol: cfg.protocol,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LaunchSettings {
        LaunchSettings {
            workdir: PathBuf::from("/work"),
            timeout: Duration::from_secs(600),
            grace: Duration::from_secs(5),
            max_turns: 50,
        }
    }

    #[test]
    fn claude_invocation_uses_stream_json() {
        let agent = ClaudeAgent {
            model: "opus".to_string(),
            system_prompt: Some("be brief".to_string()),
        };
        let inv = agent.invocation("do it", 1, &settings());
        assert_eq!(inv.program, "claude");
        assert_eq!(
            inv.args,
            vec![
                "--print",
                "--dangerously-skip-permissions",
                "--verbose",
                "--output-format",
                "stream-json",
                "--max-turns",
                "50",
                "--model",
                "opus",
                "--system-prompt",
                "be brief",
                "-p",
                "do it",
            ]
        );
        assert_eq!(inv.env.get("CLAUDE_CODE_YOLO").map(String::as_str), Some("1"));
        assert_eq!(inv.stdin, None);
        assert_eq!(agent.protocol(), StreamProtocol::ClaudeStreamJson);
    }

    #[test]
    fn codex_invocation_passes_prompt_as_argument() {
        let inv = CodexAgent.invocation("fix tests", 2, &settings());
        assert_eq!(inv.args, vec!["exec", "-s", "danger-full-access", "fix tests"]);
        assert_eq!(inv.max_turns, None);
    }

    #[test]
    fn command_agent_reads_prompt_from_stdin() {
        let cfg = AgentConfig {
            kind: AgentKind::Command,
            command: vec!["./agent.sh".to_string(), "--fast".to_string()],
            ..AgentConfig::default()
        };
        let agent = agent_from_config(&cfg).expect("agent");
        let inv = agent.invocation("prompt text", 4, &settings());
        assert_eq!(inv.program, "./agent.sh");
        assert_eq!(inv.args, vec!["--fast"]);
        assert_eq!(inv.stdin.as_deref(), Some("prompt text"));
        assert_eq!(inv.env.get("RALPH_ITERATION").map(String::as_str), Some("4"));
        assert_eq!(agent.protocol(), StreamProtocol::PlainText);
    }
}
