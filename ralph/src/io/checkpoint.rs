//! Human checkpoint between iterations.
//!
//! The pause is an explicit blocking state: it waits for a line of input but
//! keeps polling the shared [`CancelToken`] so Ctrl-C still ends the run.

use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::IterationResult;
use crate::io::git::Git;
use crate::io::process::CancelToken;

const INPUT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDecision {
    Continue,
    Stop,
    Interrupted,
}

/// Decides whether the loop proceeds after an iteration.
pub trait Checkpoint {
    fn pause(&mut self, completed: &IterationResult) -> Result<CheckpointDecision>;
}

/// No human in the loop: always continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoContinue;

impl Checkpoint for AutoContinue {
    fn pause(&mut self, _completed: &IterationResult) -> Result<CheckpointDecision> {
        Ok(CheckpointDecision::Continue)
    }
}

/// Interactive checkpoint reading commands line by line.
///
/// `c` continues, `s` stops, `g` shows `git status`, `l` shows recent commits.
#[derive(Debug)]
pub struct ConsoleCheckpoint<W: Write> {
    git: Git,
    cancel: CancelToken,
    lines: Receiver<String>,
    out: W,
}

impl ConsoleCheckpoint<std::io::Stdout> {
    pub fn stdin(git: Git, cancel: CancelToken) -> Self {
        Self::new(
            std::io::BufReader::new(std::io::stdin()),
            std::io::stdout(),
            git,
            cancel,
        )
    }
}

impl<W: Write> ConsoleCheckpoint<W> {
    pub fn new<R: BufRead + Send + 'static>(
        input: R,
        out: W,
        git: Git,
        cancel: CancelToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in input.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(err = %err, "checkpoint input closed");
                        break;
                    }
                }
            }
        });
        Self {
            git,
            cancel,
            lines: rx,
            out,
        }
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    fn say(&mut self, text: &str) -> Result<()> {
        self.out
            .write_all(text.as_bytes())
            .context("write checkpoint output")?;
        self.out.flush().context("flush checkpoint output")
    }

    fn show_git(&mut self, label: &str, output: Result<String>) -> Result<()> {
        match output {
            Ok(text) if text.trim().is_empty() => self.say(&format!("{label}: (empty)\n")),
            Ok(text) => self.say(&format!("{label}:\n{text}")),
            Err(err) => {
                warn!(err = %err, "checkpoint git query failed");
                self.say(&format!("{label} unavailable: {err}\n"))
            }
        }
    }
}

impl<W: Write> Checkpoint for ConsoleCheckpoint<W> {
    fn pause(&mut self, completed: &IterationResult) -> Result<CheckpointDecision> {
        self.say(&format!(
            "\n⏸  Iteration {} finished ({}). [c]ontinue, [s]top, [g]it status, [l]og: ",
            completed.iteration,
            completed.outcome_label()
        ))?;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(CheckpointDecision::Interrupted);
            }
            let line = match self.lines.recv_timeout(INPUT_POLL) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("checkpoint input closed, stopping");
                    return Ok(CheckpointDecision::Stop);
                }
            };
            match line.trim().to_lowercase().as_str() {
                "c" | "continue" => return Ok(CheckpointDecision::Continue),
                "s" | "stop" | "q" => return Ok(CheckpointDecision::Stop),
                "g" => {
                    let status = self.git.status_short();
                    self.show_git("git status", status)?;
                }
                "l" => {
                    let log = self.git.recent_log();
                    self.show_git("recent commits", log)?;
                }
                _ => self.say("Enter c, s, g or l: ")?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::test_support::sample_result;

    fn checkpoint(input: &str, cancel: CancelToken) -> ConsoleCheckpoint<Vec<u8>> {
        let temp = std::env::temp_dir();
        ConsoleCheckpoint::new(
            Cursor::new(input.as_bytes().to_vec()),
            Vec::new(),
            Git::new(temp),
            cancel,
        )
    }

    #[test]
    fn continue_after_unknown_input() {
        let mut cp = checkpoint("x\nc\n", CancelToken::new());
        let decision = cp.pause(&sample_result(1, None)).expect("pause");
        assert_eq!(decision, CheckpointDecision::Continue);
        let out = String::from_utf8_lossy(cp.writer()).to_string();
        assert!(out.contains("Iteration 1 finished (success)"));
        assert!(out.contains("Enter c, s, g or l"));
    }

    #[test]
    fn stop_command_stops() {
        let mut cp = checkpoint("S\n", CancelToken::new());
        assert_eq!(
            cp.pause(&sample_result(2, None)).expect("pause"),
            CheckpointDecision::Stop
        );
    }

    #[test]
    fn closed_input_stops() {
        let mut cp = checkpoint("", CancelToken::new());
        assert_eq!(
            cp.pause(&sample_result(1, None)).expect("pause"),
            CheckpointDecision::Stop
        );
    }

    #[test]
    fn cancellation_interrupts_the_pause() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut cp = checkpoint("c\n", cancel);
        assert_eq!(
            cp.pause(&sample_result(1, None)).expect("pause"),
            CheckpointDecision::Interrupted
        );
    }

    #[cfg(unix)]
    #[test]
    fn git_commands_print_repository_state() {
        let repo = crate::test_support::TestRepo::new().expect("repo");
        repo.commit("first change").expect("commit");
        let mut cp = ConsoleCheckpoint::new(
            Cursor::new(b"l\ng\nc\n".to_vec()),
            Vec::new(),
            Git::new(repo.path()),
            CancelToken::new(),
        );
        cp.pause(&sample_result(1, None)).expect("pause");
        let out = String::from_utf8_lossy(cp.writer()).to_string();
        assert!(out.contains("first change"));
        assert!(out.contains("git status: (empty)"));
    }
}
