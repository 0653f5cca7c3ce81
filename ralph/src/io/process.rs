//! Supervision of one agent child process.
//!
//! The child runs in its own process group with stdout/stderr piped. Two
//! reader threads forward raw chunks into a single bounded channel, and a
//! watchdog thread owns the child to enforce the deadline and honour stop
//! requests (SIGTERM to the group, then SIGKILL after the grace window).

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::budget::wait_slice;
use crate::core::types::{Invocation, OutputChunk, OutputStream, duration_ms};

/// Capacity of the chunk channel shared by both reader threads.
pub const CHANNEL_CAPACITY: usize = 1024;
const READ_CHUNK_BYTES: usize = 8192;
const WATCH_POLL: Duration = Duration::from_millis(100);

/// The child could not be started. Fatal to the loop.
#[derive(Debug, Error)]
#[error("failed to launch `{program}`: {source}")]
pub struct LaunchError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Shared external stop request (Ctrl-C, embedding caller).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the supervisor stopped a child that had not exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Compaction,
    CommitLanded,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Cancelled => "cancelled",
            StopReason::Compaction => "compaction",
            StopReason::CommitLanded => "commit-landed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Stopped(StopReason),
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` when the child died from a signal.
    pub code: Option<i32>,
    pub termination: Termination,
    pub elapsed: Duration,
}

/// Handle on the watchdog that owns the child.
#[derive(Debug)]
pub struct WaitHandle {
    pid: u32,
    stop: Arc<OnceLock<StopReason>>,
    watchdog: JoinHandle<Result<ExitOutcome>>,
}

impl WaitHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Ask the watchdog to stop the child. The first reason wins.
    pub fn request_stop(&self, reason: StopReason) {
        if self.stop.set(reason).is_ok() {
            debug!(pid = self.pid, reason = reason.as_str(), "stop requested");
        }
    }

    /// True once the child has been reaped.
    pub fn is_finished(&self) -> bool {
        self.watchdog.is_finished()
    }

    /// Join the watchdog and return how the child ended.
    ///
    /// When supervision itself failed the group is killed before the error
    /// is returned, so no agent process outlives the handle.
    pub fn wait(self) -> Result<ExitOutcome> {
        let outcome = match self.watchdog.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!("watchdog thread panicked")),
        };
        if outcome.is_err() {
            kill_group(self.pid);
        }
        outcome
    }
}

/// Launch `invocation` and start streaming its output.
///
/// Chunks arrive in read order per stream, stamped with the time since
/// spawn. The channel closes once both pipes reach EOF.
#[instrument(
    skip_all,
    fields(program = %invocation.program, timeout_secs = invocation.timeout.as_secs())
)]
pub fn spawn(
    invocation: &Invocation,
    cancel: CancelToken,
) -> Result<(Receiver<OutputChunk>, WaitHandle), LaunchError> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.workdir)
        .envs(&invocation.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if invocation.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let started = Instant::now();
    let deadline = started
        .checked_add(invocation.timeout)
        .ok_or_else(|| LaunchError {
            program: invocation.program.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("timeout of {}s is out of range", invocation.timeout.as_secs()),
            ),
        })?;

    debug!("spawning child process");
    let mut child = cmd.spawn().map_err(|source| {
        error!(err = %source, "failed to spawn agent");
        LaunchError {
            program: invocation.program.clone(),
            source,
        }
    })?;
    let pid = child.id();

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(LaunchError {
                program: invocation.program.clone(),
                source: std::io::Error::other("child pipes were not captured"),
            });
        }
    };

    if let (Some(payload), Some(mut stdin)) = (invocation.stdin.clone(), child.stdin.take()) {
        // Written off-thread so a child that never reads stdin cannot block us.
        thread::spawn(move || {
            if let Err(err) = stdin.write_all(payload.as_bytes()) {
                debug!(err = %err, "child closed stdin early");
            }
        });
    }

    let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
    spawn_reader(stdout, OutputStream::Stdout, started, tx.clone());
    spawn_reader(stderr, OutputStream::Stderr, started, tx);

    let stop = Arc::new(OnceLock::new());
    let watch_stop = Arc::clone(&stop);
    let grace = invocation.grace;
    let watchdog =
        thread::spawn(move || watch(child, deadline, grace, &cancel, &watch_stop, started));

    debug!(pid, "child started");
    Ok((rx, WaitHandle {
        pid,
        stop,
        watchdog,
    }))
}

/// Captured output of a short helper command.
#[derive(Debug)]
pub struct BoundedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Run a short helper command with a deadline, capturing at most
/// `output_limit_bytes` of each stream.
///
/// Both pipes are drained concurrently so a chatty child cannot block on a
/// full pipe. On timeout the child is killed and `timed_out` is set.
#[instrument(skip_all, fields(timeout_ms = duration_ms(timeout)))]
pub fn run_bounded(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<BoundedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn command")?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = duration_ms(timeout), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(BoundedOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("read command output"),
        };
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(kept)
}

fn join_output(handle: JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    stream: OutputStream,
    started: Instant,
    tx: SyncSender<OutputChunk>,
) {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(stream = stream.as_str(), err = %err, "read from child failed");
                    break;
                }
            };
            let chunk = OutputChunk {
                stream,
                bytes: buf[..n].to_vec(),
                at: started.elapsed(),
            };
            if tx.send(chunk).is_err() {
                break;
            }
        }
    });
}

fn watch(
    mut child: Child,
    deadline: Instant,
    grace: Duration,
    cancel: &CancelToken,
    stop: &OnceLock<StopReason>,
    started: Instant,
) -> Result<ExitOutcome> {
    let pid = child.id();
    loop {
        let Some(slice) = wait_slice(deadline, WATCH_POLL) else {
            warn!(pid, "deadline reached, terminating child");
            let status = terminate(&mut child, grace)?;
            return Ok(finish(pid, status, Termination::TimedOut, started));
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for child")? {
            return Ok(finish(pid, status, Termination::Exited, started));
        }
        if cancel.is_cancelled() {
            let _ = stop.set(StopReason::Cancelled);
        }
        if let Some(reason) = stop.get().copied() {
            debug!(pid, reason = reason.as_str(), "terminating child");
            let status = terminate(&mut child, grace)?;
            return Ok(finish(pid, status, Termination::Stopped(reason), started));
        }
    }
}

fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    request_termination(child);
    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait for child after SIGTERM")?
    {
        return Ok(status);
    }
    warn!(
        pid = child.id(),
        grace_ms = duration_ms(grace),
        "child ignored SIGTERM, killing"
    );
    force_kill(child);
    child.wait().context("wait for child after SIGKILL")
}

fn finish(pid: u32, status: ExitStatus, termination: Termination, started: Instant) -> ExitOutcome {
    // Grandchildren left in the group would keep the pipes open.
    kill_group(pid);
    let elapsed = started.elapsed();
    debug!(
        pid,
        exit_code = ?status.code(),
        ?termination,
        elapsed_ms = duration_ms(elapsed),
        "child finished"
    );
    ExitOutcome {
        code: status.code(),
        termination,
        elapsed,
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid, ?signal, err = %err, "failed to signal process group"),
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    signal_group(child.id(), nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    signal_group(child.id(), nix::sys::signal::Signal::SIGKILL);
    let _ = child.kill();
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}
