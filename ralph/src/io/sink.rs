//! Dual-sink rendering of the event stream.
//!
//! The compact sink is the human console view: text passes through and each
//! tool invocation is written as one atomic two-line block once its result
//! arrives. The durable sink is the complete append-only record, written by a
//! dedicated thread so disk latency never stalls event delivery.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::render::{self, RunTotals};
use crate::core::types::{EventKind, Invocation, IterationResult, StreamEvent, ToolInvocation};

/// Wall-clock stamp used in log headers.
pub fn wall_clock() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Console view that defers tool starts until their result arrives.
#[derive(Debug)]
pub struct CompactSink<W: Write> {
    out: W,
    pending: Vec<ToolInvocation>,
    at_line_start: bool,
    blocks_rendered: usize,
}

impl<W: Write> CompactSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            pending: Vec::new(),
            at_line_start: true,
            blocks_rendered: 0,
        }
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    /// Number of tool blocks written so far.
    pub fn blocks_rendered(&self) -> usize {
        self.blocks_rendered
    }

    pub fn on_event(&mut self, event: &StreamEvent) -> Result<()> {
        match &event.kind {
            EventKind::TextDelta { text } => self.write_text(text),
            EventKind::ToolInvocationStart {
                id,
                name,
                input,
                truncated,
            } => {
                self.pending.push(ToolInvocation::open(
                    id,
                    name,
                    input.clone(),
                    *truncated,
                    event.at,
                ));
                Ok(())
            }
            EventKind::ToolInvocationResult {
                id,
                output,
                is_error,
                truncated,
            } => {
                let Some(pos) = self.pending.iter().position(|inv| &inv.id == id) else {
                    return Ok(());
                };
                let mut invocation = self.pending.remove(pos);
                invocation.close(output, *is_error, *truncated, event.at);
                self.write_block(&invocation)
            }
            EventKind::RunSummary(_) | EventKind::UnrecognizedPayload { .. } => Ok(()),
        }
    }

    /// Render every still-pending invocation as an orphan block.
    pub fn flush_orphans(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for mut invocation in pending {
            invocation.orphan();
            self.write_block(&invocation)?;
        }
        Ok(())
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.ensure_line_start()?;
        self.out
            .write_all(line.as_bytes())
            .context("write compact line")?;
        self.at_line_start = line.ends_with('\n');
        self.out.flush().context("flush compact output")
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.out
            .write_all(text.as_bytes())
            .context("write compact text")?;
        self.at_line_start = text.ends_with('\n');
        self.out.flush().context("flush compact output")
    }

    fn write_block(&mut self, invocation: &ToolInvocation) -> Result<()> {
        self.ensure_line_start()?;
        let block = render::compact_block(invocation);
        self.out
            .write_all(block.as_bytes())
            .context("write compact block")?;
        self.out.flush().context("flush compact output")?;
        self.blocks_rendered += 1;
        Ok(())
    }

    fn ensure_line_start(&mut self) -> Result<()> {
        if !self.at_line_start {
            self.out.write_all(b"\n").context("write compact newline")?;
            self.at_line_start = true;
        }
        Ok(())
    }
}

enum DurableMessage {
    Write(String),
    Flush(SyncSender<()>),
}

/// Append-only log file fed through an unbounded ordered channel.
#[derive(Debug)]
pub struct DurableSink {
    path: PathBuf,
    tx: Option<Sender<DurableMessage>>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl DurableSink {
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;

        let (tx, rx) = mpsc::channel::<DurableMessage>();
        let writer = thread::spawn(move || write_loop(file, rx));
        debug!("durable log opened");
        Ok(Self {
            path: path.to_path_buf(),
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `text` for writing. Never blocks on disk.
    pub fn write(&self, text: String) {
        if let Some(tx) = &self.tx
            && tx.send(DurableMessage::Write(text)).is_err()
        {
            warn!("durable log writer has stopped, dropping entry");
        }
    }

    /// Block until everything queued so far is on disk.
    pub fn flush(&self) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("durable log already closed"))?;
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        tx.send(DurableMessage::Flush(ack_tx))
            .map_err(|_| anyhow!("durable log writer has stopped"))?;
        ack_rx
            .recv()
            .map_err(|_| anyhow!("durable log writer stopped before flushing"))
    }

    /// Close the channel and wait for the writer to drain.
    pub fn finish(mut self) -> Result<()> {
        self.tx.take();
        match self.writer.take() {
            Some(handle) => match handle.join() {
                Ok(result) => {
                    result.with_context(|| format!("write log file {}", self.path.display()))
                }
                Err(_) => Err(anyhow!("durable log writer panicked")),
            },
            None => Ok(()),
        }
    }
}

fn write_loop(file: File, rx: mpsc::Receiver<DurableMessage>) -> Result<()> {
    let mut writer = BufWriter::new(file);
    let mut first_error = None;
    for message in rx {
        match message {
            DurableMessage::Write(text) => {
                if first_error.is_none()
                    && let Err(err) = writer.write_all(text.as_bytes())
                {
                    warn!(err = %err, "durable log write failed");
                    first_error = Some(err);
                }
            }
            DurableMessage::Flush(ack) => {
                if first_error.is_none()
                    && let Err(err) = writer.flush()
                {
                    warn!(err = %err, "durable log flush failed");
                    first_error = Some(err);
                }
                let _ = ack.send(());
            }
        }
    }
    match first_error {
        Some(err) => Err(err).context("durable log write"),
        None => writer.flush().context("flush durable log"),
    }
}

/// Routes every event to both the compact view and the durable log.
#[derive(Debug)]
pub struct DualSinkLogger<W: Write = Stdout> {
    compact: CompactSink<W>,
    durable: DurableSink,
    /// Prompt of the previous iteration, for the prompt diff.
    last_prompt: Option<String>,
}

impl DualSinkLogger<Stdout> {
    pub fn to_stdout(durable_path: &Path) -> Result<Self> {
        Self::new(std::io::stdout(), durable_path)
    }
}

impl<W: Write> DualSinkLogger<W> {
    pub fn new(compact_out: W, durable_path: &Path) -> Result<Self> {
        Ok(Self {
            compact: CompactSink::new(compact_out),
            durable: DurableSink::open(durable_path)?,
            last_prompt: None,
        })
    }

    pub fn compact(&self) -> &CompactSink<W> {
        &self.compact
    }

    pub fn durable_path(&self) -> &Path {
        self.durable.path()
    }

    /// Write one event to both sinks, in delivery order.
    pub fn observe(&mut self, event: &StreamEvent) {
        self.durable.write(render::durable_event(event));
        if let Err(err) = self.compact.on_event(event) {
            warn!(err = %err, seq = event.seq, "compact sink write failed");
        }
    }

    pub fn begin_run(&mut self, workdir: &Path, settings: &[(String, String)]) {
        self.durable.write(render::run_header(
            &wall_clock(),
            &workdir.display().to_string(),
            settings,
        ));
    }

    pub fn begin_iteration(
        &mut self,
        iteration: u32,
        max_iterations: u32,
        invocation: &Invocation,
        prompt: &str,
    ) {
        let env: Vec<(String, String)> = invocation
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut settings = vec![
            ("workdir".to_string(), invocation.workdir.display().to_string()),
            (
                "timeout".to_string(),
                format!("{}s", invocation.timeout.as_secs()),
            ),
            (
                "grace".to_string(),
                format!("{}ms", invocation.grace.as_millis()),
            ),
        ];
        if let Some(turns) = invocation.max_turns {
            settings.push(("max turns".to_string(), turns.to_string()));
        }
        self.durable.write(render::iteration_header(
            iteration,
            &wall_clock(),
            &invocation.display_command(200),
            &env,
            &settings,
            &render::prompt_block(iteration, prompt, self.last_prompt.as_deref()),
        ));
        self.last_prompt = Some(prompt.to_string());
        let banner = format!(
            "\n{}\n🔄 Iteration {iteration}/{max_iterations}\n",
            render::LIGHT_RULE
        );
        if let Err(err) = self.compact.write_line(&banner) {
            warn!(err = %err, "compact sink write failed");
        }
    }

    /// Close out an iteration: orphan blocks, outcome line, footer, flush.
    pub fn end_iteration(&mut self, result: &IterationResult) -> Result<()> {
        if let Err(err) = self
            .compact
            .flush_orphans()
            .and_then(|()| self.compact.write_line(&render::compact_outcome(result)))
        {
            warn!(err = %err, "compact sink write failed");
        }
        self.durable.write(render::iteration_footer(result));
        self.durable.flush()
    }

    /// Write the run summary block. Called on every loop exit path.
    pub fn end_run(&mut self, totals: &RunTotals) -> Result<()> {
        self.durable.write(render::run_summary(totals, &wall_clock()));
        let line = format!(
            "\n🏁 {} after {} iteration(s), {} commit(s)\n📄 Full log: {}\n",
            totals.stop_reason,
            totals.iterations,
            totals.commits,
            self.durable.path().display()
        );
        if let Err(err) = self.compact.write_line(&line) {
            warn!(err = %err, "compact sink write failed");
        }
        self.durable.flush()
    }

    pub fn note(&mut self, text: &str) {
        self.durable.write(format!("NOTE {text}\n"));
        if let Err(err) = self.compact.write_line(&format!("ℹ {text}\n")) {
            warn!(err = %err, "compact sink write failed");
        }
    }

    /// Drain the durable writer and hand back the compact writer.
    pub fn finish(self) -> Result<W> {
        self.durable.finish()?;
        Ok(self.compact.out)
    }
}
