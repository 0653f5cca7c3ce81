//! Commit-gated agent loop supervisor.
//!
//! `ralph run` invokes an agent CLI repeatedly until it reports completion
//! with a commit behind it, the iteration budget runs out, or a human stops
//! it. `ralph init` writes a default `.ralph.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use ralph::exit_codes;
use ralph::io::agent::agent_from_config;
use ralph::io::checkpoint::{AutoContinue, ConsoleCheckpoint};
use ralph::io::config::{AgentKind, CONFIG_FILE, RalphConfig, load_config, write_config};
use ralph::io::git::Git;
use ralph::io::iteration_log::{default_log_path, records_path};
use ralph::io::process::CancelToken;
use ralph::io::prompt::PromptRenderer;
use ralph::io::sink::DualSinkLogger;
use ralph::logging;
use ralph::looping::{LoopRequest, run_loop};

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Commit-gated supervisor for long-running coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent loop in the current directory.
    Run(RunArgs),
    /// Write a default `.ralph.toml`.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,

        #[arg(long, default_value = CONFIG_FILE)]
        config: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Task prompt given to the agent every iteration.
    prompt: Option<String>,

    /// Read the task prompt from a file.
    #[arg(short, long, conflicts_with = "prompt")]
    file: Option<PathBuf>,

    #[arg(long)]
    max_iterations: Option<u32>,

    #[arg(long)]
    max_turns: Option<u32>,

    /// Per-iteration timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long, value_enum)]
    agent: Option<AgentKind>,

    #[arg(long)]
    system_prompt: Option<String>,

    /// Template file replacing the built-in outer prompt.
    #[arg(long)]
    outer_prompt: Option<PathBuf>,

    /// Durable log path (defaults to a timestamped file in the temp dir).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Pause for confirmation between iterations.
    #[arg(long)]
    human_in_the_loop: bool,

    #[arg(long, default_value = CONFIG_FILE)]
    config: PathBuf,
}

impl RunArgs {
    /// CLI flags win over file values.
    fn apply(&self, cfg: &mut RalphConfig) {
        if let Some(max_iterations) = self.max_iterations {
            cfg.max_iterations = max_iterations;
        }
        if let Some(max_turns) = self.max_turns {
            cfg.max_turns = max_turns;
        }
        if let Some(timeout) = self.timeout {
            cfg.iteration_timeout_secs = timeout;
        }
        if let Some(model) = &self.model {
            cfg.agent.model = model.clone();
        }
        if let Some(kind) = self.agent {
            cfg.agent.kind = kind;
        }
        if let Some(system_prompt) = &self.system_prompt {
            cfg.agent.system_prompt = Some(system_prompt.clone());
        }
        if self.human_in_the_loop {
            cfg.human_in_the_loop = true;
        }
    }

    fn read_prompt(&self) -> Result<String> {
        let prompt = match (&self.prompt, &self.file) {
            (Some(prompt), _) => prompt.clone(),
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("read prompt file {}", path.display()))?,
            (None, None) => bail!("a prompt is required (pass PROMPT or --file)"),
        };
        if prompt.trim().is_empty() {
            bail!("prompt is empty");
        }
        Ok(prompt)
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(&args),
        Command::Init { force, config } => {
            cmd_init(&config, force)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RalphConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let workdir = std::env::current_dir().context("resolve working directory")?;
    let mut cfg = load_config(&workdir.join(&args.config))?;
    args.apply(&mut cfg);
    cfg.validate()?;
    let prompt = args.read_prompt()?;

    let agent = agent_from_config(&cfg.agent)?;
    let prompts = match &args.outer_prompt {
        Some(path) => PromptRenderer::from_file(path)?,
        None => PromptRenderer::builtin(),
    };

    let log_path = args
        .log_file
        .clone()
        .unwrap_or_else(|| default_log_path(&workdir, Local::now()));
    let mut request = LoopRequest::from_config(&prompt, workdir.clone(), &cfg);
    request.records_path = Some(records_path(&log_path));

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || on_interrupt.cancel()).context("install Ctrl-C handler")?;

    let git = Git::new(&workdir);
    if !git.is_repo() {
        warn!(
            workdir = %workdir.display(),
            "not a git repository, commits will not be detected"
        );
    }

    let mut logger = DualSinkLogger::to_stdout(&log_path)?;
    println!("📝 Log: {}", log_path.display());

    let outcome = if cfg.human_in_the_loop {
        let mut checkpoint = ConsoleCheckpoint::stdin(git.clone(), cancel.clone());
        run_loop(
            &request,
            agent.as_ref(),
            &git,
            &mut checkpoint,
            &prompts,
            &mut logger,
            &cancel,
        )
    } else {
        run_loop(
            &request,
            agent.as_ref(),
            &git,
            &mut AutoContinue,
            &prompts,
            &mut logger,
            &cancel,
        )
    };
    let finished = logger.finish();
    let outcome = outcome?;
    finished?;

    info!(
        stop = outcome.stop.as_str(),
        iterations = outcome.iterations.len(),
        "run finished"
    );
    Ok(exit_codes::for_stop(outcome.stop))
}
