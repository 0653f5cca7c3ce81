//! CLI tests for `ralph init` and `ralph run`.
//!
//! Spawns the ralph binary and verifies files written and exit codes.
#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use ralph::exit_codes;
use ralph::io::config::{CONFIG_FILE, RalphConfig, load_config};
use ralph::test_support::{TestRepo, write_script};

fn ralph(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ralph"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn ralph")
}

fn write_command_config(dir: &Path, script: &Path, max_iterations: u32) {
    let toml = format!(
        "max_iterations = {max_iterations}\n\
         iteration_timeout_secs = 20\n\
         grace_period_ms = 500\n\
         [agent]\n\
         kind = \"command\"\n\
         command = [\"{}\"]\n\
         protocol = \"plain-text\"\n",
        script.display()
    );
    fs::write(dir.join(CONFIG_FILE), toml).expect("write config");
}

#[test]
fn init_writes_default_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["init"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let cfg = load_config(&temp.path().join(CONFIG_FILE)).expect("load");
    assert_eq!(cfg, RalphConfig::default());
    assert!(!temp.path().join(".ralph.toml.tmp").exists());
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(CONFIG_FILE);
    fs::write(&path, "max_iterations = 7\n").expect("write");

    let output = ralph(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));
    assert_eq!(fs::read_to_string(&path).expect("read"), "max_iterations = 7\n");

    let output = ralph(temp.path(), &["init", "--force"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load"), RalphConfig::default());
}

#[test]
fn run_without_prompt_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("prompt is required"));
}

#[test]
fn run_with_invalid_config_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join(CONFIG_FILE), "iteration_timeout_secs = 0\n").expect("write");
    let output = ralph(temp.path(), &["run", "do the task"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn run_exhausting_the_budget_exits_with_budget_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent.sh", "echo thinking\n").expect("script");
    write_command_config(temp.path(), &script, 2);
    let log = temp.path().join("run.log");

    let output = ralph(
        temp.path(),
        &["run", "do the task", "--log-file", log.to_str().expect("utf8 path")],
    );

    assert_eq!(output.status.code(), Some(exit_codes::BUDGET_EXHAUSTED));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("thinking"));
    let contents = fs::read_to_string(&log).expect("read log");
    assert!(contents.contains("=== ITERATION 2 END ==="));
    assert!(temp.path().join("run.log.jsonl").exists());
}

#[test]
fn run_completing_with_a_commit_exits_ok() {
    let repo = TestRepo::new().expect("repo");
    repo.commit("initial").expect("commit");
    let scratch = tempfile::tempdir().expect("scratch");
    let script = write_script(
        scratch.path(),
        "agent.sh",
        "echo done > done.txt\ngit add done.txt\ngit commit -q -m done\necho RALPH_LOOP_COMPLETE\n",
    )
    .expect("script");
    write_command_config(repo.path(), &script, 3);
    let log = scratch.path().join("run.log");

    let output = ralph(
        repo.path(),
        &["run", "finish it", "--log-file", log.to_str().expect("utf8 path")],
    );

    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let contents = fs::read_to_string(&log).expect("read log");
    assert!(contents.contains("stop:       complete"));
}

#[test]
fn flags_override_the_config_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent.sh", "echo once\n").expect("script");
    write_command_config(temp.path(), &script, 5);
    let log = temp.path().join("run.log");

    let output = ralph(
        temp.path(),
        &[
            "run",
            "do the task",
            "--max-iterations",
            "1",
            "--log-file",
            log.to_str().expect("utf8 path"),
        ],
    );

    assert_eq!(output.status.code(), Some(exit_codes::BUDGET_EXHAUSTED));
    let contents = fs::read_to_string(&log).expect("read log");
    assert!(contents.contains("=== ITERATION 1 END ==="));
    assert!(!contents.contains("=== ITERATION 2 START ==="));
}
