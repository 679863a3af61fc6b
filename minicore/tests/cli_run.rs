//! CLI tests for the `mini` binary.
//!
//! Spawns the binary and verifies exit codes and that stdout stays a pure
//! JSONL event stream, even when the run cannot start.

use std::process::{Command, Output};

use serde_json::Value;

use minicore::exit_codes;
use minicore::io::workspace::AgentPaths;

fn mini(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mini"))
        .current_dir(dir)
        .args(args)
        .env_remove("MINI_CONFIG_DIR")
        .env_remove("RUST_LOG")
        .env_remove("MINI_COST_TRACKING")
        .output()
        .expect("spawn mini")
}

fn json_lines(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line should be JSON"))
        .collect()
}

#[test]
fn run_without_task_reports_error_event() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = mini(temp.path(), &["run"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let events = json_lines(&output.stdout);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "error");
    assert!(
        events[0]["data"]["message"]
            .as_str()
            .expect("message")
            .contains("--task")
    );
    assert!(events[0]["timestamp"].is_string());
}

#[test]
fn run_with_missing_config_reports_error_event() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = mini(
        temp.path(),
        &["run", "--task", "list files", "--config", "missing.toml"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let events = json_lines(&output.stdout);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["data"]["recoverable"], false);
    assert!(
        events[0]["data"]["message"]
            .as_str()
            .expect("message")
            .contains("missing.toml")
    );
}

#[test]
fn init_creates_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = mini(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let paths = AgentPaths::new(temp.path());
    assert!(paths.live_config_path.is_file());
    assert!(paths.gitignore_path.is_file());
    assert!(paths.data_dir.is_dir());

    let again = mini(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
    let forced = mini(temp.path(), &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

/// Verifies a full run through the command backend: a shell script stands in
/// for the model and submits on its first turn.
#[cfg(unix)]
#[test]
fn run_with_command_backend_streams_events() {
    use std::fs;

    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("mini.toml");
    fs::write(
        &config,
        r#"[model]
backend = "command"
model_name = "scripted"
command = ["sh", "-c", "cat >/dev/null; printf '%s\n' '{\"content\": \"All set.\\nCOMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\\nnothing to do\", \"cost\": 0.001}'"]

[headless]
include_timestamps = false
"#,
    )
    .expect("write config");

    let output = mini(
        temp.path(),
        &["run", "--task", "noop", "--config", "mini.toml"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let events = json_lines(&output.stdout);
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| e["type"].as_str().expect("type"))
        .collect();
    assert_eq!(kinds, ["start", "thought", "cost", "finish"]);
    let finish = &events[3]["data"];
    assert_eq!(finish["status"], "completed");
    assert_eq!(finish["result"], "nothing to do");
    assert_eq!(finish["total_steps"], 1);

    let trajectory = AgentPaths::new(temp.path()).last_run_path;
    assert!(trajectory.is_file());
}
