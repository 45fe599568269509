//! CLI smoke tests for the `foreman` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn foreman(project: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("foreman").expect("binary builds");
    cmd.arg("--project").arg(project.path());
    cmd
}

#[test]
fn shows_help() {
    Command::cargo_bin("foreman")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestration"));
}

#[test]
fn init_creates_project_state() {
    let temp = TempDir::new().unwrap();
    foreman(&temp)
        .args(["init", "--name", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized"));

    assert!(temp.path().join(".foreman/project.json").exists());
}

#[test]
fn init_twice_is_rejected() {
    let temp = TempDir::new().unwrap();
    foreman(&temp).args(["init", "--name", "demo"]).assert().success();
    foreman(&temp)
        .args(["init", "--name", "demo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn author_phases_and_tasks_then_status() {
    let temp = TempDir::new().unwrap();
    foreman(&temp).args(["init", "--name", "demo"]).assert().success();

    foreman(&temp)
        .args(["phase", "create", "Auth", "--branch", "feature/auth"])
        .assert()
        .success()
        .stdout(predicate::str::contains("phase-1"));

    foreman(&temp)
        .args([
            "task",
            "create",
            "phase-1",
            "Add login",
            "--description",
            "Implement the login flow",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("task-1"));

    foreman(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("demo"))
        .stdout(predicate::str::contains("Auth"))
        .stdout(predicate::str::contains("0/1 tasks done"));

    foreman(&temp)
        .args(["task", "list", "--phase-id", "phase-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[TODO] Add login"));
}

#[test]
fn phase_activate_by_number() {
    let temp = TempDir::new().unwrap();
    foreman(&temp).args(["init", "--name", "demo"]).assert().success();
    foreman(&temp)
        .args(["phase", "create", "One", "--branch", "feature/one"])
        .assert()
        .success();
    foreman(&temp)
        .args(["phase", "create", "Two", "--branch", "feature/two"])
        .assert()
        .success();

    foreman(&temp)
        .args(["phase", "activate", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Two"));
}

#[test]
fn task_start_unknown_phase_fails_with_validation_exit_code() {
    let temp = TempDir::new().unwrap();
    foreman(&temp).args(["init", "--name", "demo"]).assert().success();

    foreman(&temp)
        .args(["task", "start", "ghost", "task-1", "--assignee", "CLAUDE_CLI"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("Unknown phase"));
}

#[test]
fn agents_list_on_fresh_project_is_empty() {
    let temp = TempDir::new().unwrap();
    foreman(&temp).args(["init", "--name", "demo"]).assert().success();
    foreman(&temp)
        .args(["agents", "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn config_shows_worker_table() {
    let temp = TempDir::new().unwrap();
    foreman(&temp).args(["init", "--name", "demo"]).assert().success();
    foreman(&temp)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("CLAUDE_CLI"))
        .stdout(predicate::str::contains("startup_silence_timeout_ms"));
}

#[test]
fn status_without_init_fails_distinctly() {
    let temp = TempDir::new().unwrap();
    foreman(&temp)
        .arg("status")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Project state not found"));
}
