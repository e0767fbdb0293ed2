//! Integration tests for the sandforge CLI.
//!
//! These tests run the actual executable and check output, exit codes and
//! file system effects. Nothing here talks to a model or sandbox API.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

#[allow(deprecated)]
fn sandforge() -> Command {
    Command::cargo_bin("sandforge").expect("failed to find sandforge binary")
}

fn sandforge_in(dir: &TempDir) -> Command {
    let mut cmd = sandforge();
    cmd.current_dir(dir.path());
    cmd
}

/// A project whose sqlite store lives inside the temp dir.
fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("sandforge.toml"),
        "[store]\nbackend = \"sqlite\"\npath = \"state/sandforge.db\"\n",
    )
    .unwrap();
    dir
}

// -----------------------------------------------------------------------------
// Help and version
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    sandforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sandforge"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("credits"));
}

#[test]
fn test_version_shows_version() {
    sandforge()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sandforge"));
}

#[test]
fn test_run_help_shows_options() {
    sandforge()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--user"))
        .stdout(predicate::str::contains("--thread"))
        .stdout(predicate::str::contains("--run-id"));
}

// -----------------------------------------------------------------------------
// init
// -----------------------------------------------------------------------------

#[test]
fn test_init_creates_files() {
    let dir = TempDir::new().unwrap();

    sandforge_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("sandforge initialized"));

    assert!(dir.path().join("sandforge.toml").exists());
    assert!(dir.path().join("prompts/system.md").exists());
    assert!(dir.path().join("prompts/title.md").exists());
    assert!(dir.path().join("prompts/response.md").exists());

    let config = fs::read_to_string(dir.path().join("sandforge.toml")).unwrap();
    assert!(config.contains("[sandbox]"));
}

#[test]
fn test_init_skips_existing_without_force() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("sandforge.toml"), "# custom\n").unwrap();

    sandforge_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));

    let content = fs::read_to_string(dir.path().join("sandforge.toml")).unwrap();
    assert_eq!(content, "# custom\n");
}

#[test]
fn test_init_force_overwrites() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("sandforge.toml"), "# custom\n").unwrap();

    sandforge_in(&dir)
        .args(["init", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("overwritten"));

    let content = fs::read_to_string(dir.path().join("sandforge.toml")).unwrap();
    assert!(content.contains("[model]"));
}

// -----------------------------------------------------------------------------
// credits
// -----------------------------------------------------------------------------

#[test]
fn test_credits_set_then_show() {
    let dir = project();

    sandforge_in(&dir)
        .args(["credits", "set", "--user", "alice", "--amount", "12", "--plan", "pro"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Balance updated"))
        .stdout(predicate::str::contains("PRO"));

    sandforge_in(&dir)
        .args(["credits", "show", "--user", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("12"))
        .stdout(predicate::str::contains("PRO"));

    assert!(dir.path().join("state/sandforge.db").exists());
}

#[test]
fn test_credits_show_unknown_user() {
    let dir = project();

    sandforge_in(&dir)
        .args(["credits", "show", "--user", "nobody"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Unknown user"));
}

#[test]
fn test_credits_rejects_invalid_plan() {
    let dir = project();

    sandforge_in(&dir)
        .args(["credits", "set", "--user", "a", "--amount", "1", "--plan", "gold"])
        .assert()
        .failure();
}

// -----------------------------------------------------------------------------
// status and run
// -----------------------------------------------------------------------------

#[test]
fn test_status_requires_target() {
    sandforge().arg("status").assert().failure();
}

#[test]
fn test_status_empty_thread() {
    let dir = project();

    sandforge_in(&dir)
        .args(["status", "--thread", "t-empty"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No messages in thread"));
}

#[test]
fn test_run_rejects_oversized_request() {
    let dir = project();

    sandforge_in(&dir)
        .args(["run", "--user", "u", "--thread", "t"])
        .arg("x".repeat(1001))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Message is too long"));
}

#[test]
fn test_run_without_api_key_fails_after_recording_request() {
    let dir = project();

    sandforge_in(&dir)
        .env_remove("GEMINI_API_KEY")
        .args(["run", "--user", "u", "--thread", "t1", "build a counter button"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("GEMINI_API_KEY"));

    // The user was created on the free plan and the request was stored
    sandforge_in(&dir)
        .args(["credits", "show", "--user", "u"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FREE"));

    sandforge_in(&dir)
        .args(["status", "--thread", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("build a counter button"));
}
