//! Integration tests for the `chexray status` and `chexray unlock` commands.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn chexray() -> Command {
    Command::cargo_bin("chexray").unwrap()
}

#[test]
fn test_status_without_state() {
    let temp_dir = TempDir::new().unwrap();

    chexray()
        .arg("status")
        .arg(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("no training state found"))
        .stdout(predicate::str::contains("Lock:"));
}

#[test]
fn test_status_json_output() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
        temp_dir.path().join("training_stats.json"),
        r#"{"run": 2, "best_mean_auroc": 0.81, "lr": 0.0005}"#,
    )
    .unwrap();
    std::fs::write(temp_dir.path().join(".training.lock"), "").unwrap();

    let assert = chexray().arg("status").arg(temp_dir.path()).arg("--json").assert().success();
    let json: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();

    assert_eq!(json["state"]["run"], 2);
    assert_eq!(json["state"]["lr"], 0.0005);
    assert_eq!(json["locked"], true);
}

#[test]
fn test_unlock_removes_stale_lock() {
    let temp_dir = TempDir::new().unwrap();
    let lock = temp_dir.path().join(".training.lock");
    std::fs::write(&lock, "pid=1\n").unwrap();

    chexray().arg("unlock").arg(temp_dir.path()).assert().success().stdout(predicate::str::contains("Removed"));
    assert!(!lock.exists());

    chexray().arg("unlock").arg(temp_dir.path()).assert().success().stdout(predicate::str::contains("No lock"));
}
