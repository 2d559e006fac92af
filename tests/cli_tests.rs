//! Binary-level checks for the `arcadia` CLI.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("arcadia")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("respond"));
}

#[test]
fn status_without_a_project_fails_clearly() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("arcadia")
        .unwrap()
        .args(["--project-dir"])
        .arg(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no project store"));
}

#[test]
fn respond_to_unknown_injection_fails() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("arcadia")
        .unwrap()
        .args(["--project-dir"])
        .arg(dir.path())
        .args(["respond", "99", "--response", "Approve"])
        .assert()
        .failure();
}
