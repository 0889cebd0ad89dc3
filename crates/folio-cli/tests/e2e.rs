//! End-to-end tests for the `folio` binary.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).expect("Failed to write cell file");
    path
}

fn folio() -> Command {
    let mut cmd = Command::cargo_bin("folio").expect("folio binary not built");
    cmd.env_remove("FOLIO_PACKAGE_PATH");
    cmd
}

#[test]
fn test_run_cells_in_order() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "a.fs", "var x = 20\nprint(\"hello\", x)");
    let b = write(dir.path(), "b.fs", "x + 22");

    folio()
        .args(["run", "--in-process"])
        .arg(&a)
        .arg(&b)
        .assert()
        .success()
        .stdout(predicate::str::contains("hello 20"))
        .stdout(predicate::str::contains("42"))
        .stdout(predicate::str::contains("Completed"));
}

#[test]
fn test_run_json_events() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "a.fs", "print(\"out\")\n1 + 1");

    let output = folio()
        .args(["run", "--in-process", "--json"])
        .arg(&a)
        .output()
        .unwrap();
    assert!(output.status.success());

    let events: Vec<serde_json::Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line is one JSON event"))
        .collect();
    let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["started", "captured_output", "result", "finished"]);
    assert_eq!(events[1]["text"], "out\n");
    assert_eq!(events[2]["value"]["text"], "2");
    assert_eq!(events[3]["status"], "success");
}

#[test]
fn test_compile_error_fails_run() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "a.fs", "var x = (1 +");
    let b = write(dir.path(), "b.fs", "print(\"unreachable\")");

    folio()
        .args(["run", "--in-process"])
        .arg(&a)
        .arg(&b)
        .assert()
        .failure()
        .stdout(predicate::str::contains("after 1 of 2 cell(s)"))
        .stdout(predicate::str::contains("unreachable").not());
}

#[test]
fn test_runtime_fault_fails_run() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "a.fs", "fail(\"bad input\")");

    folio()
        .args(["run", "--in-process"])
        .arg(&a)
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad input"));
}

#[test]
fn test_exit_loses_context() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "a.fs", "exit(3)");

    folio()
        .args(["run", "--in-process"])
        .arg(&a)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Execution context lost"));
}

#[test]
fn test_package_path() {
    let packages = TempDir::new().unwrap();
    let pkg = packages.path().join("mathx").join("1.0.0");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(
        pkg.join("package.toml"),
        "name = \"mathx\"\nversion = \"1.0.0\"\n\n[exports]\npi = 3\n",
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "a.fs", "#r \"mathx@^1.0\"\nmathx.pi * 14");

    folio()
        .args(["run", "--in-process", "--package-path"])
        .arg(packages.path())
        .arg(&a)
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));

    // The resolution is remembered next to the cells.
    assert!(dir.path().join(".folio").exists());
}

#[test]
fn test_unresolvable_package() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "a.fs", "#r \"nosuch\"\n1");

    folio()
        .args(["run", "--in-process"])
        .arg(&a)
        .assert()
        .failure()
        .stderr(predicate::str::contains("nosuch"));
}

#[test]
fn test_missing_file() {
    folio()
        .args(["run", "--in-process", "does-not-exist.fs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_run_requires_files() {
    folio().arg("run").assert().failure();
}
