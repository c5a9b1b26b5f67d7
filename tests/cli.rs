//! Integration tests for the appbox CLI.
//!
//! These tests run the actual binary against a temporary sandbox base
//! directory and check output, exit codes, and filesystem effects.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

/// Creates a Command for the appbox binary.
#[allow(deprecated)]
fn appbox() -> Command {
    Command::cargo_bin("appbox").expect("failed to find appbox binary")
}

/// A working directory with an `appbox.toml` pointing the local backend at
/// a sandbox base inside the same tempdir, so tests never touch the real
/// system tmpdir.
fn workspace() -> TempDir {
    let dir = TempDir::new().expect("failed to create tempdir");
    let base = dir.path().join("sandboxes");
    let config = format!(
        "[sandbox.local]\nbase_dir = \"{}\"\n",
        base.display()
    );
    fs::write(dir.path().join("appbox.toml"), config).expect("failed to write config");
    dir
}

/// Creates a Command for appbox running in a specific directory.
fn appbox_in(dir: &TempDir) -> Command {
    let mut cmd = appbox();
    cmd.current_dir(dir.path());
    cmd
}

// -----------------------------------------------------------------------------
// Help and version tests
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    appbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("appbox"))
        .stdout(predicate::str::contains("write"))
        .stdout(predicate::str::contains("read"))
        .stdout(predicate::str::contains("ls"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("destroy"));
}

#[test]
fn test_version_shows_version() {
    appbox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("appbox"));
}

#[test]
fn test_run_help_shows_options() {
    appbox()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--timeout"))
        .stdout(predicate::str::contains("--background"))
        .stdout(predicate::str::contains("--session"));
}

// -----------------------------------------------------------------------------
// File operations
// -----------------------------------------------------------------------------

#[test]
fn test_write_then_read_round_trip() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["write", "src/app/page.tsx", "--content", "export default {}"])
        .assert()
        .success()
        .stdout(predicate::str::contains("17 bytes"));

    appbox_in(&dir)
        .args(["read", "src/app/page.tsx"])
        .assert()
        .success()
        .stdout("export default {}");
}

#[test]
fn test_write_creates_session_directory() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["write", "notes.txt", "--content", "hello"])
        .assert()
        .success();

    let root = dir.path().join("sandboxes").join("default");
    assert!(root.join("notes.txt").exists());
}

#[test]
fn test_write_reads_stdin_when_no_content_flag() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["write", "stdin.txt"])
        .write_stdin("piped content")
        .assert()
        .success();

    appbox_in(&dir)
        .args(["read", "stdin.txt"])
        .assert()
        .success()
        .stdout("piped content");
}

#[test]
fn test_read_missing_file_fails() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["read", "missing.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.txt"));
}

#[test]
fn test_path_traversal_is_rejected() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["write", "../outside.txt", "--content", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("escapes the sandbox"));
}

#[test]
fn test_ls_lists_written_files() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["write", "a.txt", "--content", "a"])
        .assert()
        .success();
    appbox_in(&dir)
        .args(["write", "b.txt", "--content", "b"])
        .assert()
        .success();

    appbox_in(&dir)
        .args(["ls", "."])
        .assert()
        .success()
        .stdout(predicate::str::contains("a.txt"))
        .stdout(predicate::str::contains("b.txt"));
}

#[test]
fn test_sessions_are_isolated() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["--session", "alpha", "write", "shared.txt", "--content", "A"])
        .assert()
        .success();

    appbox_in(&dir)
        .args(["--session", "beta", "read", "shared.txt"])
        .assert()
        .failure();
}

// -----------------------------------------------------------------------------
// Command execution
// -----------------------------------------------------------------------------

#[test]
fn test_run_captures_stdout() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["run", "echo hello from the sandbox"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from the sandbox"));
}

#[test]
fn test_run_propagates_exit_code() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["run", "exit 3"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("exited with code 3"));
}

#[test]
fn test_run_uses_session_root_as_cwd() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["write", "marker.txt", "--content", "x"])
        .assert()
        .success();

    appbox_in(&dir)
        .args(["run", "cat marker.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("x"));
}

#[test]
fn test_run_timeout_fails() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["run", "--timeout", "1", "sleep 10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timed out"));
}

// -----------------------------------------------------------------------------
// Teardown
// -----------------------------------------------------------------------------

#[test]
fn test_destroy_removes_session_directory() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["write", "app.txt", "--content", "x"])
        .assert()
        .success();
    let root = dir.path().join("sandboxes").join("default");
    assert!(root.exists());

    appbox_in(&dir)
        .arg("destroy")
        .assert()
        .success()
        .stdout(predicate::str::contains("destroyed"));
    assert!(!root.exists());
}

#[test]
fn test_destroy_keep_files_leaves_directory() {
    let dir = workspace();

    appbox_in(&dir)
        .args(["write", "app.txt", "--content", "x"])
        .assert()
        .success();

    appbox_in(&dir)
        .args(["destroy", "--keep-files"])
        .assert()
        .success();

    let root = dir.path().join("sandboxes").join("default");
    assert!(root.join("app.txt").exists());
}

#[test]
fn test_destroy_without_prior_session_succeeds() {
    let dir = workspace();

    appbox_in(&dir)
        .arg("destroy")
        .assert()
        .success();
}
