//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! They test the "wiring" between the CLI and the core library.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory and no relays
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("unisync").expect("Failed to find unisync binary");
    cmd.arg("--data-dir").arg(data_dir.path()).arg("--no-relay");
    cmd
}

/// Run a command and return its trimmed stdout
fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("Failed to run unisync");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

/// Create a namespace and return its ID
fn create_namespace(data_dir: &TempDir) -> String {
    stdout_of(cli_cmd(data_dir).args(["ns", "create"]))
}

// ============================================================================
// Info Command Tests
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("UniSync"))
        .stdout(predicate::str::contains("Author:"))
        .stdout(predicate::str::contains("Node:"))
        .stdout(predicate::str::contains("Data directory:"));
}

#[test]
fn test_author_is_stable_across_runs() {
    let data_dir = TempDir::new().unwrap();

    let first = stdout_of(cli_cmd(&data_dir).arg("author"));
    let second = stdout_of(cli_cmd(&data_dir).arg("author"));

    assert!(!first.is_empty());
    assert_eq!(first, second);
}

// ============================================================================
// Namespace Command Tests
// ============================================================================

#[test]
fn test_ns_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["ns", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No namespaces found."));
}

#[test]
fn test_ns_create_and_list() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    cli_cmd(&data_dir)
        .args(["ns", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(ns.as_str()))
        .stdout(predicate::str::contains("Created"));
}

#[test]
fn test_ns_default_is_stable() {
    let data_dir = TempDir::new().unwrap();

    let first = stdout_of(cli_cmd(&data_dir).args(["ns", "default"]));
    let second = stdout_of(cli_cmd(&data_dir).args(["ns", "default"]));
    assert_eq!(first, second);
}

#[test]
fn test_ns_delete() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    cli_cmd(&data_dir)
        .args(["ns", "delete", &ns])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted namespace"));

    cli_cmd(&data_dir)
        .args(["ns", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No namespaces found."));
}

#[test]
fn test_invalid_namespace_id() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["file", "list", "not-a-namespace!"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid namespace ID"));
}

// ============================================================================
// File Command Tests
// ============================================================================

#[test]
fn test_file_write_and_read() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    let hash = stdout_of(cli_cmd(&data_dir).args(["file", "write", &ns, "notes.txt", "--text", "hello"]));
    assert_eq!(hash, unisync_core::Hash::new(b"hello").to_hex());

    cli_cmd(&data_dir)
        .args(["file", "read", &ns, "notes.txt"])
        .assert()
        .success()
        .stdout("hello");
}

#[test]
fn test_file_write_from_stdin() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    cli_cmd(&data_dir)
        .args(["file", "write", &ns, "piped.txt"])
        .write_stdin("from stdin")
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["file", "read", &ns, "piped.txt"])
        .assert()
        .success()
        .stdout("from stdin");
}

#[test]
fn test_file_write_from_path_and_export() {
    let data_dir = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    let source = work.path().join("source.bin");
    std::fs::write(&source, vec![7u8; 4096]).unwrap();

    cli_cmd(&data_dir)
        .args(["file", "write", &ns, "data/source.bin", "--from"])
        .arg(&source)
        .assert()
        .success();

    let dest = work.path().join("out.bin");
    cli_cmd(&data_dir)
        .args(["file", "export", &ns, "data/source.bin"])
        .arg(&dest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 4096 bytes"));

    assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 4096]);
}

#[test]
fn test_file_list() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    cli_cmd(&data_dir)
        .args(["file", "list", &ns])
        .assert()
        .success()
        .stdout(predicate::str::contains("No files found."));

    cli_cmd(&data_dir)
        .args(["file", "write", &ns, "a.txt", "--text", "a"])
        .assert()
        .success();
    cli_cmd(&data_dir)
        .args(["file", "write", &ns, "b.txt", "--text", "bb"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["file", "list", &ns])
        .assert()
        .success()
        .stdout(predicate::str::contains("a.txt"))
        .stdout(predicate::str::contains("b.txt"));
}

#[test]
fn test_file_delete_hides_unless_all() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    cli_cmd(&data_dir)
        .args(["file", "write", &ns, "gone.txt", "--text", "bye"])
        .assert()
        .success();
    cli_cmd(&data_dir)
        .args(["file", "delete", &ns, "gone.txt"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["file", "read", &ns, "gone.txt"])
        .assert()
        .failure();

    cli_cmd(&data_dir)
        .args(["file", "list", &ns])
        .assert()
        .success()
        .stdout(predicate::str::contains("gone.txt").not());

    cli_cmd(&data_dir)
        .args(["file", "list", &ns, "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gone.txt"))
        .stdout(predicate::str::contains("deleted"));
}

#[test]
fn test_file_read_missing_fails() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    cli_cmd(&data_dir)
        .args(["file", "read", &ns, "missing.txt"])
        .assert()
        .failure();
}

// ============================================================================
// Blob Command Tests
// ============================================================================

#[test]
fn test_blob_read_by_hash() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    let hash = stdout_of(cli_cmd(&data_dir).args(["file", "write", &ns, "x.txt", "--text", "blob body"]));

    cli_cmd(&data_dir)
        .args(["blob", "read", &hash])
        .assert()
        .success()
        .stdout("blob body");
}

#[test]
fn test_blob_gc_removes_overwritten_content() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    let old = stdout_of(cli_cmd(&data_dir).args(["file", "write", &ns, "x.txt", "--text", "v1"]));
    cli_cmd(&data_dir)
        .args(["file", "write", &ns, "x.txt", "--text", "v2"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["blob", "gc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 blob(s)"));

    cli_cmd(&data_dir)
        .args(["blob", "read", &old])
        .assert()
        .failure();
}

// ============================================================================
// Sharing Command Tests
// ============================================================================

#[test]
fn test_share_prints_ticket() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    cli_cmd(&data_dir)
        .args(["share", &ns])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("docticket1:"));
}

#[test]
fn test_import_rejects_garbage_ticket() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["import", "docticket1:!!!"])
        .assert()
        .failure();
}

#[test]
fn test_sync_without_peers_fails() {
    let data_dir = TempDir::new().unwrap();
    let ns = create_namespace(&data_dir);

    cli_cmd(&data_dir).args(["sync", &ns]).assert().failure();
}

// ============================================================================
// Nodes Command Tests
// ============================================================================

#[test]
fn test_nodes_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["nodes", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No nodes found."));
}

#[test]
fn test_nodes_remove_unknown_fails() {
    let data_dir = TempDir::new().unwrap();
    let unknown = "00".repeat(32);

    cli_cmd(&data_dir)
        .args(["nodes", "remove", &unknown])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not known"));
}

// ============================================================================
// Help Tests
// ============================================================================

#[test]
fn test_help() {
    let mut cmd = Command::cargo_bin("unisync").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("peer-to-peer synchronized file store"));
}
