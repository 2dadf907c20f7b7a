// crates/replica-judge-cli/tests/cli_commands.rs
// ============================================================================
// Module: CLI Command Tests
// Description: Integration tests driving the replica-judge binary.
// Purpose: Ensure rule, evaluator, lock, and backlog commands share one store.
// Dependencies: replica-judge-cli binary
// ============================================================================
//! ## Overview
//! Runs the binary against a temporary `SQLite` store and inventory snapshot,
//! covering the rule lifecycle end to end and fail-closed config handling.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    clippy::missing_docs_in_private_items,
    reason = "Test-only output and panic-based assertions are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Output;

use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn judge_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_replica-judge"))
}

/// Temporary workspace holding config, inventory, and database.
struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let inventory = dir.path().join("inventory.json");
        fs::write(&inventory, serde_json::to_vec(&inventory_json()).unwrap())
            .expect("write inventory");
        let database = dir.path().join("judge.sqlite");
        let config = dir.path().join("replica-judge.toml");
        let body = format!(
            "[evaluator]\nworker = \"cli-test\"\n\n[store]\ntype = \"sqlite\"\npath = '{}'\n\n\
             [inventory]\npath = '{}'\n\n[events]\nsink = \"none\"\n",
            database.display(),
            inventory.display()
        );
        fs::write(&config, body).expect("write config");
        Self {
            dir,
            config,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut command = Command::new(judge_bin());
        command.args(args).arg("--config").arg(&self.config);
        command.output().expect("run replica-judge")
    }

    fn run_json(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(output.status.success(), "{args:?} failed: {stderr}");
        serde_json::from_slice(&output.stdout).expect("stdout json")
    }
}

fn inventory_json() -> Value {
    json!({
        "dids": [
            { "key": { "scope": "data18", "name": "dataset" }, "did_type": "DATASET" },
            { "key": { "scope": "data18", "name": "file_1" }, "did_type": "FILE", "bytes": 100 },
            { "key": { "scope": "data18", "name": "file_2" }, "did_type": "FILE", "bytes": 200 }
        ],
        "attachments": [
            {
                "parent": { "scope": "data18", "name": "dataset" },
                "child": { "scope": "data18", "name": "file_1" }
            },
            {
                "parent": { "scope": "data18", "name": "dataset" },
                "child": { "scope": "data18", "name": "file_2" }
            }
        ],
        "rses": [
            { "id": "MOCK", "attributes": { "T1": true } },
            { "id": "MOCK2", "attributes": { "T1": true } }
        ]
    })
}

fn write_request(path: &Path) {
    let request = json!({
        "roots": [{ "scope": "data18", "name": "dataset" }],
        "account": "jdoe",
        "copies": 1,
        "rse_expression": "T1",
        "grouping": "DATASET"
    });
    fs::write(path, serde_json::to_vec(&request).unwrap()).expect("write request");
}

// ============================================================================
// SECTION: Tests
// ============================================================================

/// Verifies a rule can be created, evaluated, inspected, and purged.
#[test]
fn cli_rule_lifecycle_round_trips_through_sqlite() {
    let workspace = Workspace::new();
    let request = workspace.path("rule.json");
    write_request(&request);

    let created =
        workspace.run_json(&["rule", "create", "--input", request.to_string_lossy().as_ref()]);
    assert_eq!(created["rule_id"], json!(1));

    let rule = workspace.run_json(&["rule", "get", "1"]);
    assert_eq!(rule["state"], json!("INJECT"));

    let report = workspace.run_json(&["evaluate", "--once"]);
    assert_eq!(report["locks_created"], json!(2));

    let rule = workspace.run_json(&["rule", "get", "1"]);
    assert_eq!(rule["state"], json!("REPLICATING"));

    let file_locks =
        workspace.run_json(&["locks", "files", "--scope", "data18", "--name", "file_1"]);
    assert_eq!(file_locks.as_array().map(Vec::len), Some(1));
    let dataset_locks =
        workspace.run_json(&["locks", "datasets", "--scope", "data18", "--name", "dataset"]);
    assert_eq!(dataset_locks, json!([file_locks[0].clone()]));

    let purged = workspace.run_json(&["rule", "purge", "1"]);
    assert_eq!(purged["locks_removed"], json!(2));

    let missing = workspace.run(&["rule", "get", "1"]);
    assert!(!missing.status.success());
}

/// Verifies backlog hooks enqueue once per pending collection.
#[test]
fn cli_backlog_attach_collapses_pending_duplicates() {
    let workspace = Workspace::new();
    let args = [
        "backlog", "attach", "--scope", "data18", "--name", "dataset", "--child", "file_1",
    ];
    let first = workspace.run_json(&args);
    assert_eq!(first["did"], json!("data18:dataset"));
    assert_eq!(first["enqueued"], json!(true));

    let second = workspace.run_json(&args);
    assert_eq!(second["enqueued"], json!(false));

    let report = workspace.run_json(&["evaluate", "--once", "--did-limit", "10"]);
    assert_eq!(report["processed_dids"], json!(1));
}

/// Verifies `config validate` accepts the workspace config.
#[test]
fn cli_config_validate_accepts_valid_config() {
    let workspace = Workspace::new();
    let output = workspace.run_json(&["config", "validate"]);
    assert_eq!(output, json!({ "valid": true }));
}

/// Verifies unknown config keys fail closed with a stderr message.
#[test]
fn cli_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("replica-judge.toml");
    fs::write(&config, "[evaluator]\ndid_limt = 5\n").unwrap();

    for args in [["config", "validate"], ["rule", "purge-expired"]] {
        let output = Command::new(judge_bin())
            .args(args)
            .arg("--config")
            .arg(&config)
            .output()
            .expect("run replica-judge");
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("failed to load config"), "unexpected stderr: {stderr}");
    }
}

/// Verifies out-of-range `--did-limit` overrides are rejected.
#[test]
fn cli_rejects_zero_did_limit() {
    let workspace = Workspace::new();
    let output = workspace.run(&["evaluate", "--once", "--did-limit", "0"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--did-limit"), "unexpected stderr: {stderr}");
}
