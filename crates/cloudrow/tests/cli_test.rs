#![allow(deprecated)] // cargo_bin is fine for a single-binary crate

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn cloudrow(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cloudrow").unwrap();
    cmd.current_dir(dir)
        .env_remove("CLOUDROW_CONFIG_PATH")
        .env_remove("CLOUDROW_ACCOUNT")
        .env_remove("RUST_LOG")
        .env("CLOUDROW_ACCESS_KEY_ID", "AKIATEST")
        .env("CLOUDROW_SECRET_ACCESS_KEY", "secret");
    cmd
}

fn json_output(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

/// Change counts for `kind` in a JSON run report
fn counts(report: &Value, kind: &str) -> Value {
    report["modules"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|m| m["mappers"].as_array().unwrap())
        .find(|m| m["kind"] == kind)
        .map(|m| m["counts"].clone())
        .unwrap()
}

fn rows(dir: &Path, table: &str) -> Vec<Value> {
    let tables = json_output(cloudrow(dir).args(["table", "list", table, "--json"]));
    tables[table]
        .as_object()
        .map(|rows| rows.values().cloned().collect())
        .unwrap_or_default()
}

fn project() -> TempDir {
    tempfile::tempdir().unwrap()
}

#[test]
fn test_cli_help() {
    let dir = project();
    cloudrow(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("table"));
}

#[test]
fn test_cli_version() {
    let dir = project();
    cloudrow(dir.path())
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cloudrow"));
}

#[test]
fn test_modules_lists_mappers() {
    let dir = project();
    cloudrow(dir.path())
        .arg("modules")
        .assert()
        .success()
        .stdout(predicate::str::contains("networking"))
        .stdout(predicate::str::contains("compute"))
        .stdout(predicate::str::contains("subnet -> network"))
        .stdout(predicate::str::contains("registration -> load_balancer, instance"));
}

#[test]
fn test_fresh_account_imports_default_network() {
    let dir = project();
    let report = json_output(cloudrow(dir.path()).args(["reconcile", "--json"]));
    assert_eq!(counts(&report, "network")["imported"], 1);
    assert_eq!(counts(&report, "firewall_rule")["imported"], 1);

    let networks = rows(dir.path(), "network");
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0]["is_default"], true);
    assert!(dir.path().join(".cloudrow/cloud.json").exists());
    assert!(dir.path().join(".cloudrow/state.json").exists());
}

#[test]
fn test_declared_network_is_created() {
    let dir = project();
    cloudrow(dir.path())
        .args([
            "table",
            "insert",
            "network",
            r#"{"region":"us-east-1","name":"main","cidr":"10.0.0.0/16"}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Inserted network row"));

    let report = json_output(cloudrow(dir.path()).args(["reconcile", "--json"]));
    assert_eq!(counts(&report, "network")["created"], 1);

    let main = rows(dir.path(), "network")
        .into_iter()
        .find(|n| n["name"] == "main")
        .unwrap();
    assert!(main["network_id"].as_str().unwrap().starts_with("net-"));

    // The provider state outlives the process
    let again = json_output(cloudrow(dir.path()).args(["reconcile", "--json"]));
    assert_eq!(counts(&again, "network")["created"], 0);
    assert_eq!(counts(&again, "network")["imported"], 0);
}

#[test]
fn test_plan_changes_nothing() {
    let dir = project();
    cloudrow(dir.path())
        .args([
            "table",
            "insert",
            "load_balancer",
            r#"{"region":"us-east-1","name":"front","scheme":"internal"}"#,
        ])
        .assert()
        .success();

    cloudrow(dir.path())
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("load_balancer"));

    let balancers = rows(dir.path(), "load_balancer");
    assert_eq!(balancers.len(), 1);
    assert!(balancers[0]["arn"].is_null());
}

#[test]
fn test_unknown_table_is_rejected() {
    let dir = project();
    cloudrow(dir.path())
        .args(["table", "insert", "bucket", "{}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown table 'bucket'"));
}

#[test]
fn test_identity_requires_mapper() {
    let dir = project();
    cloudrow(dir.path())
        .args(["reconcile", "--id", "us-east-1|net-1"])
        .assert()
        .failure();
}

#[test]
fn test_failed_run_exits_nonzero() {
    let dir = project();
    cloudrow(dir.path())
        .args([
            "table",
            "insert",
            "subnet",
            r#"{"region":"us-east-1","name":"web","network":{"kind":"network","id":"us-east-1|net-404"},"cidr":"10.0.1.0/24"}"#,
        ])
        .assert()
        .success();

    cloudrow(dir.path())
        .args(["reconcile", "--module", "networking"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Missing relation"));
}

#[test]
fn test_settings_disable_a_region() {
    let dir = project();
    std::fs::write(
        dir.path().join("cloudrow.yaml"),
        "scopes:\n  us-east-1: {}\n  eu-west-1:\n    enabled: false\n",
    )
    .unwrap();

    let report = json_output(cloudrow(dir.path()).args(["reconcile", "--json"]));
    assert_eq!(counts(&report, "network")["imported"], 1);

    let networks = rows(dir.path(), "network");
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0]["region"], "us-east-1");
}

fn instances(dir: &Path) -> usize {
    let cloud: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join(".cloudrow/cloud.json")).unwrap())
            .unwrap();
    cloud["regions"]["us-east-1"]["instances"]
        .as_object()
        .map_or(0, |instances| instances.len())
}

#[test]
fn test_interrupted_run_keeps_provider_changes() {
    let dir = project();
    // The instance takes longer to start than the whole run may last
    std::fs::write(
        dir.path().join("cloudrow.yaml"),
        "engine:\n  run_timeout_secs: 1\nwait:\n  initial_delay_ms: 10000\n  max_delay_ms: 10000\n",
    )
    .unwrap();
    for (table, row) in [
        ("network", r#"{"region":"us-east-1","name":"main","cidr":"10.0.0.0/16"}"#),
        (
            "subnet",
            r#"{"region":"us-east-1","name":"web","network":{"kind":"network","id":"~1"},"cidr":"10.0.1.0/24"}"#,
        ),
        (
            "instance",
            r#"{"region":"us-east-1","name":"web-1","image":"img-a","subnet":{"kind":"subnet","id":"~2"}}"#,
        ),
    ] {
        cloudrow(dir.path())
            .args(["table", "insert", table, row])
            .assert()
            .success();
    }

    // The run ends at its deadline or with the instance still starting;
    // either way the launch is on record
    cloudrow(dir.path()).arg("reconcile").output().unwrap();

    assert_eq!(instances(dir.path()), 1);
    let declared = rows(dir.path(), "instance");
    assert_eq!(declared.len(), 1);
    assert!(declared[0]["instance_id"].as_str().unwrap().starts_with("i-"));

    std::fs::remove_file(dir.path().join("cloudrow.yaml")).unwrap();
    let report = json_output(cloudrow(dir.path()).args(["reconcile", "--json"]));
    assert_eq!(counts(&report, "instance")["created"], 0);
    assert_eq!(counts(&report, "instance")["imported"], 0);
    assert_eq!(instances(dir.path()), 1);
}

#[test]
fn test_uninstall_and_reinstall_modules() {
    let dir = project();

    cloudrow(dir.path())
        .args(["uninstall", "networking"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("still needed by compute"));

    cloudrow(dir.path())
        .args(["uninstall", "compute", "networking"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Uninstalled compute"))
        .stdout(predicate::str::contains("Uninstalled networking"));

    cloudrow(dir.path())
        .arg("modules")
        .assert()
        .success()
        .stdout(predicate::str::contains("not installed"));
    cloudrow(dir.path())
        .args([
            "table",
            "insert",
            "network",
            r#"{"region":"us-east-1","name":"main","cidr":"10.0.0.0/16"}"#,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not installed"));
    cloudrow(dir.path())
        .args(["reconcile", "--module", "networking"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not installed"));

    let report = json_output(cloudrow(dir.path()).args(["reconcile", "--json"]));
    assert!(report["modules"].as_array().unwrap().is_empty());
    assert!(rows(dir.path(), "network").is_empty());

    // Installing compute brings networking back and imports what exists
    cloudrow(dir.path())
        .args(["install", "compute"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed networking"))
        .stdout(predicate::str::contains("Installed compute"));
    let networks = rows(dir.path(), "network");
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0]["is_default"], true);

    cloudrow(dir.path())
        .args(["install", "networking"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Already installed"));
    let again = json_output(cloudrow(dir.path()).args(["reconcile", "--json"]));
    assert_eq!(counts(&again, "network")["imported"], 0);
}
