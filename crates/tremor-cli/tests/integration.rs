#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tremor(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tremor").unwrap();
    cmd.current_dir(dir.path())
        .env("TREMOR_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

/// Nothing listens on the discard port locally, so fetches fail fast.
const UNREACHABLE: &str = "http://127.0.0.1:9/chart.png";

fn init_project(dir: &TempDir, url: &str) {
    tremor(dir).args(["init", "--url", url]).assert().success();
}

fn json_out(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.output().unwrap();
    serde_json::from_slice(&out.stdout).unwrap()
}

// ---------------------------------------------------------------------------
// tremor init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_layout() {
    let dir = TempDir::new().unwrap();
    tremor(&dir)
        .args(["init", "--url", UNREACHABLE])
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .tremor/config.yaml"));

    assert!(dir.path().join(".tremor").is_dir());
    assert!(dir.path().join(".tremor/config.yaml").exists());
    let subs = std::fs::read_to_string(dir.path().join(".tremor/subscribers.yaml")).unwrap();
    assert_eq!(subs.trim(), "subscribers: []");
    let csv = std::fs::read_to_string(dir.path().join("data/tremor.csv")).unwrap();
    assert_eq!(csv.lines().count(), 1);
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_project(&dir, UNREACHABLE);
    let before = std::fs::read_to_string(dir.path().join(".tremor/config.yaml")).unwrap();

    tremor(&dir)
        .args(["init", "--url", "http://elsewhere.test/x.png"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .tremor/config.yaml"));

    let after = std::fs::read_to_string(dir.path().join(".tremor/config.yaml")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn init_adopts_legacy_dataset() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("tremor.csv"),
        "timestamp,value\n2026-01-01 00:00:00,1.5\n2026-01-01 00:10:00,1.6\n",
    )
    .unwrap();
    tremor(&dir)
        .args(["init", "--url", UNREACHABLE])
        .assert()
        .success()
        .stdout(predicate::str::contains("Legacy"));
    let csv = std::fs::read_to_string(dir.path().join("data/tremor.csv")).unwrap();
    assert_eq!(csv.lines().count(), 3);
}

// ---------------------------------------------------------------------------
// tremor config
// ---------------------------------------------------------------------------

#[test]
fn config_validate_flags_missing_url() {
    let dir = TempDir::new().unwrap();
    tremor(&dir).arg("init").assert().success();
    tremor(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] source.primary_url is empty"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_validate_passes_with_url() {
    let dir = TempDir::new().unwrap();
    init_project(&dir, UNREACHABLE);
    tremor(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_show_json() {
    let dir = TempDir::new().unwrap();
    init_project(&dir, UNREACHABLE);
    let value = json_out(tremor(&dir).args(["--json", "config", "show"]));
    assert_eq!(value["source"]["primary_url"], UNREACHABLE);
    assert_eq!(value["serving"]["default_limit"], 1000);
}

// ---------------------------------------------------------------------------
// tremor query / runs
// ---------------------------------------------------------------------------

#[test]
fn query_before_first_run() {
    let dir = TempDir::new().unwrap();
    init_project(&dir, UNREACHABLE);
    let value = json_out(tremor(&dir).args(["query", "--json"]));
    assert_eq!(value["ok"], false);
    assert_eq!(value["reason"], "empty_data");
    assert_eq!(value["rows"], 0);
    assert!(!dir.path().join(".tremor/pipeline.db").exists());
}

#[test]
fn query_rejects_unknown_range() {
    let dir = TempDir::new().unwrap();
    init_project(&dir, UNREACHABLE);
    tremor(&dir)
        .args(["query", "--range", "90d"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("90d"));
}

#[test]
fn runs_empty() {
    let dir = TempDir::new().unwrap();
    init_project(&dir, UNREACHABLE);
    tremor(&dir)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded."));
    assert!(!dir.path().join(".tremor/pipeline.db").exists());
}

#[test]
fn failed_run_exits_nonzero_and_is_recorded() {
    let dir = TempDir::new().unwrap();
    init_project(&dir, UNREACHABLE);
    let before = std::fs::read(dir.path().join("data/tremor.csv")).unwrap();

    tremor(&dir)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("run failed"));

    let after = std::fs::read(dir.path().join("data/tremor.csv")).unwrap();
    assert_eq!(before, after);

    let runs = json_out(tremor(&dir).args(["runs", "--json"]));
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["outcome"], "failed");
    assert_eq!(runs[0]["trigger"], "manual");
}

// ---------------------------------------------------------------------------
// Uninitialized
// ---------------------------------------------------------------------------

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    for args in [
        vec!["run"],
        vec!["query"],
        vec!["runs"],
        vec!["config", "validate"],
    ] {
        tremor(&dir)
            .args(&args)
            .assert()
            .failure()
            .stderr(predicate::str::contains("not initialized"));
    }
}
