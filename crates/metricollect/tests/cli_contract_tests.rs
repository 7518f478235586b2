//! CLI command contract tests
//!
//! Runs the `mcollect` binary against a temp config and checks exit codes,
//! stdout shape and the remediation text on failure paths.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

/// Temp dir holding `mcollect.toml` whose `run_dir` points back into it.
fn setup_config() -> (TempDir, String) {
    let dir = TempDir::new().expect("create temp dir");
    let run_dir = dir.path().join("run");
    let config = format!(
        r#"
[general]
log_level = "warn"
run_dir = "{}"

[runner]
initial_workers = 1

[[applications]]
name = "web"
prefix = "production"
publishers = ["stdout"]

[[applications.metrics]]
namespace = "System"
name = "LoadAverage"
unit = "none"
value = 0.75

[[applications.metrics]]
namespace = "Unicorn"
name = "Workers"
roles = ["web"]
value = 4.0

[[applications.metrics]]
namespace = "Redis"
name = "Keys"
roles = ["cron"]
command = "echo 12"
"#,
        run_dir.display()
    );
    let path = dir.path().join("mcollect.toml");
    std::fs::write(&path, config).expect("write config");
    let path = path.to_string_lossy().to_string();
    (dir, path)
}

#[allow(deprecated)]
fn mcollect(config: &str) -> Command {
    let mut cmd = Command::cargo_bin("mcollect").expect("mcollect binary should be built");
    cmd.env_remove("RUST_LOG");
    cmd.args(["--config", config]);
    cmd
}

// =============================================================================
// mcollect config
// =============================================================================

#[test]
#[allow(deprecated)]
fn contract_config_prints_default_toml() {
    let output = Command::cargo_bin("mcollect")
        .expect("binary")
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");

    assert!(text.contains("[runner]"), "{text}");
    assert!(text.contains("frequency_secs = 120"), "{text}");
    let parsed: toml::Value = toml::from_str(&text).expect("default config is valid TOML");
    assert_eq!(parsed["runner"]["max_workers"].as_integer(), Some(8));
}

// =============================================================================
// mcollect list
// =============================================================================

#[test]
fn contract_list_prints_all_ids_in_definition_order() {
    let (_dir, config) = setup_config();
    mcollect(&config)
        .args(["list", "web"])
        .assert()
        .success()
        .stdout(
            "production/System/LoadAverage\nproduction/Unicorn/Workers\nproduction/Redis/Keys\n",
        );
}

#[test]
fn contract_list_filters_by_role() {
    let (_dir, config) = setup_config();
    mcollect(&config)
        .args(["list", "web", "--roles", "cron"])
        .assert()
        .success()
        .stdout("production/System/LoadAverage\nproduction/Redis/Keys\n");
}

#[test]
fn contract_list_unknown_app_fails_with_remediation() {
    let (_dir, config) = setup_config();
    mcollect(&config)
        .args(["list", "ghost"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Application 'ghost' not found"))
        .stderr(predicate::str::contains("mcollect config"));
}

// =============================================================================
// mcollect publish
// =============================================================================

#[test]
fn contract_publish_constant_metric() {
    let (_dir, config) = setup_config();
    mcollect(&config)
        .args(["publish", "web", "production/System/LoadAverage"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Published: production/System/LoadAverage=0.75 none",
        ));
}

#[test]
fn contract_publish_command_metric() {
    let (_dir, config) = setup_config();
    mcollect(&config)
        .args(["publish", "web", "production/Redis/Keys"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Published: production/Redis/Keys=12 count",
        ));
}

#[test]
fn contract_publish_unknown_metric_fails() {
    let (_dir, config) = setup_config();
    mcollect(&config)
        .args(["publish", "web", "production/Nope/Missing"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("production/Nope/Missing"));
}

// =============================================================================
// mcollect reap
// =============================================================================

#[test]
fn contract_reap_without_stale_instances_reports_zero() {
    let (_dir, config) = setup_config();
    let output = mcollect(&config)
        .args(["reap", "web"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).expect("report is JSON");
    assert_eq!(report["discovered"], 0);
    assert_eq!(report["remaining"], 0);
    assert!(report["errors"].as_array().is_some_and(Vec::is_empty));
}

// =============================================================================
// mcollect run
// =============================================================================

#[test]
fn contract_run_single_iteration_publishes_and_summarizes() {
    let (dir, config) = setup_config();
    let output = mcollect(&config)
        .args([
            "run",
            "web",
            "--iterations",
            "1",
            "--frequency",
            "5",
            "--roles",
            "web",
        ])
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");

    assert!(
        text.contains("Published: production/System/LoadAverage=0.75 none"),
        "{text}"
    );
    assert!(text.contains("Published: production/Unicorn/Workers=4 count"), "{text}");
    assert!(!text.contains("Redis/Keys"), "{text}");

    let summary_start = text.find('{').expect("summary JSON on stdout");
    let summary: serde_json::Value =
        serde_json::from_str(&text[summary_start..]).expect("summary parses");
    assert_eq!(summary["cycles"], 1);
    assert_eq!(summary["peak_workers"], 1);
    assert!(!dir.path().join("run").join("web.pid").exists());
}

#[test]
fn contract_run_rejects_inconsistent_worker_bounds() {
    let (_dir, config) = setup_config();
    mcollect(&config)
        .args(["run", "web", "--workers", "5", "--max-workers", "2"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("min <= initial <= max"));
}

// =============================================================================
// Configuration failures
// =============================================================================

#[test]
fn contract_missing_config_file_fails() {
    let dir = TempDir::new().expect("temp dir");
    let missing = dir.path().join("absent.toml");
    mcollect(&missing.to_string_lossy())
        .args(["list", "web"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("absent.toml"));
}

#[test]
fn contract_malformed_config_fails() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[runner\nfrequency_secs = ").expect("write");
    mcollect(&path.to_string_lossy())
        .args(["list", "web"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Config error"));
}

#[test]
fn contract_invalid_log_level_fails() {
    let (_dir, config) = setup_config();
    mcollect(&config)
        .args(["--log-level", "loud", "list", "web"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("loud"));
}
