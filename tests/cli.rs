mod fixture;

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn slimstage() -> Command {
    Command::cargo_bin("slimstage").expect("binary present")
}

#[test]
fn build_verify_and_inspect() {
    let ws = fixture::workspace();

    slimstage()
        .arg("build")
        .arg(ws.recipe_path())
        .assert()
        .success()
        .stdout(predicate::str::starts_with("sha256:"));

    slimstage()
        .arg("verify")
        .arg(ws.output())
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));

    slimstage()
        .arg("inspect")
        .arg(ws.output())
        .assert()
        .success()
        .stdout(predicate::str::contains("/app/main.py"))
        .stdout(predicate::str::contains("10001:10001"));
}

#[test]
fn build_writes_metrics_on_request() {
    let ws = fixture::workspace();
    let prom = ws.root().join("metrics/build.prom");
    let json = ws.root().join("metrics/build.json");

    slimstage()
        .arg("build")
        .arg(ws.recipe_path())
        .arg("--metrics-prometheus")
        .arg(&prom)
        .arg("--metrics-json")
        .arg(&json)
        .assert()
        .success();

    let text = fs::read_to_string(&prom).unwrap();
    assert!(text.contains("slimstage_stage_calls_total{stage=\"resolve\"} 1"));
    assert!(text.contains("slimstage_builds_succeeded_total 1"));
    let snapshot: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(snapshot["stages"]["assemble"]["calls"], 1);
}

#[test]
fn dry_run_builds_nothing() {
    let ws = fixture::workspace();
    slimstage()
        .args(["build", "--dry-run"])
        .arg(ws.recipe_path())
        .assert()
        .success();
    assert!(!ws.output().exists());
}

#[test]
fn failed_build_exits_non_zero_without_output() {
    let ws = fixture::workspace();
    fs::remove_file(ws.root().join("app/main.py")).unwrap();

    slimstage()
        .arg("build")
        .arg(ws.recipe_path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("entry point"));
    assert!(!ws.output().exists());
    assert!(!ws.partial().exists());
}

#[test]
fn invalid_unbuffered_override_is_a_configuration_error() {
    let ws = fixture::workspace();
    slimstage()
        .env("SLIMSTAGE_UNBUFFERED", "sometimes")
        .arg("build")
        .arg(ws.recipe_path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("SLIMSTAGE_UNBUFFERED"));
}

#[test]
fn unbuffered_override_reaches_the_runtime_config() {
    let ws = fixture::workspace();
    slimstage()
        .env("SLIMSTAGE_UNBUFFERED", "off")
        .arg("build")
        .arg(ws.recipe_path())
        .assert()
        .success();
    slimstage()
        .arg("inspect")
        .arg(ws.output())
        .assert()
        .success()
        .stdout(predicate::str::contains("PYTHONUNBUFFERED").not());
}

#[test]
fn validate_reports_privileged_identity() {
    let ws = fixture::workspace();
    let yaml = ws
        .recipe_yaml()
        .replace("uid: 10001, gid: 10001", "uid: 0, gid: 0");
    let recipe = ws.write_recipe(&yaml);

    slimstage()
        .arg("validate")
        .arg(&recipe)
        .assert()
        .failure()
        .stderr(predicate::str::contains("privileged"));
}

#[test]
fn validate_accepts_the_fixture() {
    let ws = fixture::workspace();
    slimstage()
        .arg("validate")
        .arg(ws.recipe_path())
        .assert()
        .success();
}

#[test]
fn lock_then_build_locked() {
    let ws = fixture::workspace();
    let lock = ws.root().join("locks/slimstage.lock");

    slimstage()
        .arg("lock")
        .arg(ws.recipe_path())
        .arg(&lock)
        .assert()
        .success();
    let content = fs::read_to_string(&lock).unwrap();
    assert!(content.contains("requests"));
    assert!(content.contains("2.31.0"));

    slimstage()
        .arg("build")
        .arg(ws.recipe_path())
        .arg("--locked")
        .arg(&lock)
        .assert()
        .success();

    let yaml = ws.recipe_yaml().replace("\"3.11.9\"", "\"3.12.1\"");
    let recipe = ws.write_recipe(&yaml);
    slimstage()
        .arg("build")
        .arg(&recipe)
        .arg("--locked")
        .arg(&lock)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Lockfile was generated for"));
}

#[test]
fn recipe_new_and_lint() {
    let ws = fixture::workspace();
    for preset in ["python", "batch"] {
        let path = ws.root().join(format!("recipes/{preset}.yaml"));
        slimstage()
            .args(["recipe", "new", "--preset", preset, "--output"])
            .arg(&path)
            .assert()
            .success();
        slimstage()
            .args(["recipe", "lint"])
            .arg(&path)
            .assert()
            .success();
    }

    slimstage()
        .args(["recipe", "new", "--preset", "desktop", "--output"])
        .arg(ws.root().join("desktop.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown preset"));
}

#[test]
fn security_commands() {
    let ws = fixture::workspace();
    slimstage()
        .arg("build")
        .arg(ws.recipe_path())
        .assert()
        .success();

    let bom = ws.root().join("sbom/bom.json");
    slimstage()
        .args(["security", "sbom", "--artifact"])
        .arg(ws.output())
        .arg("--output")
        .arg(&bom)
        .assert()
        .success();
    let content = fs::read_to_string(&bom).unwrap();
    assert!(content.contains("pkg:pypi/urllib3@2.0.7"));

    let digest_file = ws.root().join("layer.sha256");
    slimstage()
        .args(["security", "digest", "--path"])
        .arg(ws.output().join("layer.tar"))
        .arg("--output")
        .arg(&digest_file)
        .assert()
        .success()
        .stdout(predicate::str::is_match("^[0-9a-f]{64}  ").unwrap());
    assert!(digest_file.is_file());
}

#[test]
fn completions_are_generated() {
    slimstage()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("slimstage"));
}
