#![allow(missing_docs)]

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use csv::ReaderBuilder;
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn catalog_lists_all_entries() {
    let output = cargo_bin_cmd!("shopbench")
        .args(["--theme", "plain", "catalog"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("cross-selling"));
    assert!(text.contains("delete oldest address"));
    assert!(text.contains(":review_pivot"));
    let entries = text
        .lines()
        .filter(|line| line.trim_start().starts_with('#'))
        .count();
    assert_eq!(entries, 24);
}

#[test]
fn invalid_scale_fails_before_any_cell() {
    let dir = TempDir::new().expect("tempdir");
    let out = dir.path().join("results");
    let assert = cargo_bin_cmd!("shopbench")
        .env("SHOPBENCH_CONFIG", dir.path().join("missing.toml"))
        .args(["--quiet", "run", "--scale", "500", "--out"])
        .arg(&out)
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    // an explicit config path that does not exist is itself fatal
    assert!(stderr.contains("missing.toml"), "{stderr}");

    let config = dir.path().join("bench.toml");
    fs::write(&config, "[sweep]\nrounds = 1\n").expect("write config");
    let assert = cargo_bin_cmd!("shopbench")
        .args(["--quiet", "run", "--scale", "500", "--config"])
        .arg(&config)
        .arg("--out")
        .arg(&out)
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("configuration error"), "{stderr}");
    assert!(!out.join("measurements.csv").exists());
}

#[test]
fn run_then_analyze_round_trips() {
    let dir = TempDir::new().expect("tempdir");
    let out = dir.path().join("results");
    let config = dir.path().join("bench.toml");
    fs::write(
        &config,
        "[sweep]\nrounds = 1\n\n[sampler]\nenabled = false\n",
    )
    .expect("write config");

    cargo_bin_cmd!("shopbench")
        .args(["--quiet", "run", "--config"])
        .arg(&config)
        .args([
            "--scale",
            "1000",
            "--variant",
            "relational_optimized",
            "--variant",
            "graph_optimized",
            "--concurrency",
            "1",
            "--query",
            "2",
            "--query",
            "11",
            "--repetitions",
            "4",
            "--warmups",
            "1",
            "--out",
        ])
        .arg(&out)
        .assert()
        .success();

    let mut reader = ReaderBuilder::new()
        .from_path(out.join("measurements.csv"))
        .expect("measurements");
    assert_eq!(reader.records().count(), 2 * 2 * 3);

    let env: Value =
        serde_json::from_str(&fs::read_to_string(out.join("env.json")).expect("env"))
            .expect("json");
    assert!(env["cpu_logical_cores"].as_u64().is_some_and(|n| n >= 1));

    let first = fs::read(out.join("by_query.csv")).expect("by_query");
    let again = dir.path().join("again");
    cargo_bin_cmd!("shopbench")
        .args(["--quiet", "analyze"])
        .arg(out.join("measurements.csv"))
        .arg("--out")
        .arg(&again)
        .assert()
        .success();
    assert_eq!(first, fs::read(again.join("by_query.csv")).expect("again"));

    let mut overall = ReaderBuilder::new()
        .from_path(again.join("overall.csv"))
        .expect("overall");
    let headers = overall.headers().expect("headers").clone();
    assert_eq!(&headers[0], "scale");
    let rows: Vec<_> = overall.records().map(|r| r.expect("row")).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| &row[0] == "ALL" && &row[4] == "6"));
}

#[test]
fn second_run_replaces_the_first() {
    let dir = TempDir::new().expect("tempdir");
    let out = dir.path().join("results");
    let config = dir.path().join("bench.toml");
    fs::write(
        &config,
        "[sweep]\nrounds = 1\nscales = [1000]\nvariants = [\"graph_normal\"]\n\
         concurrency = [1]\nqueries = [3, 4]\nrepetitions = 4\nwarmups = 1\n\n\
         [sampler]\nenabled = false\n",
    )
    .expect("write config");

    for _ in 0..2 {
        cargo_bin_cmd!("shopbench")
            .args(["--quiet", "run", "--config"])
            .arg(&config)
            .arg("--out")
            .arg(&out)
            .assert()
            .success();
    }

    let measurements = ReaderBuilder::new()
        .from_path(out.join("measurements.csv"))
        .expect("measurements")
        .records()
        .count();
    assert_eq!(measurements, 2 * 3);
    let ledger = ReaderBuilder::new()
        .from_path(out.join("cells.csv"))
        .expect("cells")
        .records()
        .count();
    assert_eq!(ledger, 2);

    let mut overall = ReaderBuilder::new()
        .from_path(out.join("overall.csv"))
        .expect("overall");
    let rows: Vec<_> = overall.records().map(|r| r.expect("row")).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][4], "6");
}

#[test]
fn generate_writes_a_loadable_dataset() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("shopbench")
        .args(["--quiet", "generate", "--scale", "1000", "--seed", "3", "--out"])
        .arg(dir.path())
        .assert()
        .success();
    let path = dir.path().join("ecommerce_1000.json");
    let dataset = shopbench::dataset::Dataset::load_json(&path).expect("load");
    assert_eq!(dataset.user_count(), 1000);
}
