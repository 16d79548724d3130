#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Once;

use shopbench::backend::EmbeddedBackends;
use shopbench::config::{BenchConfig, ConfigFile};
use shopbench::model::{CallStatus, CellState, Variant};
use shopbench::sink::{self, CsvSink};
use shopbench::sweep::{build_sampler, RunContext};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn config(out: &Path) -> BenchConfig {
    let text = format!(
        r#"
        [sweep]
        rounds = 1
        scales = [1000]
        concurrency = [1, 3]
        queries = [1, 5, 7, 10, 12, 13, 17, 19, 21, 24]
        repetitions = 5
        warmups = 2
        seed = 99

        [sampler]
        interval_ms = 20

        [relational]
        dir = "{rel}"

        [output]
        dir = "{out}"
        "#,
        rel = out.join("db").display(),
        out = out.join("results").display(),
    );
    ConfigFile::parse(&text, Path::new("sweep.toml"))
        .expect("parse")
        .validate()
        .expect("validate")
}

#[test]
fn sweep_persists_every_cell_and_reaggregates_identically() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let config = config(dir.path());
    let mut sink = CsvSink::create(&config.output_dir).expect("sink");
    let mut ctx = RunContext::new(&config, &mut sink, build_sampler(&config.sampler));
    ctx.run(&EmbeddedBackends::new(config.relational.clone()))
        .expect("sweep");
    let summary = ctx.finish().expect("finish");

    let cells = 4 * 2 * 10;
    assert_eq!(config.cell_count(), cells);
    assert_eq!(summary.done_cells, cells);
    assert_eq!(summary.aborted_cells, 0);
    assert_eq!(summary.failed_calls, 0);
    assert_eq!(summary.measurements, cells * 3);

    let out = &config.output_dir;
    let rows = sink::read_measurements(&out.join(sink::MEASUREMENTS_FILE)).expect("read");
    assert_eq!(rows.len(), cells * 3);
    let mut per_cell = BTreeMap::new();
    for row in &rows {
        assert_eq!(row.status, CallStatus::Ok);
        assert_eq!(row.cell_state, CellState::Done);
        assert!(row.duration_ms.is_some_and(|ms| ms >= 0.0));
        assert!(row.qps.is_some_and(|qps| qps > 0.0));
        assert!((1..=3).contains(&row.repetition));
        *per_cell.entry(row.cell()).or_insert(0) += 1;
    }
    assert_eq!(per_cell.len(), cells);
    assert!(per_cell.values().all(|&n| n == 3));

    let ledger = fs::read_to_string(out.join(sink::CELLS_FILE)).expect("cells");
    assert_eq!(ledger.lines().count(), cells + 1);

    assert_eq!(summary.report.overall.len(), Variant::ALL.len());
    assert!(summary
        .report
        .overall
        .iter()
        .all(|row| row.n == 2 * 10 * 3));
    assert_eq!(summary.report.by_query.len(), cells);
    // 4 variants → 12 ordered pairs per query and level
    assert_eq!(summary.report.significance_by_query.len(), 2 * 10 * 12);

    let again = dir.path().join("again");
    fs::create_dir_all(&again).expect("mkdir");
    let cells = sink::read_cells(&out.join(sink::CELLS_FILE)).expect("read cells");
    let report = shopbench::aggregate::aggregate(&rows, &cells, &config.analysis);
    sink::write_report_files(&again, &report).expect("write");
    for name in [
        "by_query.csv",
        "by_complexity.csv",
        "by_constellation.csv",
        "overall.csv",
        "significance_by_query.csv",
        "significance_by_complexity.csv",
        "significance_by_constellation.csv",
        sink::REPORT_FILE,
    ] {
        assert_eq!(
            fs::read(out.join(name)).expect(name),
            fs::read(again.join(name)).expect(name),
            "{name} differs after re-aggregation"
        );
    }
    assert!(out.join(sink::ENV_FILE).exists());
}

#[test]
fn single_variant_sweep_without_sampler() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let mut file = ConfigFile::default();
    file.sweep.rounds = Some(1);
    file.sweep.scales = Some(vec![1000]);
    file.sweep.variants = Some(vec!["graph_normal".into()]);
    file.sweep.concurrency = Some(vec![1]);
    file.sweep.queries = Some(vec![2, 3]);
    file.sweep.repetitions = Some(3);
    file.sweep.warmups = Some(1);
    file.sampler.enabled = Some(false);
    file.output.dir = Some(dir.path().to_path_buf());
    let config = file.validate().expect("validate");

    let mut sink = CsvSink::create(&config.output_dir).expect("sink");
    let mut ctx = RunContext::new(&config, &mut sink, build_sampler(&config.sampler));
    ctx.run(&EmbeddedBackends::default()).expect("sweep");
    assert_eq!(ctx.cells().len(), 2);
    assert!(ctx.cells().iter().all(|c| c.measured_rows == 2));
    let summary = ctx.finish().expect("finish");
    assert_eq!(summary.done_cells, 2);
}
