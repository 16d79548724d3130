//! Command-line entry point for the shopbench sweep.
#![forbid(unsafe_code)]

#[path = "shopbench/ui.rs"]
mod ui;

use std::error::Error;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Args, Parser, Subcommand};
use shopbench::aggregate::{aggregate, AnalysisSettings, SummaryRow};
use shopbench::backend::EmbeddedBackends;
use shopbench::catalog;
use shopbench::config::{ConfigError, ConfigFile};
use shopbench::dataset::Dataset;
use shopbench::model::Scale;
use shopbench::sink::{self, CsvSink};
use shopbench::sweep::{build_sampler, RunContext};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use ui::{human_duration, Theme, Ui};

const DEFAULT_LOG_FILTER: &str = "shopbench=info";

#[derive(Parser, Debug)]
#[command(
    name = "shopbench",
    version,
    about = "Relational vs. graph store benchmark over an e-commerce workload",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, help = "Only print essential output")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = Theme::Auto,
        help = "Colour theme for terminal output"
    )]
    theme: Theme,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Also write logs to FILE"
    )]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full scale × variant × concurrency × query sweep.
    Run(RunCmd),
    /// Recompute every derived table from a persisted measurements.csv.
    Analyze(AnalyzeCmd),
    /// List the query catalog.
    Catalog,
    /// Write a dataset tier as ecommerce_<users>.json.
    Generate(GenerateCmd),
}

#[derive(Args, Debug)]
struct RunCmd {
    #[arg(
        long,
        env = "SHOPBENCH_CONFIG",
        value_name = "FILE",
        help = "Config file (defaults to <config dir>/shopbench/bench.toml)"
    )]
    config: Option<PathBuf>,

    #[arg(long, help = "Number of rounds")]
    rounds: Option<u32>,

    #[arg(long = "scale", value_name = "USERS", help = "Scale tier (repeatable)")]
    scales: Vec<u32>,

    #[arg(long = "variant", value_name = "NAME", help = "Variant to run (repeatable)")]
    variants: Vec<String>,

    #[arg(long = "concurrency", value_name = "N", help = "Concurrency level (repeatable)")]
    concurrency: Vec<usize>,

    #[arg(long = "query", value_name = "ID", help = "Catalog entry to run (repeatable)")]
    queries: Vec<u8>,

    #[arg(long, help = "Calls per cell, warm-up included")]
    repetitions: Option<u32>,

    #[arg(long, help = "Leading calls per cell discarded as warm-up")]
    warmups: Option<u32>,

    #[arg(long, help = "Seed for data generation and parameter selection")]
    seed: Option<u64>,

    #[arg(long, value_name = "SECS", help = "Abort a cell after SECS seconds")]
    cell_timeout: Option<u64>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Directory for result files; raw tables of an earlier run there are replaced"
    )]
    out: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory of pre-built datasets")]
    dataset_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory for relational database files")]
    relational_dir: Option<PathBuf>,

    #[arg(long, help = "Disable CPU/memory sampling")]
    no_sampler: bool,
}

#[derive(Args, Debug)]
struct AnalyzeCmd {
    #[arg(value_name = "CSV", help = "Persisted measurements.csv")]
    measurements: PathBuf,

    #[arg(
        long,
        value_name = "CSV",
        help = "Cell ledger (defaults to cells.csv next to the measurements, when present)"
    )]
    cells: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Where to write derived tables (defaults to the CSV's directory)"
    )]
    out: Option<PathBuf>,

    #[arg(long, default_value_t = 0.95, help = "Confidence level of mean intervals")]
    confidence: f64,

    #[arg(long, default_value_t = 0.05, help = "Significance threshold")]
    alpha: f64,
}

#[derive(Args, Debug)]
struct GenerateCmd {
    #[arg(long, value_name = "USERS", help = "Scale tier to generate")]
    scale: u32,

    #[arg(long, value_name = "DIR", default_value = "data", help = "Output directory")]
    out: PathBuf,

    #[arg(long, default_value_t = 1, help = "Generator seed")]
    seed: u64,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log_file.as_deref()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    let ui = Ui::new(cli.theme, cli.quiet);
    if let Err(err) = run(cli.command, &ui) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn run(command: Command, ui: &Ui) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Run(cmd) => run_sweep(cmd, ui),
        Command::Analyze(cmd) => analyze(cmd, ui),
        Command::Catalog => {
            print_catalog(ui);
            Ok(())
        }
        Command::Generate(cmd) => generate(cmd, ui),
    }
}

fn apply_overrides(file: &mut ConfigFile, cmd: RunCmd) {
    let sweep = &mut file.sweep;
    if cmd.rounds.is_some() {
        sweep.rounds = cmd.rounds;
    }
    if !cmd.scales.is_empty() {
        sweep.scales = Some(cmd.scales);
    }
    if !cmd.variants.is_empty() {
        sweep.variants = Some(cmd.variants);
    }
    if !cmd.concurrency.is_empty() {
        sweep.concurrency = Some(cmd.concurrency);
    }
    if !cmd.queries.is_empty() {
        sweep.queries = Some(cmd.queries);
    }
    if cmd.repetitions.is_some() {
        sweep.repetitions = cmd.repetitions;
    }
    if cmd.warmups.is_some() {
        sweep.warmups = cmd.warmups;
    }
    if cmd.seed.is_some() {
        sweep.seed = cmd.seed;
    }
    if cmd.cell_timeout.is_some() {
        sweep.cell_timeout_secs = cmd.cell_timeout;
    }
    if cmd.out.is_some() {
        file.output.dir = cmd.out;
    }
    if cmd.dataset_dir.is_some() {
        file.dataset.dir = cmd.dataset_dir;
    }
    if cmd.relational_dir.is_some() {
        file.relational.dir = cmd.relational_dir;
    }
    if cmd.no_sampler {
        file.sampler.enabled = Some(false);
    }
}

fn run_sweep(cmd: RunCmd, ui: &Ui) -> Result<(), Box<dyn Error>> {
    let mut file = ConfigFile::load(cmd.config.as_deref())?;
    apply_overrides(&mut file, cmd);
    let config = file.validate().map_err(shopbench::BenchError::from)?;

    ui.section(
        "Sweep",
        [
            ("rounds", config.rounds.to_string()),
            (
                "scales",
                join(config.scales.iter().map(|s| s.users().to_string())),
            ),
            ("variants", join(config.variants.iter().map(|v| v.to_string()))),
            (
                "concurrency",
                join(config.concurrency.iter().map(|c| c.to_string())),
            ),
            ("queries", config.queries.len().to_string()),
            (
                "calls/cell",
                format!("{} ({} warm-up)", config.repetitions, config.warmups),
            ),
            ("cells", config.cell_count().to_string()),
            ("output", config.output_dir.display().to_string()),
        ],
    );
    ui.spacer();

    let mut sink = CsvSink::create(&config.output_dir)?;
    let opener = EmbeddedBackends::new(config.relational.clone());
    let mut ctx = RunContext::new(&config, &mut sink, build_sampler(&config.sampler))
        .with_progress(ui.sweep_bar());
    ctx.run(&opener)?;
    let summary = ctx.finish()?;

    ui.section(
        "Result",
        [
            ("cells done", summary.done_cells.to_string()),
            ("cells aborted", summary.aborted_cells.to_string()),
            ("measurements", summary.measurements.to_string()),
            ("failed calls", summary.failed_calls.to_string()),
            ("elapsed", human_duration(summary.elapsed)),
        ],
    );
    print_overall(ui, &summary.report.overall);
    if summary.aborted_cells > 0 {
        ui.warn(&format!(
            "{} cells aborted; see cells.csv",
            summary.aborted_cells
        ));
    }
    ui.success(&format!("results written to {}", config.output_dir.display()));
    Ok(())
}

fn analyze(cmd: AnalyzeCmd, ui: &Ui) -> Result<(), Box<dyn Error>> {
    let settings = AnalysisSettings {
        confidence: cmd.confidence,
        alpha: cmd.alpha,
    };
    for (field, value) in [("confidence", settings.confidence), ("alpha", settings.alpha)] {
        if !(value > 0.0 && value < 1.0) {
            return Err(shopbench::BenchError::from(ConfigError::Probability { field, value }).into());
        }
    }
    let source_dir = cmd
        .measurements
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let out = cmd.out.unwrap_or_else(|| source_dir.clone());
    let cells_path = cmd.cells.or_else(|| {
        let sibling = source_dir.join(sink::CELLS_FILE);
        sibling.exists().then_some(sibling)
    });

    let timer = ui.timed(format!("aggregating {}", cmd.measurements.display()));
    let rows = sink::read_measurements(&cmd.measurements)?;
    let cells = match &cells_path {
        Some(path) => sink::read_cells(path)?,
        None => Vec::new(),
    };
    ui.info(&format!(
        "{} measurements and {} ledger rows loaded",
        rows.len(),
        cells.len()
    ));
    let report = aggregate(&rows, &cells, &settings);
    std::fs::create_dir_all(&out)?;
    sink::write_report_files(&out, &report)?;
    let elapsed = timer.finish();
    info!(rows = rows.len(), out = %out.display(), "re-aggregated measurements");

    print_overall(ui, &report.overall);
    ui.success(&format!(
        "{} rows aggregated in {}; tables written to {}",
        rows.len(),
        human_duration(elapsed),
        out.display()
    ));
    Ok(())
}

fn generate(cmd: GenerateCmd, ui: &Ui) -> Result<(), Box<dyn Error>> {
    let scale = Scale::try_from(cmd.scale)
        .map_err(|_| shopbench::BenchError::from(ConfigError::UnknownScale(cmd.scale)))?;
    let path = cmd.out.join(Dataset::file_name(scale));
    let timer = ui.timed(format!("generating {} users", scale.users()));
    let dataset = Dataset::generate(scale, cmd.seed);
    dataset.save_json(&path)?;
    let elapsed = timer.finish();
    ui.section(
        "Dataset",
        [
            ("users", dataset.users.len()),
            ("products", dataset.products.len()),
            ("orders", dataset.orders.len()),
            ("order items", dataset.order_items.len()),
            ("reviews", dataset.reviews.len()),
        ],
    );
    ui.success(&format!(
        "wrote {} in {}",
        path.display(),
        human_duration(elapsed)
    ));
    Ok(())
}

fn print_catalog(ui: &Ui) {
    let mut rows = vec![vec![
        "id".to_string(),
        "class".to_string(),
        "name".to_string(),
        "params".to_string(),
    ]];
    rows.extend(catalog::entries().iter().map(|def| {
        vec![
            format!("#{}", def.id),
            def.complexity.label().to_string(),
            def.name.to_string(),
            def.params.names().join(" "),
        ]
    }));
    ui.table("Catalog", &rows);
}

fn print_overall(ui: &Ui, overall: &[SummaryRow]) {
    let ms = |value: Option<f64>| value.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
    let mut rows = vec![vec![
        "variant".to_string(),
        "n".to_string(),
        "mean ms".to_string(),
        "p50 ms".to_string(),
        "p99 ms".to_string(),
        "qps".to_string(),
        "failed".to_string(),
        "aborted cells".to_string(),
    ]];
    rows.extend(overall.iter().map(|row| {
        vec![
            row.variant.to_string(),
            row.n.to_string(),
            ms(row.mean_ms),
            ms(row.p50_ms),
            ms(row.p99_ms),
            row.mean_qps.map_or_else(|| "-".to_string(), |v| format!("{v:.1}")),
            row.failed_calls.to_string(),
            row.aborted_cells.to_string(),
        ]
    }));
    ui.spacer();
    ui.table("Overall", &rows);
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(", ")
}
