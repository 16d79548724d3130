//! The full benchmark sweep.
//!
//! A [`RunContext`] is created per sweep and owns everything the cells share:
//! the validated configuration, the resource sampler, the sink and the rows
//! collected so far. [`RunContext::run`] walks rounds × scales × variants ×
//! concurrency × queries; [`RunContext::finish`] runs the final aggregation
//! and tears the context down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use parking_lot::Mutex;
use tracing::{info, info_span, warn};

use crate::aggregate::{aggregate, AggregateReport};
use crate::backend::{Backend, BackendError, BackendOpener};
use crate::catalog;
use crate::config::{BenchConfig, SamplerConfig};
use crate::dataset::Dataset;
use crate::env::RunEnvironment;
use crate::error::Result;
use crate::executor::{run_cell, AbortReason, CellReport, CellSpec};
use crate::model::{CellKey, CellRecord, CellState, Measurement, Scale, Variant};
use crate::sampler::{ProcessProbe, ResourceSampler};
use crate::sink::ResultSink;

/// Builds the sampler described by `config`.
pub fn build_sampler(config: &SamplerConfig) -> ResourceSampler {
    if !config.enabled {
        return ResourceSampler::disabled();
    }
    let probe = match config.pid {
        Some(pid) => Some(ProcessProbe::for_pid(pid)),
        None => ProcessProbe::current(),
    };
    match probe {
        Some(probe) => ResourceSampler::new(Arc::new(Mutex::new(probe)), config.interval),
        None => {
            warn!("current process id unavailable; resource sampling disabled");
            ResourceSampler::disabled()
        }
    }
}

/// What a finished sweep produced.
#[derive(Debug)]
pub struct SweepSummary {
    /// Cells that ran to completion.
    pub done_cells: usize,
    /// Cells that were aborted or never started.
    pub aborted_cells: usize,
    /// Measurement rows persisted.
    pub measurements: usize,
    /// Measured calls that raised a query error.
    pub failed_calls: usize,
    /// Final aggregation pass.
    pub report: AggregateReport,
    /// Wall-clock of the sweep.
    pub elapsed: Duration,
}

/// State threaded through one sweep.
pub struct RunContext<'a> {
    config: &'a BenchConfig,
    sink: &'a mut dyn ResultSink,
    sampler: ResourceSampler,
    progress: Option<ProgressBar>,
    measurements: Vec<Measurement>,
    cells: Vec<CellRecord>,
    started: Instant,
}

impl<'a> RunContext<'a> {
    /// Context writing to `sink`.
    pub fn new(
        config: &'a BenchConfig,
        sink: &'a mut dyn ResultSink,
        sampler: ResourceSampler,
    ) -> Self {
        Self {
            config,
            sink,
            sampler,
            progress: None,
            measurements: Vec::new(),
            cells: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Advances `bar` by one per finished cell.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        bar.set_length(self.config.cell_count() as u64);
        self.progress = Some(bar);
        self
    }

    /// Rows collected so far.
    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Ledger rows collected so far.
    pub fn cells(&self) -> &[CellRecord] {
        &self.cells
    }

    /// Runs every round. Only sink and dataset failures stop the sweep.
    pub fn run(&mut self, opener: &dyn BackendOpener) -> Result<()> {
        let config = self.config;
        info!(
            rounds = config.rounds,
            scales = config.scales.len(),
            variants = config.variants.len(),
            cells = config.cell_count(),
            "starting sweep"
        );
        for round in 1..=config.rounds {
            for &scale in &config.scales {
                let span = info_span!("setup", round, users = scale.users());
                let _enter = span.enter();
                let dataset = Dataset::load_or_generate(
                    config.dataset_dir.as_deref(),
                    scale,
                    config.seed.wrapping_add(u64::from(round)),
                )?;
                for &variant in &config.variants {
                    self.run_variant(opener, round, scale, variant, &dataset)?;
                }
            }
            self.write_report()?;
        }
        Ok(())
    }

    fn run_variant(
        &mut self,
        opener: &dyn BackendOpener,
        round: u32,
        scale: Scale,
        variant: Variant,
        dataset: &Dataset,
    ) -> Result<()> {
        let backend = match opener
            .open(variant, dataset)
            .and_then(|backend| backend.connect().map(|()| backend))
        {
            Ok(backend) => backend,
            Err(err) => {
                warn!(round, users = scale.users(), %variant, error = %err, "backend setup failed");
                return self.skip_variant(round, scale, variant, &err);
            }
        };
        let bounds = dataset.bounds();
        let result = self.run_cells(backend.as_ref(), round, scale, variant, bounds);
        backend.close();
        result
    }

    fn run_cells(
        &mut self,
        backend: &dyn Backend,
        round: u32,
        scale: Scale,
        variant: Variant,
        bounds: catalog::ParamBounds,
    ) -> Result<()> {
        let config = self.config;
        for &concurrency in &config.concurrency {
            for &query_id in &config.queries {
                let spec = CellSpec {
                    key: CellKey {
                        round,
                        scale,
                        variant,
                        concurrency,
                        query_id,
                    },
                    query: catalog::lookup(query_id),
                    repetitions: config.repetitions,
                    warmups: config.warmups,
                    seed: config.seed,
                    bounds,
                    timeout: config.cell_timeout,
                };
                let report = run_cell(backend, &spec, &self.sampler);
                self.record(report)?;
            }
        }
        Ok(())
    }

    fn skip_variant(
        &mut self,
        round: u32,
        scale: Scale,
        variant: Variant,
        err: &BackendError,
    ) -> Result<()> {
        let config = self.config;
        for &concurrency in &config.concurrency {
            for &query_id in &config.queries {
                let key = CellKey {
                    round,
                    scale,
                    variant,
                    concurrency,
                    query_id,
                };
                let reason = AbortReason::BackendUnavailable(err.to_string());
                self.record(CellReport::not_started(key, reason))?;
            }
        }
        Ok(())
    }

    fn record(&mut self, report: CellReport) -> Result<()> {
        log_cell(&report);
        let ledger = report.record();
        self.sink.append_measurements(&report.measurements)?;
        self.sink.record_cell(&ledger)?;
        self.measurements.extend(report.measurements);
        self.cells.push(ledger);
        if let Some(bar) = &self.progress {
            bar.set_message(report.key.to_string());
            bar.inc(1);
        }
        Ok(())
    }

    fn write_report(&mut self) -> Result<AggregateReport> {
        let report = aggregate(&self.measurements, &self.cells, &self.config.analysis);
        self.sink.write_report(&report)?;
        Ok(report)
    }

    /// Final aggregation pass plus environment capture.
    pub fn finish(mut self) -> Result<SweepSummary> {
        let report = self.write_report()?;
        self.sink
            .write_environment(&RunEnvironment::collect(&self.config.output_dir))?;
        if let Some(bar) = self.progress.take() {
            bar.finish_and_clear();
        }
        let done_cells = self
            .cells
            .iter()
            .filter(|cell| cell.state == CellState::Done)
            .count();
        let summary = SweepSummary {
            done_cells,
            aborted_cells: self.cells.len() - done_cells,
            measurements: self.measurements.len(),
            failed_calls: self.cells.iter().map(|cell| cell.failed_calls).sum(),
            report,
            elapsed: self.started.elapsed(),
        };
        info!(
            cells = self.cells.len(),
            aborted = summary.aborted_cells,
            rows = summary.measurements,
            elapsed_s = summary.elapsed.as_secs_f64(),
            "sweep finished"
        );
        Ok(summary)
    }
}

fn log_cell(report: &CellReport) {
    let latencies: Vec<f64> = report
        .measurements
        .iter()
        .filter_map(Measurement::latency_ms)
        .collect();
    let mean_ms = crate::stats::mean(&latencies).unwrap_or(0.0);
    let qps = report
        .measurements
        .first()
        .and_then(|row| row.qps)
        .unwrap_or(0.0);
    match (&report.state, &report.abort_reason) {
        (CellState::Aborted, Some(reason)) => warn!(
            cell = %report.key,
            rows = report.measurements.len(),
            %reason,
            "cell aborted"
        ),
        _ => info!(
            cell = %report.key,
            rows = report.measurements.len(),
            failed = report.failed_calls,
            mean_ms = format_args!("{mean_ms:.3}"),
            qps = format_args!("{qps:.1}"),
            cpu = ?report.resources.cpu_percent,
            mem_mb = ?report.resources.memory_mb,
            "cell finished"
        ),
    }
    if report.failed_calls > 0 {
        warn!(cell = %report.key, failed = report.failed_calls, "query errors recorded");
    }
}
