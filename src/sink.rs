//! Persistence of raw measurements and derived tables.
//!
//! Raw rows are appended and flushed as each cell finishes so a crashed sweep
//! leaves every completed cell on disk. A sink truncates the raw tables when
//! it is created: one output directory holds exactly one sweep, and the
//! derived tables next to it always describe the rows on disk. Derived tables
//! are rewritten wholesale through a temp file and an atomic rename after
//! every aggregation pass.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::aggregate::AggregateReport;
use crate::env::RunEnvironment;
use crate::model::{CellRecord, Measurement};

/// Raw measurement table.
pub const MEASUREMENTS_FILE: &str = "measurements.csv";
/// Cell ledger.
pub const CELLS_FILE: &str = "cells.csv";
/// All derived tables as one JSON document.
pub const REPORT_FILE: &str = "report.json";
/// Run environment.
pub const ENV_FILE: &str = "env.json";

/// Failure while persisting results.
#[derive(Debug, Error)]
pub enum SinkError {
    /// A file could not be created, written or renamed.
    #[error("result file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// CSV encoding or decoding failed.
    #[error("csv error in {path}: {source}")]
    Csv {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: csv::Error,
    },
    /// JSON encoding failed.
    #[error("json error in {path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// Destination for sweep results.
pub trait ResultSink {
    /// Appends the rows of one finished cell.
    fn append_measurements(&mut self, rows: &[Measurement]) -> Result<(), SinkError>;
    /// Appends one cell ledger row.
    fn record_cell(&mut self, cell: &CellRecord) -> Result<(), SinkError>;
    /// Replaces every derived table.
    fn write_report(&mut self, report: &AggregateReport) -> Result<(), SinkError>;
    /// Stores the run environment.
    fn write_environment(&mut self, env: &RunEnvironment) -> Result<(), SinkError>;
}

/// CSV/JSON files under one output directory.
pub struct CsvSink {
    dir: PathBuf,
    measurements: csv::Writer<File>,
    cells: csv::Writer<File>,
}

impl CsvSink {
    /// Starts empty raw tables under `dir`, replacing those of an earlier sweep.
    pub fn create(dir: &Path) -> Result<Self, SinkError> {
        fs::create_dir_all(dir).map_err(|source| SinkError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let replaced = dir.join(MEASUREMENTS_FILE).exists();
        let sink = Self {
            dir: dir.to_path_buf(),
            measurements: fresh_writer(&dir.join(MEASUREMENTS_FILE))?,
            cells: fresh_writer(&dir.join(CELLS_FILE))?,
        };
        if replaced {
            warn!(dir = %dir.display(), "replacing results of a previous sweep");
        }
        Ok(sink)
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn fresh_writer(path: &Path) -> Result<csv::Writer<File>, SinkError> {
    let file = File::create(path).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::Writer::from_writer(file))
}

fn append_rows<T: Serialize>(
    writer: &mut csv::Writer<File>,
    path: PathBuf,
    rows: &[T],
) -> Result<(), SinkError> {
    for row in rows {
        writer.serialize(row).map_err(|source| SinkError::Csv {
            path: path.clone(),
            source,
        })?;
    }
    writer.flush().map_err(|source| SinkError::Io { path, source })
}

/// Writes `rows` to `dir/name` through a temp file and a rename.
pub fn write_table<T: Serialize>(dir: &Path, name: &str, rows: &[T]) -> Result<(), SinkError> {
    let path = dir.join(name);
    let tmp = dir.join(format!(".{name}.tmp"));
    let mut writer = csv::Writer::from_path(&tmp).map_err(|source| SinkError::Csv {
        path: tmp.clone(),
        source,
    })?;
    for row in rows {
        writer.serialize(row).map_err(|source| SinkError::Csv {
            path: tmp.clone(),
            source,
        })?;
    }
    writer.flush().map_err(|source| SinkError::Io {
        path: tmp.clone(),
        source,
    })?;
    drop(writer);
    fs::rename(&tmp, &path).map_err(|source| SinkError::Io { path, source })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SinkError> {
    let tmp = path.with_extension("json.tmp");
    let file = File::create(&tmp).map_err(|source| SinkError::Io {
        path: tmp.clone(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, value).map_err(|source| SinkError::Json {
        path: tmp.clone(),
        source,
    })?;
    out.write_all(b"\n")
        .and_then(|_| out.flush())
        .map_err(|source| SinkError::Io {
            path: tmp.clone(),
            source,
        })?;
    drop(out);
    fs::rename(&tmp, path).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes every derived table of `report` into `dir`.
pub fn write_report_files(dir: &Path, report: &AggregateReport) -> Result<(), SinkError> {
    write_table(dir, "by_query.csv", &report.by_query)?;
    write_table(dir, "by_complexity.csv", &report.by_complexity)?;
    write_table(dir, "by_constellation.csv", &report.by_constellation)?;
    write_table(dir, "overall.csv", &report.overall)?;
    write_table(dir, "significance_by_query.csv", &report.significance_by_query)?;
    write_table(
        dir,
        "significance_by_complexity.csv",
        &report.significance_by_complexity,
    )?;
    write_table(
        dir,
        "significance_by_constellation.csv",
        &report.significance_by_constellation,
    )?;
    write_json(&dir.join(REPORT_FILE), report)
}

impl ResultSink for CsvSink {
    fn append_measurements(&mut self, rows: &[Measurement]) -> Result<(), SinkError> {
        append_rows(&mut self.measurements, self.dir.join(MEASUREMENTS_FILE), rows)
    }

    fn record_cell(&mut self, cell: &CellRecord) -> Result<(), SinkError> {
        append_rows(
            &mut self.cells,
            self.dir.join(CELLS_FILE),
            std::slice::from_ref(cell),
        )
    }

    fn write_report(&mut self, report: &AggregateReport) -> Result<(), SinkError> {
        write_report_files(&self.dir, report)
    }

    fn write_environment(&mut self, env: &RunEnvironment) -> Result<(), SinkError> {
        write_json(&self.dir.join(ENV_FILE), env)
    }
}

/// Reads a persisted measurement table.
pub fn read_measurements(path: &Path) -> Result<Vec<Measurement>, SinkError> {
    read_table(path)
}

/// Reads a persisted cell ledger.
pub fn read_cells(path: &Path) -> Result<Vec<CellRecord>, SinkError> {
    read_table(path)
}

fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, SinkError> {
    let csv_err = |source| SinkError::Csv {
        path: path.to_path_buf(),
        source,
    };
    csv::Reader::from_path(path)
        .map_err(csv_err)?
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(csv_err)
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Appended measurement rows.
    pub measurements: Vec<Measurement>,
    /// Appended cell ledger rows.
    pub cells: Vec<CellRecord>,
    /// Last written report.
    pub report: Option<AggregateReport>,
    /// Number of reports written.
    pub reports_written: usize,
    /// Stored environment.
    pub environment: Option<RunEnvironment>,
}

impl ResultSink for MemorySink {
    fn append_measurements(&mut self, rows: &[Measurement]) -> Result<(), SinkError> {
        self.measurements.extend_from_slice(rows);
        Ok(())
    }

    fn record_cell(&mut self, cell: &CellRecord) -> Result<(), SinkError> {
        self.cells.push(cell.clone());
        Ok(())
    }

    fn write_report(&mut self, report: &AggregateReport) -> Result<(), SinkError> {
        self.report = Some(report.clone());
        self.reports_written += 1;
        Ok(())
    }

    fn write_environment(&mut self, env: &RunEnvironment) -> Result<(), SinkError> {
        self.environment = Some(env.clone());
        Ok(())
    }
}
