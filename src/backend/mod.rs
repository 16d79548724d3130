//! Uniform capability over the two database engines under test.
//!
//! A backend exposes `connect`, `execute` and `close` and nothing else. The
//! executor never inspects which engine it drives; both schema flavours are a
//! parameter of the same adapter.

pub mod graph;
pub mod relational;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::{QueryDefinition, QueryParams};
use crate::dataset::Dataset;
use crate::model::{BackendKind, Variant};

pub use graph::GraphBackend;
pub use relational::RelationalBackend;

/// Failure surfaced by a backend call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A connection could not be acquired; fatal for the enclosing cell.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The statement raised an error; recorded as a failed call.
    #[error("query execution failed: {0}")]
    QueryExecution(String),
}

impl BackendError {
    /// True for connection-level failures.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// What a statement produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResultSummary {
    /// Rows fetched, or rows affected for writes.
    pub rows: usize,
}

/// One completed call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Execution {
    /// What the statement produced.
    pub summary: ResultSummary,
    /// Time spent executing and draining the result.
    pub elapsed: Duration,
}

impl Execution {
    /// Elapsed time in fractional milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1_000.0
    }
}

/// A database under test.
pub trait Backend: Send + Sync {
    /// Makes the backend usable, verifying a connection can be acquired.
    fn connect(&self) -> Result<(), BackendError>;

    /// Runs one catalog entry with bound parameters.
    fn execute(
        &self,
        query: &QueryDefinition,
        params: &QueryParams,
    ) -> Result<Execution, BackendError>;

    /// Releases pooled resources. Later calls fail with `Unavailable`.
    fn close(&self);
}

/// Produces a loaded backend for a variant.
pub trait BackendOpener {
    /// Builds and seeds the backend for `variant` from `dataset`.
    fn open(&self, variant: Variant, dataset: &Dataset) -> Result<Box<dyn Backend>, BackendError>;
}

/// Settings for the embedded relational engine.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationalOptions {
    /// Directory for database files; a temp dir when unset.
    pub dir: Option<PathBuf>,
    /// Upper bound on pooled connections.
    pub pool_size: usize,
    /// Per-connection busy timeout.
    pub busy_timeout: Duration,
}

impl Default for RelationalOptions {
    fn default() -> Self {
        Self {
            dir: None,
            pool_size: 10,
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Opens the in-process relational and graph engines.
#[derive(Clone, Debug, Default)]
pub struct EmbeddedBackends {
    relational: RelationalOptions,
}

impl EmbeddedBackends {
    /// Opener with the given relational settings.
    pub fn new(relational: RelationalOptions) -> Self {
        Self { relational }
    }
}

impl BackendOpener for EmbeddedBackends {
    fn open(&self, variant: Variant, dataset: &Dataset) -> Result<Box<dyn Backend>, BackendError> {
        match variant.backend() {
            BackendKind::Relational => Ok(Box::new(RelationalBackend::create(
                variant,
                dataset,
                &self.relational,
            )?)),
            BackendKind::Graph => Ok(Box::new(GraphBackend::load(variant.schema(), dataset))),
        }
    }
}
