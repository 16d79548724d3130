//! Error taxonomy of the benchmark engine.

use thiserror::Error;

use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::sink::SinkError;

/// Result alias used across the benchmark engine.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Top-level error for a benchmark sweep.
///
/// Configuration, dataset and sink failures end a sweep. Backend failures
/// never surface here: they abort the affected cells and are recorded in the
/// cell ledger instead.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Invalid scale/variant/concurrency combination or malformed config file.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    /// Dataset could not be produced or loaded.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// Raw or derived tables could not be persisted.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_labelled() {
        let err = BenchError::from(ConfigError::UnknownScale(500));
        let message = err.to_string();
        assert!(message.starts_with("configuration error: "), "{message}");
        assert!(message.contains("500"), "{message}");
    }
}
