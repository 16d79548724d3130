//! Sweep configuration: TOML file, CLI overrides, validation.
//!
//! [`ConfigFile`] mirrors the file with every field optional. The CLI loads
//! it, patches in its flags, then [`ConfigFile::validate`] produces the typed
//! [`BenchConfig`] or the first [`ConfigError`]. Nothing runs before that
//! succeeds.

use std::collections::HashSet;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::AnalysisSettings;
use crate::backend::RelationalOptions;
use crate::model::{QueryId, Scale, Variant, CONCURRENCY_LEVELS};

const DEFAULT_ROUNDS: u32 = 5;
const DEFAULT_REPETITIONS: u32 = 20;
const DEFAULT_WARMUPS: u32 = 10;
const DEFAULT_SEED: u64 = 0x5eed_0f_5b0b;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 250;
const SAMPLE_INTERVAL_RANGE_MS: (u64, u64) = (10, 10_000);
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OUTPUT_DIR: &str = "results";

/// Configuration problem found before the sweep starts.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unsupported scale {0}; expected one of 1000, 10000, 100000")]
    UnknownScale(u32),
    #[error("unknown variant '{0}'")]
    UnknownVariant(String),
    #[error("query id {0} is outside 1..=24")]
    UnknownQuery(u8),
    #[error("unsupported concurrency {0}; expected one of 1, 3, 5, 10")]
    UnsupportedConcurrency(usize),
    #[error("`{field}` must not be empty")]
    Empty { field: &'static str },
    #[error("`{field}` lists {value} more than once")]
    Duplicate { field: &'static str, value: String },
    #[error("warmups ({warmups}) must be below repetitions ({repetitions})")]
    WarmupsExceedRepetitions { warmups: u32, repetitions: u32 },
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
    #[error("sampler interval {0}ms is outside 10..=10000ms")]
    SamplerInterval(u64),
    #[error("`{field}` must lie strictly between 0 and 1, got {value}")]
    Probability { field: &'static str, value: f64 },
    #[error(
        "{deletes} delete calls per variant would drain the {users}-user tier; lower repetitions"
    )]
    DeleteCapacity { deletes: u64, users: u32 },
}

/// On-disk configuration; every field falls back to a default.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct ConfigFile {
    pub sweep: SweepSection,
    pub sampler: SamplerSection,
    pub relational: RelationalSection,
    pub dataset: DatasetSection,
    pub analysis: AnalysisSection,
    pub output: OutputSection,
}

/// `[sweep]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct SweepSection {
    pub rounds: Option<u32>,
    pub scales: Option<Vec<u32>>,
    pub variants: Option<Vec<String>>,
    pub concurrency: Option<Vec<usize>>,
    pub queries: Option<Vec<u8>>,
    pub repetitions: Option<u32>,
    pub warmups: Option<u32>,
    pub seed: Option<u64>,
    pub cell_timeout_secs: Option<u64>,
}

/// `[sampler]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct SamplerSection {
    pub enabled: Option<bool>,
    pub interval_ms: Option<u64>,
    pub pid: Option<u32>,
}

/// `[relational]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct RelationalSection {
    pub dir: Option<PathBuf>,
    pub max_connections: Option<usize>,
    pub busy_timeout_ms: Option<u64>,
}

/// `[dataset]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct DatasetSection {
    pub dir: Option<PathBuf>,
}

/// `[analysis]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct AnalysisSection {
    pub confidence: Option<f64>,
    pub alpha: Option<f64>,
}

/// `[output]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct OutputSection {
    pub dir: Option<PathBuf>,
}

impl ConfigFile {
    /// Reads `explicit`, or the default location when it exists, or nothing.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => read_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => read_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parses TOML text.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Resolves defaults and checks every constraint.
    pub fn validate(&self) -> Result<BenchConfig, ConfigError> {
        let sweep = &self.sweep;

        let rounds = sweep.rounds.unwrap_or(DEFAULT_ROUNDS);
        if rounds == 0 {
            return Err(ConfigError::Zero { field: "rounds" });
        }

        let scales = match &sweep.scales {
            Some(users) => users
                .iter()
                .map(|&u| Scale::try_from(u).map_err(|_| ConfigError::UnknownScale(u)))
                .collect::<Result<Vec<_>, _>>()?,
            None => Scale::ALL.to_vec(),
        };
        check_list("scales", &scales)?;

        let variants = match &sweep.variants {
            Some(names) => names
                .iter()
                .map(|name| {
                    name.parse::<Variant>()
                        .map_err(|_| ConfigError::UnknownVariant(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Variant::ALL.to_vec(),
        };
        check_list("variants", &variants)?;

        let concurrency = sweep
            .concurrency
            .clone()
            .unwrap_or_else(|| CONCURRENCY_LEVELS.to_vec());
        if let Some(&bad) = concurrency
            .iter()
            .find(|level| !CONCURRENCY_LEVELS.contains(level))
        {
            return Err(ConfigError::UnsupportedConcurrency(bad));
        }
        check_list("concurrency", &concurrency)?;

        let queries = match &sweep.queries {
            Some(ids) => ids
                .iter()
                .map(|&id| QueryId::new(id).ok_or(ConfigError::UnknownQuery(id)))
                .collect::<Result<Vec<_>, _>>()?,
            None => (1..=QueryId::MAX).filter_map(QueryId::new).collect(),
        };
        check_list("queries", &queries)?;

        let repetitions = sweep.repetitions.unwrap_or(DEFAULT_REPETITIONS);
        let warmups = sweep.warmups.unwrap_or(DEFAULT_WARMUPS);
        if repetitions == 0 {
            return Err(ConfigError::Zero {
                field: "repetitions",
            });
        }
        if warmups >= repetitions {
            return Err(ConfigError::WarmupsExceedRepetitions {
                warmups,
                repetitions,
            });
        }

        // Delete queries drain one row per call and the backend lives across
        // every concurrency level of a variant.
        let deletes = u64::from(repetitions) * concurrency.len() as u64;
        if let Some(smallest) = scales.iter().map(|s| s.users()).min() {
            if deletes > u64::from(smallest) {
                return Err(ConfigError::DeleteCapacity {
                    deletes,
                    users: smallest,
                });
            }
        }

        let cell_timeout = match sweep.cell_timeout_secs {
            Some(0) => {
                return Err(ConfigError::Zero {
                    field: "cell_timeout_secs",
                })
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        let interval_ms = self
            .sampler
            .interval_ms
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS);
        let (lo, hi) = SAMPLE_INTERVAL_RANGE_MS;
        if !(lo..=hi).contains(&interval_ms) {
            return Err(ConfigError::SamplerInterval(interval_ms));
        }

        let max_connections = self
            .relational
            .max_connections
            .unwrap_or_else(|| concurrency.iter().copied().max().unwrap_or(1));
        if max_connections == 0 {
            return Err(ConfigError::Zero {
                field: "max_connections",
            });
        }

        let confidence = self
            .analysis
            .confidence
            .unwrap_or(AnalysisSettings::default().confidence);
        let alpha = self
            .analysis
            .alpha
            .unwrap_or(AnalysisSettings::default().alpha);
        check_probability("confidence", confidence)?;
        check_probability("alpha", alpha)?;

        Ok(BenchConfig {
            rounds,
            scales,
            variants,
            concurrency,
            queries,
            repetitions,
            warmups,
            seed: sweep.seed.unwrap_or(DEFAULT_SEED),
            cell_timeout,
            sampler: SamplerConfig {
                enabled: self.sampler.enabled.unwrap_or(true),
                interval: Duration::from_millis(interval_ms),
                pid: self.sampler.pid,
            },
            relational: RelationalOptions {
                dir: self.relational.dir.clone(),
                pool_size: max_connections,
                busy_timeout: Duration::from_millis(
                    self.relational
                        .busy_timeout_ms
                        .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
                ),
            },
            dataset_dir: self.dataset.dir.clone(),
            analysis: AnalysisSettings { confidence, alpha },
            output_dir: self
                .output
                .dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        })
    }
}

fn check_list<T: Copy + Eq + std::hash::Hash + Display>(
    field: &'static str,
    values: &[T],
) -> Result<(), ConfigError> {
    if values.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    let mut seen = HashSet::new();
    for value in values {
        if !seen.insert(*value) {
            return Err(ConfigError::Duplicate {
                field,
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Probability { field, value })
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ConfigFile::parse(&contents, path)
}

/// `<config dir>/shopbench/bench.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("shopbench").join("bench.toml"))
}

/// Resource sampling settings.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerConfig {
    /// Whether to sample at all.
    pub enabled: bool,
    /// Tick between samples.
    pub interval: Duration,
    /// Process to observe; the current process when unset.
    pub pid: Option<u32>,
}

/// Validated sweep configuration.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub struct BenchConfig {
    /// Times the whole grid is repeated on a fresh dataset.
    pub rounds: u32,
    pub scales: Vec<Scale>,
    pub variants: Vec<Variant>,
    pub concurrency: Vec<usize>,
    /// Catalog entries to run, in catalog order by default.
    pub queries: Vec<QueryId>,
    /// Calls per cell, warm-up included.
    pub repetitions: u32,
    pub warmups: u32,
    pub seed: u64,
    /// Limit on one cell's wall-clock.
    pub cell_timeout: Option<Duration>,
    pub sampler: SamplerConfig,
    pub relational: RelationalOptions,
    /// Directory holding pre-built `ecommerce_<users>.json` files.
    pub dataset_dir: Option<PathBuf>,
    pub analysis: AnalysisSettings,
    pub output_dir: PathBuf,
}

/// One point of the sweep grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RunConfig {
    pub scale: Scale,
    pub variant: Variant,
    pub concurrency: usize,
    pub repetitions: u32,
    pub warmups: u32,
}

impl RunConfig {
    /// Rows a completed cell of this configuration produces.
    pub fn measured_calls(&self) -> u32 {
        self.repetitions - self.warmups
    }
}

impl BenchConfig {
    /// The scale × variant × concurrency grid in sweep order.
    pub fn run_configs(&self) -> Vec<RunConfig> {
        let mut grid =
            Vec::with_capacity(self.scales.len() * self.variants.len() * self.concurrency.len());
        for &scale in &self.scales {
            for &variant in &self.variants {
                for &concurrency in &self.concurrency {
                    grid.push(RunConfig {
                        scale,
                        variant,
                        concurrency,
                        repetitions: self.repetitions,
                        warmups: self.warmups,
                    });
                }
            }
        }
        grid
    }

    /// Number of cells in the full sweep.
    pub fn cell_count(&self) -> usize {
        self.rounds as usize * self.run_configs().len() * self.queries.len()
    }
}
