//! Benchmark engine comparing a relational and a graph store on an
//! e-commerce workload.
//!
//! A sweep runs the 24-entry [`catalog`] against every configured
//! [`model::Variant`] at every scale tier and concurrency level. The
//! [`executor`] drives one cell at a time through a bounded worker pool
//! while the [`sampler`] watches CPU and memory; the [`sink`] appends raw
//! rows as cells finish, and the [`aggregate`] pass reduces them into
//! summary, percentile and significance tables.
//!
//! ```no_run
//! use shopbench::config::ConfigFile;
//! use shopbench::backend::EmbeddedBackends;
//! use shopbench::sink::CsvSink;
//! use shopbench::sweep::{build_sampler, RunContext};
//!
//! # fn main() -> shopbench::Result<()> {
//! let config = ConfigFile::load(None)?.validate()?;
//! let mut sink = CsvSink::create(&config.output_dir)?;
//! let mut ctx = RunContext::new(&config, &mut sink, build_sampler(&config.sampler));
//! ctx.run(&EmbeddedBackends::new(config.relational.clone()))?;
//! let summary = ctx.finish()?;
//! println!("{} cells aborted", summary.aborted_cells);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod aggregate;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod env;
pub mod error;
pub mod executor;
pub mod model;
pub mod sampler;
pub mod sink;
pub mod stats;
pub mod sweep;

pub use error::{BenchError, Result};
