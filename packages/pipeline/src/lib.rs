#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Streaming windowed aggregation of police service calls.
//!
//! Wires ingestion, the aggregation engine, the optional disposition join,
//! and a sink into one job driven by [`runner::Pipeline`], configured by
//! [`config::PipelineConfig`] and stopped through
//! [`shutdown::Shutdown`].

pub mod config;
pub mod error;
pub mod runner;
pub mod shutdown;

pub use config::{ConfigError, PipelineConfig};
pub use error::PipelineError;
pub use runner::{Pipeline, PipelineReport};
pub use shutdown::{Shutdown, ShutdownSignal};
