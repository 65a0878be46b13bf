//! Shared configuration, error types, IDs, and observability primitives for cumulo crates.
//!
//! Architecture role:
//! - defines executor/session configuration passed across layers
//! - provides common [`CumuloError`] / [`Result`] contracts, including the
//!   tagged [`RemoteError`] that carries worker-reported failures
//! - hosts metrics and optional exporter utilities
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;

pub use config::{ExecutorConfig, engine_version};
pub use error::{CumuloError, RemoteError, RemoteErrorKind, Result};
pub use ids::*;
pub use metrics::{MetricsRegistry, global_metrics};
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;
