#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for
//! Capstan crates.
//!
//! Architecture role:
//! - defines shuffle transport configuration passed across layers
//! - provides common [`CapstanError`] / [`Result`] contracts
//! - allocates process-wide shuffle ids
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

/// Shuffle transport configuration.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers and the shuffle-id allocator.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;
#[cfg(feature = "profiling")]
/// Optional HTTP metrics exporter.
pub mod metrics_exporter;

pub use config::ShuffleConfig;
pub use error::{CapstanError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;
