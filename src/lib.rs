//! Hierarchical metrics aggregation: raw per-host samples are reduced to
//! compact partial results, and partial results are merged into group
//! results, by pluggable algorithms served from a pool of worker processes.

use std::sync::Arc;

pub mod algorithms;
pub mod config;
pub mod digest;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod supervisor;

pub use error::{AggregatorError, Result};

/// Shared worker state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Resolves class names and runs the reductions.
    pub service: Arc<service::AggregationService>,

    /// Per-worker request statistics, fed by the timing middleware.
    pub stats: Arc<metrics::ServiceStats>,
}

impl AppState {
    pub fn new(registry: registry::PluginRegistry) -> Self {
        Self {
            service: Arc::new(service::AggregationService::new(Arc::new(registry))),
            stats: Arc::new(metrics::ServiceStats::new()),
        }
    }
}
