//! Trait-level interfaces the core depends on: persistence (`storage`), plus
//! the small cross-cutting health/metrics contracts defined at this layer.

pub mod embedding;
pub mod parser;
pub mod storage;

pub use embedding::EmbeddingProvider;
pub use parser::{DocumentParser, ParserRegistry, ParsedDocument};
pub use storage::{BackendCapabilities, Storage};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Health check interface, implemented by long-lived backends and workers.
#[async_trait]
pub trait HealthCheck {
    async fn health(&self) -> Result<HealthStatus>;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

/// Minimal metrics sink; the Postgres backend and the worker report through this.
pub trait MetricsCollector: Send + Sync {
    fn record_operation(&self, operation: &str, duration: std::time::Duration);
    fn record_count(&self, metric: &str, count: u64);
    fn snapshot(&self) -> HashMap<String, f64>;
}
