//! Process-level configuration: the processing-relevant subset that feeds
//! [`crate::run_coordinator::run_id_from_config`], plus the
//! worker-local settings that must be excluded from that hash.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::time::Duration;

/// The full materialized configuration consumed by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Hashed into the run id. Content-source declarations (type, connection
    /// details, per-source settings).
    pub content_sources: Vec<JsonValue>,
    /// Hashed into the run id. Storage backend selection + connection info.
    pub storage: JsonValue,
    /// Hashed into the run id. Embedding provider selection + model config.
    pub embedding: JsonValue,
    /// Hashed into the run id. Relationship-detector / ontology selection.
    pub relationship_detection: JsonValue,

    /// NOT hashed into the run id — worker-local settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_max_wait_time_secs")]
    pub max_wait_time_secs: u64,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_claim_timeout_secs() -> u64 {
    300
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_max_retries() -> i32 {
    3
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_max_wait_time_secs() -> u64 {
    3600
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            claim_timeout_secs: default_claim_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_retries: default_max_retries(),
            check_interval_secs: default_check_interval_secs(),
            max_wait_time_secs: default_max_wait_time_secs(),
            log_level: None,
            port: None,
        }
    }
}

impl WorkerConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_secs(self.max_wait_time_secs)
    }
}

impl PipelineConfig {
    /// Load from a YAML or JSON file, dispatching on extension the way the
    /// reference `OntologyLoader` does for ontology documents.
    pub fn load_from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&raw)?),
            Some("json") => Ok(serde_json::from_str(&raw)?),
            other => Err(anyhow::anyhow!(
                "unsupported config extension: {:?} (expected .yaml/.yml/.json)",
                other
            )),
        }
    }

    /// The database URL the `storage` block points at, if it's a Postgres
    /// backend. Convenience for the CLI; not part of the core contract.
    pub fn postgres_url(&self) -> Option<&str> {
        self.storage.get("url").and_then(JsonValue::as_str)
    }

    pub fn is_embedding_enabled(&self) -> bool {
        self.embedding
            .get("enabled")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }
}
