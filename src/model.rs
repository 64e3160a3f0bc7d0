//! Data model shared across the work queue, run coordinator, and worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle state of a `ProcessingRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
    Aborted,
}

/// One coordinated pass of the pipeline, identified by a config-derived hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRun {
    pub run_id: String,
    pub config_hash: String,
    pub config_snapshot: JsonValue,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub worker_count: i32,
    pub documents_queued: i64,
    pub documents_processed: i64,
    pub documents_failed: i64,
    pub documents_retried: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Processing,
    Idle,
    Dead,
}

/// A process instance that claims and processes queue items for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub run_id: String,
    pub worker_id: String,
    pub hostname: String,
    pub process_id: u32,
    pub version: String,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub documents_claimed: i64,
    pub documents_processed: i64,
    pub documents_failed: i64,
}

/// How a queue item entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Configured,
    Linked,
    Discovered,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configured => "configured",
            Self::Linked => "linked",
            Self::Discovered => "discovered",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configured" => Ok(Self::Configured),
            "linked" => Ok(Self::Linked),
            "discovered" => Ok(Self::Discovered),
            other => Err(anyhow::anyhow!("unknown source_type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

/// A unit of work: one document, claimed by at most one worker at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: i64,
    pub run_id: String,
    pub doc_id: String,
    pub source_name: String,
    pub source_type: SourceType,
    pub parent_doc_id: Option<String>,
    pub link_depth: i32,
    pub priority: i32,
    pub metadata: JsonValue,
    pub status: QueueStatus,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub scheduled_for: DateTime<Utc>,
    pub error_message: Option<String>,
    pub error_details: Option<JsonValue>,
    pub content_hash: Option<String>,
    pub file_size: Option<i64>,
}

impl QueueItem {
    /// `max_link_depth` as stashed in `metadata.max_link_depth` by the
    /// coordinator, defaulting to 1.
    pub fn max_link_depth(&self) -> i32 {
        self.metadata
            .get("max_link_depth")
            .and_then(JsonValue::as_i64)
            .map(|v| v as i32)
            .unwrap_or(1)
    }
}

/// A parent→child crawl edge discovered while following links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub parent_doc_id: String,
    pub child_doc_id: String,
    pub source_name: String,
    pub run_id: String,
    pub link_type: String,
    pub link_depth: i32,
    pub discovered_by_worker: String,
}

/// Terminal sink record for an item that exhausted retries or hit a critical error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub queue_id: i64,
    pub run_id: String,
    pub doc_id: String,
    pub source_name: String,
    pub error_message: String,
    pub error_details: JsonValue,
    pub retry_count_at_death: i32,
    pub original_snapshot: JsonValue,
    pub moved_at: DateTime<Utc>,
}

/// Aggregated queue status counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retry: i64,
    pub total: i64,
}

/// Stats returned at run completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: String,
    pub coordinator_id: String,
    pub documents_queued: i64,
    pub documents_processed: i64,
    pub documents_failed: i64,
    pub cross_document_relationships: i64,
    pub total_runtime_seconds: f64,
}

/// A statically-typed stand-in for the reference implementation's duck-typed
/// element dict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub element_pk: i64,
    pub element_id: String,
    pub doc_id: String,
    pub element_type: String,
    pub content_preview: String,
    pub parent_id: Option<String>,
    pub document_position: Option<i64>,
    #[serde(default)]
    pub attributes: HashMap<String, JsonValue>,
}

/// Content fetched from a content source, plus whatever metadata it carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub doc_id: String,
    pub content: Vec<u8>,
    pub metadata: JsonValue,
    pub content_hash: Option<String>,
    pub content_type: Option<String>,
}

/// One candidate document surfaced by `ContentSource::list_documents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedDocument {
    pub id: String,
    pub metadata: JsonValue,
}

/// A link discovered while following a fetched document's outbound references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedDocument {
    pub id: String,
    pub link_type: String,
    pub metadata: JsonValue,
}

pub fn new_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}
