//! The distributed work queue.

pub mod dead_letter;
pub mod postgres;

pub use dead_letter::DeadLetterQueue;
pub use postgres::PostgresWorkQueue;

use crate::model::{QueueStatusCounts, SourceType};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Exponential backoff: `60 * 2^n` seconds for the n-th retry.
pub fn backoff_seconds(retry_count: i32) -> i64 {
    60i64 * 2i64.pow(retry_count.max(0) as u32)
}

/// The public work-queue contract. [`PostgresWorkQueue`] is the one concrete
/// implementation shipped; the trait exists so the worker and coordinator
/// depend on behavior, not a concrete backend.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Upsert on `(run_id, doc_id, source_name)`; on conflict, retain the
    /// lower `link_depth` and touch `updated_at`. Returns the queue id.
    async fn add_document(
        &self,
        run_id: &str,
        doc_id: &str,
        source_name: &str,
        source_type: SourceType,
        parent_doc_id: Option<&str>,
        link_depth: i32,
        metadata: JsonValue,
    ) -> Result<i64>;

    /// Record the dependency edge (idempotent), then enqueue the child via
    /// `add_document(source_type=Linked)`.
    async fn add_linked_document(
        &self,
        run_id: &str,
        parent_doc_id: &str,
        child_doc_id: &str,
        source_name: &str,
        link_depth: i32,
        discovered_by_worker: &str,
        link_type: &str,
    ) -> Result<i64>;

    /// Claim the next ready item for `run_id`, or `None` if nothing is ready.
    /// Orders by priority, then link depth, then age; reclaims stale claims.
    async fn claim_next_document(
        &self,
        run_id: &str,
        worker_id: &str,
        claim_timeout: std::time::Duration,
    ) -> Result<Option<crate::model::QueueItem>>;

    async fn mark_completed(
        &self,
        queue_id: i64,
        worker_id: &str,
        content_hash: Option<&str>,
        file_size: Option<i64>,
    ) -> Result<()>;

    /// Transition to `retry` (with backoff) or `failed` depending on
    /// `retry_count` vs `max_retries`. Returns `true` if the item is now
    /// terminally `failed` (caller should route to the DLQ).
    async fn mark_failed(
        &self,
        queue_id: i64,
        error_message: &str,
        error_details: Option<JsonValue>,
    ) -> Result<bool>;

    async fn get_queue_status(&self, run_id: &str) -> Result<QueueStatusCounts>;

    async fn heartbeat(&self, run_id: &str, worker_id: &str) -> Result<()>;

    /// `doc_id`s with `status = 'completed'` for `run_id`, used by the
    /// coordinator to seed cross-document relationship detection.
    async fn completed_document_ids(&self, run_id: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_reference_formula() {
        assert_eq!(backoff_seconds(0), 60);
        assert_eq!(backoff_seconds(1), 120);
        assert_eq!(backoff_seconds(2), 240);
    }

    #[test]
    fn backoff_is_monotonically_increasing() {
        let deltas: Vec<i64> = (0..5).map(backoff_seconds).collect();
        for pair in deltas.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }
}
