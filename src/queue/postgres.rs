//! Postgres-backed work queue: the `FOR UPDATE SKIP LOCKED` claim primitive,
//! retry/backoff, and stale-claim reclamation.
//!
//! Grounded directly on `supabase_repository::fetch_job_for_worker` (the
//! `SELECT ... FOR UPDATE SKIP LOCKED` claim pattern) and
//! `supabase_repository::recover_stale_jobs` (the `WITH updated AS (UPDATE
//! ... RETURNING ...)` stale-reclaim CTE, which avoids string-interpolated
//! interval literals).

use super::{backoff_seconds, WorkQueue};
use crate::model::{QueueItem, QueueStatus, QueueStatusCounts, SourceType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{instrument, warn};

#[derive(Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct QueueItemRow {
    queue_id: i64,
    run_id: String,
    doc_id: String,
    source_name: String,
    source_type: String,
    parent_doc_id: Option<String>,
    link_depth: i32,
    priority: i32,
    metadata: JsonValue,
    status: String,
    worker_id: Option<String>,
    claimed_at: Option<chrono::DateTime<chrono::Utc>>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    failed_at: Option<chrono::DateTime<chrono::Utc>>,
    retry_count: i32,
    max_retries: i32,
    scheduled_for: chrono::DateTime<chrono::Utc>,
    error_message: Option<String>,
    error_details: Option<JsonValue>,
    content_hash: Option<String>,
    file_size: Option<i64>,
}

impl From<QueueItemRow> for QueueItem {
    fn from(row: QueueItemRow) -> Self {
        QueueItem {
            queue_id: row.queue_id,
            run_id: row.run_id,
            doc_id: row.doc_id,
            source_name: row.source_name,
            source_type: row.source_type.parse().unwrap_or(SourceType::Configured),
            parent_doc_id: row.parent_doc_id,
            link_depth: row.link_depth,
            priority: row.priority,
            metadata: row.metadata,
            status: match row.status.as_str() {
                "processing" => QueueStatus::Processing,
                "completed" => QueueStatus::Completed,
                "failed" => QueueStatus::Failed,
                "retry" => QueueStatus::Retry,
                _ => QueueStatus::Pending,
            },
            worker_id: row.worker_id,
            claimed_at: row.claimed_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            scheduled_for: row.scheduled_for,
            error_message: row.error_message,
            error_details: row.error_details,
            content_hash: row.content_hash,
            file_size: row.file_size,
        }
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    #[instrument(skip(self, metadata))]
    async fn add_document(
        &self,
        run_id: &str,
        doc_id: &str,
        source_name: &str,
        source_type: SourceType,
        parent_doc_id: Option<&str>,
        link_depth: i32,
        metadata: JsonValue,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let queue_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO document_queue (
                run_id, doc_id, source_name, source_type, parent_doc_id,
                link_depth, metadata, status, max_retries, scheduled_for
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, NOW())
            ON CONFLICT (run_id, doc_id, source_name) DO UPDATE
            SET link_depth = LEAST(document_queue.link_depth, EXCLUDED.link_depth),
                updated_at = NOW()
            RETURNING queue_id
            "#,
        )
        .bind(run_id)
        .bind(doc_id)
        .bind(source_name)
        .bind(source_type.to_string())
        .bind(parent_doc_id)
        .bind(link_depth)
        .bind(Json(metadata))
        .bind(3i32)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert queue item")?;

        sqlx::query(
            r#"
            UPDATE processing_runs
            SET documents_queued = documents_queued + 1, last_activity_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to bump documents_queued")?;

        tx.commit().await?;
        Ok(queue_id)
    }

    #[instrument(skip(self))]
    async fn add_linked_document(
        &self,
        run_id: &str,
        parent_doc_id: &str,
        child_doc_id: &str,
        source_name: &str,
        link_depth: i32,
        discovered_by_worker: &str,
        link_type: &str,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO document_dependencies (
                parent_doc_id, child_doc_id, source_name, run_id,
                link_type, link_depth, discovered_by_worker
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (parent_doc_id, child_doc_id, source_name, run_id) DO NOTHING
            "#,
        )
        .bind(parent_doc_id)
        .bind(child_doc_id)
        .bind(source_name)
        .bind(run_id)
        .bind(link_type)
        .bind(link_depth)
        .bind(discovered_by_worker)
        .execute(&self.pool)
        .await
        .context("failed to record dependency edge")?;

        self.add_document(
            run_id,
            child_doc_id,
            source_name,
            SourceType::Linked,
            Some(parent_doc_id),
            link_depth,
            json!({}),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn claim_next_document(
        &self,
        run_id: &str,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<Option<QueueItem>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, QueueItemRow>(
            r#"
            UPDATE document_queue
            SET status = 'processing',
                worker_id = $2,
                claimed_at = NOW(),
                started_at = NOW()
            WHERE queue_id = (
                SELECT queue_id FROM document_queue
                WHERE run_id = $1 AND status = 'pending' AND scheduled_for <= NOW()
                ORDER BY priority DESC, link_depth ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING queue_id, run_id, doc_id, source_name, source_type, parent_doc_id,
                      link_depth, priority, metadata, status, worker_id, claimed_at,
                      started_at, completed_at, failed_at, retry_count, max_retries,
                      scheduled_for, error_message, error_details, content_hash, file_size
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to claim pending document")?;

        let row = match row {
            Some(row) => Some(row),
            None => {
                let claim_timeout_secs = claim_timeout.as_secs() as i64;
                sqlx::query_as::<_, QueueItemRow>(
                    r#"
                    UPDATE document_queue
                    SET status = 'processing',
                        worker_id = $2,
                        claimed_at = NOW(),
                        started_at = NOW()
                    WHERE queue_id = (
                        SELECT queue_id FROM document_queue
                        WHERE run_id = $1 AND status = 'processing'
                            AND claimed_at < NOW() - ($3 * INTERVAL '1 second')
                        ORDER BY priority DESC, link_depth ASC, created_at ASC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING queue_id, run_id, doc_id, source_name, source_type, parent_doc_id,
                              link_depth, priority, metadata, status, worker_id, claimed_at,
                              started_at, completed_at, failed_at, retry_count, max_retries,
                              scheduled_for, error_message, error_details, content_hash, file_size
                    "#,
                )
                .bind(run_id)
                .bind(worker_id)
                .bind(claim_timeout_secs)
                .fetch_optional(&mut *tx)
                .await
                .context("failed to reclaim stale document")?
            }
        };

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE run_workers
            SET documents_claimed = documents_claimed + 1, last_heartbeat = NOW()
            WHERE run_id = $1 AND worker_id = $2
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .context("failed to bump worker documents_claimed")?;

        tx.commit().await?;
        Ok(Some(row.into()))
    }

    #[instrument(skip(self))]
    async fn mark_completed(
        &self,
        queue_id: i64,
        worker_id: &str,
        content_hash: Option<&str>,
        file_size: Option<i64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let run_id = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE document_queue
            SET status = 'completed',
                completed_at = NOW(),
                content_hash = COALESCE($3, content_hash),
                file_size = COALESCE($4, file_size)
            WHERE queue_id = $1 AND worker_id = $2
            RETURNING run_id
            "#,
        )
        .bind(queue_id)
        .bind(worker_id)
        .bind(content_hash)
        .bind(file_size)
        .fetch_one(&mut *tx)
        .await
        .context("failed to mark document completed (ownership check failed?)")?;

        sqlx::query(
            r#"
            UPDATE processing_runs
            SET documents_processed = documents_processed + 1, last_activity_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(&run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE run_workers
            SET documents_processed = documents_processed + 1
            WHERE run_id = $1 AND worker_id = $2
            "#,
        )
        .bind(&run_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, error_details))]
    async fn mark_failed(
        &self,
        queue_id: i64,
        error_message: &str,
        error_details: Option<JsonValue>,
    ) -> Result<bool> {
        #[derive(sqlx::FromRow)]
        struct RetryInfo {
            retry_count: i32,
            max_retries: i32,
            run_id: String,
            worker_id: Option<String>,
        }

        let mut tx = self.pool.begin().await?;

        let info = sqlx::query_as::<_, RetryInfo>(
            r#"
            SELECT retry_count, max_retries, run_id, worker_id
            FROM document_queue
            WHERE queue_id = $1
            FOR UPDATE
            "#,
        )
        .bind(queue_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to load queue item for failure handling")?;

        let terminally_failed = info.retry_count >= info.max_retries;

        if !terminally_failed {
            let delay = backoff_seconds(info.retry_count);
            sqlx::query(
                r#"
                UPDATE document_queue
                SET status = 'retry',
                    worker_id = NULL,
                    retry_count = retry_count + 1,
                    scheduled_for = NOW() + ($2 * INTERVAL '1 second'),
                    error_message = $3,
                    error_details = $4
                WHERE queue_id = $1
                "#,
            )
            .bind(queue_id)
            .bind(delay)
            .bind(error_message)
            .bind(error_details.map(Json))
            .execute(&mut *tx)
            .await
            .context("failed to schedule retry")?;

            sqlx::query(
                r#"
                UPDATE processing_runs
                SET documents_retried = documents_retried + 1, last_activity_at = NOW()
                WHERE run_id = $1
                "#,
            )
            .bind(&info.run_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE document_queue
                SET status = 'failed',
                    failed_at = NOW(),
                    error_message = $2,
                    error_details = $3
                WHERE queue_id = $1
                "#,
            )
            .bind(queue_id)
            .bind(error_message)
            .bind(error_details.map(Json))
            .execute(&mut *tx)
            .await
            .context("failed to mark document permanently failed")?;

            sqlx::query(
                r#"
                UPDATE processing_runs
                SET documents_failed = documents_failed + 1, last_activity_at = NOW()
                WHERE run_id = $1
                "#,
            )
            .bind(&info.run_id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(worker_id) = info.worker_id {
            let updated = sqlx::query(
                r#"
                UPDATE run_workers
                SET documents_failed = documents_failed + 1
                WHERE run_id = $1 AND worker_id = $2
                "#,
            )
            .bind(&info.run_id)
            .bind(&worker_id)
            .execute(&mut *tx)
            .await;
            if let Err(e) = updated {
                warn!(worker_id = %worker_id, "failed to bump worker failure counter: {e}");
            }
        }

        tx.commit().await?;
        Ok(terminally_failed)
    }

    #[instrument(skip(self))]
    async fn get_queue_status(&self, run_id: &str) -> Result<QueueStatusCounts> {
        #[derive(sqlx::FromRow)]
        struct Row {
            pending: i64,
            processing: i64,
            completed: i64,
            failed: i64,
            retry: i64,
        }

        let row = sqlx::query_as::<_, Row>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending')    AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed')  AS completed,
                COUNT(*) FILTER (WHERE status = 'failed')     AS failed,
                COUNT(*) FILTER (WHERE status = 'retry')      AS retry
            FROM document_queue
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to aggregate queue status")?;

        Ok(QueueStatusCounts {
            pending: row.pending,
            processing: row.processing,
            completed: row.completed,
            failed: row.failed,
            retry: row.retry,
            total: row.pending + row.processing + row.completed + row.failed + row.retry,
        })
    }

    async fn completed_document_ids(&self, run_id: &str) -> Result<Vec<String>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            doc_id: String,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT DISTINCT doc_id
            FROM document_queue
            WHERE run_id = $1 AND status = 'completed'
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list completed documents")?;

        Ok(rows.into_iter().map(|r| r.doc_id).collect())
    }

    #[instrument(skip(self))]
    async fn heartbeat(&self, run_id: &str, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_workers
            SET last_heartbeat = NOW()
            WHERE run_id = $1 AND worker_id = $2
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .context("failed to heartbeat worker")?;
        Ok(())
    }
}
