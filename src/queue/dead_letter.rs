//! Terminal sink for items that will not be retried.

use crate::model::DeadLetterItem;
use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::instrument;

#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Copy the queue item's terminal diagnostics into the dead-letter table.
    /// Called by the worker instead of `WorkQueue::mark_failed` when the
    /// failure is critical — retries are not attempted first.
    #[instrument(skip(self, error_details, original_snapshot))]
    pub async fn move_to_dead_letter(
        &self,
        queue_id: i64,
        run_id: &str,
        doc_id: &str,
        source_name: &str,
        error_message: &str,
        error_details: JsonValue,
        retry_count_at_death: i32,
        original_snapshot: JsonValue,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (
                queue_id, run_id, doc_id, source_name, error_message,
                error_details, retry_count_at_death, original_snapshot, moved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            "#,
        )
        .bind(queue_id)
        .bind(run_id)
        .bind(doc_id)
        .bind(source_name)
        .bind(error_message)
        .bind(Json(error_details))
        .bind(retry_count_at_death)
        .bind(Json(original_snapshot))
        .execute(&mut *tx)
        .await
        .context("failed to insert dead-letter record")?;

        sqlx::query(
            r#"
            UPDATE document_queue
            SET status = 'failed', failed_at = NOW(), error_message = $2
            WHERE queue_id = $1
            "#,
        )
        .bind(queue_id)
        .bind(error_message)
        .execute(&mut *tx)
        .await
        .context("failed to mark dead-lettered item failed")?;

        sqlx::query(
            r#"
            UPDATE processing_runs
            SET documents_failed = documents_failed + 1, last_activity_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to bump documents_failed for dead-lettered item")?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<DeadLetterItem>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT queue_id, run_id, doc_id, source_name, error_message,
                   error_details, retry_count_at_death, original_snapshot, moved_at
            FROM dead_letter_queue
            WHERE run_id = $1
            ORDER BY moved_at ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list dead-letter items")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    queue_id: i64,
    run_id: String,
    doc_id: String,
    source_name: String,
    error_message: String,
    error_details: JsonValue,
    retry_count_at_death: i32,
    original_snapshot: JsonValue,
    moved_at: chrono::DateTime<chrono::Utc>,
}

impl From<DeadLetterRow> for DeadLetterItem {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetterItem {
            queue_id: row.queue_id,
            run_id: row.run_id,
            doc_id: row.doc_id,
            source_name: row.source_name,
            error_message: row.error_message,
            error_details: row.error_details,
            retry_count_at_death: row.retry_count_at_death,
            original_snapshot: row.original_snapshot,
            moved_at: row.moved_at,
        }
    }
}
