//! Deterministic run identity and worker registration.
//!
//! Grounded on `RunCoordinator` in the reference `work_queue.py`; the
//! transactional upsert-with-conflict-ignore pattern follows
//! `supabase_repository::register_repository_and_enqueue_job`'s use of
//! `FOR UPDATE` + `ON CONFLICT`.

use crate::model::{ProcessingRun, RunStatus};
use anyhow::{Context, Result};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::instrument;

use crate::config::PipelineConfig;

/// Canonicalize the processing-relevant subset of a config and hash it.
/// Sorted-key serialization guarantees key order never affects the hash, so
/// two configs built from differently-ordered maps still agree.
pub fn run_id_from_config(config: &PipelineConfig) -> String {
    let subset = json!({
        "content_sources": canonicalize(&serde_json::to_value(&config.content_sources).unwrap()),
        "storage": canonicalize(&config.storage),
        "embedding": canonicalize(&config.embedding),
        "relationship_detection": canonicalize(&config.relationship_detection),
    });
    let canonical = serde_json::to_string(&subset).expect("canonical json subset serializes");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Full (untruncated) hash of the same subset, stored alongside the run for
/// diagnostics — `run_id` is a 16-hex prefix, `config_hash` is the whole thing.
pub fn config_hash(config: &PipelineConfig) -> String {
    let subset = json!({
        "content_sources": canonicalize(&serde_json::to_value(&config.content_sources).unwrap()),
        "storage": canonicalize(&config.storage),
        "embedding": canonicalize(&config.embedding),
        "relationship_detection": canonicalize(&config.relationship_detection),
    });
    let canonical = serde_json::to_string(&subset).expect("canonical json subset serializes");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recursively sort object keys so serialization order can't perturb the hash.
fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut sorted: Vec<(&String, &JsonValue)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Clone)]
pub struct RunCoordinator {
    pool: PgPool,
}

impl RunCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Transactional upsert: if the run already exists, touch
    /// `last_activity_at`; otherwise insert with conflict-ignore so
    /// concurrently-racing coordinators converge on one row.
    #[instrument(skip(self, config))]
    pub async fn ensure_run_exists(
        &self,
        run_id: &str,
        config: &PipelineConfig,
    ) -> Result<ProcessingRun> {
        let hash = config_hash(config);
        let snapshot = serde_json::to_value(config).context("config must serialize to JSON")?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO processing_runs (run_id, config_hash, config_snapshot, status)
            VALUES ($1, $2, $3, 'active')
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(&hash)
        .bind(Json(&snapshot))
        .execute(&mut *tx)
        .await
        .context("failed to insert processing run")?;

        sqlx::query(
            r#"
            UPDATE processing_runs
            SET last_activity_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to touch run activity")?;

        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, config_hash, config_snapshot, status, created_at,
                   last_activity_at, worker_count, documents_queued,
                   documents_processed, documents_failed, documents_retried
            FROM processing_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to fetch processing run after upsert")?;

        tx.commit().await?;

        Ok(row.into())
    }

    /// Upsert the worker's row for this run, then recompute `worker_count` as
    /// the number of distinct active workers.
    #[instrument(skip(self, metadata))]
    pub async fn register_worker(
        &self,
        run_id: &str,
        worker_id: &str,
        hostname: &str,
        metadata: Option<JsonValue>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO run_workers (run_id, worker_id, hostname, process_id, version,
                                      capabilities, status, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, 'active', NOW())
            ON CONFLICT (run_id, worker_id) DO UPDATE
            SET hostname = EXCLUDED.hostname,
                status = 'active',
                last_heartbeat = NOW()
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(hostname)
        .bind(std::process::id() as i32)
        .bind(env!("CARGO_PKG_VERSION"))
        .bind(Json(metadata.unwrap_or_else(|| json!({}))))
        .execute(&mut *tx)
        .await
        .context("failed to register worker")?;

        sqlx::query(
            r#"
            UPDATE processing_runs
            SET worker_count = (
                SELECT COUNT(*) FROM run_workers
                WHERE run_id = $1 AND status IN ('active', 'processing')
            )
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to recompute worker_count")?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn heartbeat_worker(&self, run_id: &str, worker_id: &str) -> Result<()> {
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

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    config_hash: String,
    config_snapshot: JsonValue,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    last_activity_at: chrono::DateTime<chrono::Utc>,
    worker_count: i32,
    documents_queued: i64,
    documents_processed: i64,
    documents_failed: i64,
    documents_retried: i64,
}

impl From<RunRow> for ProcessingRun {
    fn from(row: RunRow) -> Self {
        ProcessingRun {
            run_id: row.run_id,
            config_hash: row.config_hash,
            config_snapshot: row.config_snapshot,
            status: match row.status.as_str() {
                "completed" => RunStatus::Completed,
                "aborted" => RunStatus::Aborted,
                _ => RunStatus::Active,
            },
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
            worker_count: row.worker_count,
            documents_queued: row.documents_queued,
            documents_processed: row.documents_processed,
            documents_failed: row.documents_failed,
            documents_retried: row.documents_retried,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> PipelineConfig {
        PipelineConfig {
            content_sources: vec![json!({"type": "file", "path": "/docs"})],
            storage: json!({"backend": "postgres", "url": "postgres://x"}),
            embedding: json!({"enabled": true, "model": "test"}),
            relationship_detection: json!({"ontology": "default"}),
            worker: Default::default(),
        }
    }

    #[test]
    fn run_id_is_deterministic() {
        let a = sample_config();
        let b = sample_config();
        assert_eq!(run_id_from_config(&a), run_id_from_config(&b));
    }

    #[test]
    fn run_id_ignores_worker_local_fields() {
        let mut a = sample_config();
        let mut b = sample_config();
        a.worker.port = Some(8080);
        a.worker.log_level = Some("debug".into());
        b.worker.port = Some(9090);
        b.worker.log_level = Some("trace".into());
        assert_eq!(run_id_from_config(&a), run_id_from_config(&b));
    }

    #[test]
    fn run_id_changes_with_processing_config() {
        let a = sample_config();
        let mut b = sample_config();
        b.storage = json!({"backend": "postgres", "url": "postgres://y"});
        assert_ne!(run_id_from_config(&a), run_id_from_config(&b));
    }

    #[test]
    fn run_id_is_16_hex_chars() {
        let id = run_id_from_config(&sample_config());
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_order_does_not_affect_run_id() {
        let a = PipelineConfig {
            content_sources: vec![json!({"type": "file", "path": "/docs"})],
            storage: json!({"backend": "postgres", "url": "postgres://x"}),
            embedding: json!({"model": "test", "enabled": true}),
            relationship_detection: json!({"ontology": "default"}),
            worker: Default::default(),
        };
        let b = sample_config();
        assert_eq!(run_id_from_config(&a), run_id_from_config(&b));
    }
}
