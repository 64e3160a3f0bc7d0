//! `DocumentProcessor`, grounded on
//! `supabase_repository/job_worker.rs`'s `SupabaseJobWorker` — the same
//! claim/process/complete-or-fail tick loop and heartbeat-guard shape,
//! retargeted at the document pipeline instead of repository indexing jobs.

use crate::content_source::ContentSourceRegistry;
use crate::contracts::parser::ParserRegistry;
use crate::contracts::{EmbeddingProvider, Storage};
use crate::error::PipelineError;
use crate::model::QueueItem;
use crate::ontology::OntologyManager;
use crate::queue::{DeadLetterQueue, WorkQueue};
use crate::relationships::DomainRelationshipDetector;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

/// Heartbeat cadence expressed as a completion count rather than wall-clock
/// time.
const HEARTBEAT_EVERY_N_COMPLETIONS: u64 = 10;

pub struct DocumentProcessor {
    run_id: String,
    worker_id: String,
    queue: Arc<dyn WorkQueue>,
    dead_letter: DeadLetterQueue,
    storage: Arc<dyn Storage>,
    content_sources: ContentSourceRegistry,
    parsers: Arc<ParserRegistry>,
    relationship_detector: DomainRelationshipDetector,
    ontology: Arc<OntologyManager>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    claim_timeout: Duration,
    poll_interval: Duration,
    completions: AtomicU64,
}

impl DocumentProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: String,
        worker_id: String,
        queue: Arc<dyn WorkQueue>,
        dead_letter: DeadLetterQueue,
        storage: Arc<dyn Storage>,
        content_sources: ContentSourceRegistry,
        parsers: Arc<ParserRegistry>,
        ontology: Arc<OntologyManager>,
        embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
        claim_timeout: Duration,
    ) -> Self {
        let relationship_detector = DomainRelationshipDetector::new(storage.clone(), embedding_provider.clone());
        Self {
            run_id,
            worker_id,
            queue,
            dead_letter,
            storage,
            content_sources,
            parsers,
            relationship_detector,
            ontology,
            embedding_provider,
            claim_timeout,
            poll_interval: Duration::from_secs(2),
            completions: AtomicU64::new(0),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs until `max_documents` items have been processed (or forever if
    /// `None`), sleeping `poll_interval` between empty claims — the same
    /// shape as `SupabaseJobWorker::run`/`tick`.
    #[instrument(skip(self), fields(run_id = %self.run_id, worker_id = %self.worker_id))]
    pub async fn run(&self, max_documents: Option<u64>) -> Result<()> {
        let mut processed = 0u64;
        loop {
            if let Some(limit) = max_documents {
                if processed >= limit {
                    return Ok(());
                }
            }
            match self.tick().await {
                Ok(true) => {
                    processed += 1;
                }
                Ok(false) => sleep(self.poll_interval).await,
                Err(e) => {
                    error!("worker tick failed: {e}");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// One claim-process-resolve cycle. Returns `true` if an item was
    /// claimed (processed successfully or terminally failed), `false` if
    /// the queue had nothing ready.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<bool> {
        let Some(item) = self
            .queue
            .claim_next_document(&self.run_id, &self.worker_id, self.claim_timeout)
            .await?
        else {
            return Ok(false);
        };

        let queue_id = item.queue_id;
        match self.process_item(&item).await {
            Ok(outcome) => {
                self.queue
                    .mark_completed(
                        queue_id,
                        &self.worker_id,
                        outcome.content_hash.as_deref(),
                        outcome.file_size,
                    )
                    .await?;
                self.maybe_heartbeat().await;
            }
            Err(e) => self.handle_failure(&item, e).await?,
        }

        Ok(true)
    }

    async fn maybe_heartbeat(&self) {
        let n = self.completions.fetch_add(1, Ordering::Relaxed) + 1;
        if n % HEARTBEAT_EVERY_N_COMPLETIONS == 0 {
            if let Err(e) = self.queue.heartbeat(&self.run_id, &self.worker_id).await {
                warn!(error = %e, "heartbeat failed");
            }
        }
    }

    /// Fetch, detect changes, parse, persist, and discover links for one
    /// claimed item. Errors propagate to `tick`'s failure handling.
    async fn process_item(&self, item: &QueueItem) -> Result<ProcessedOutcome> {
        let source = self
            .content_sources
            .get(&item.source_name)
            .map_err(|_| PipelineError::UnknownContentSource(item.source_name.clone()))?;

        let fetched = source.fetch_document(&item.doc_id).await?;

        // Step 4: change detection, fail-open on error.
        let last_processed = self.storage.get_last_processed_info(&item.doc_id).await.ok().flatten();
        let unchanged = match &last_processed {
            Some(info) => {
                let content_unchanged = match (&fetched.content_hash, &info.content_hash) {
                    (Some(new), Some(old)) => new == old,
                    _ => false,
                };
                let source_reports_unchanged = source
                    .has_changed(&item.doc_id, info.last_modified.as_deref())
                    .await
                    .map(|changed| !changed)
                    .unwrap_or(false);
                content_unchanged || source_reports_unchanged
            }
            None => false,
        };
        if unchanged {
            return Ok(ProcessedOutcome {
                content_hash: fetched.content_hash.clone(),
                file_size: Some(fetched.content.len() as i64),
            });
        }

        // Step 5: parse.
        let parser = self.parsers.resolve(fetched.content_type.as_deref()).ok_or_else(|| {
            PipelineError::Critical {
                error_type: "UnsupportedDocumentTypeError".to_string(),
                message: format!(
                    "no parser registered for content type {:?}",
                    fetched.content_type
                ),
            }
        })?;
        let parsed = parser.parse(&fetched).await?;

        let document = parsed.document.unwrap_or_else(|| crate::contracts::storage::PersistedDocument {
            doc_id: item.doc_id.clone(),
            source_name: item.source_name.clone(),
            metadata: fetched.metadata.clone(),
            content_hash: fetched.content_hash.clone(),
            updated_at: Utc::now(),
        });

        // Step 7: persist (explicit/structural relationships from the parser
        // go in with the initial store; domain relationships need assigned
        // element pks and run after, see below).
        self.storage
            .store_document(&document, &parsed.elements, &parsed.relationships, &parsed.element_dates)
            .await?;
        if let Some(hash) = &fetched.content_hash {
            self.storage.update_processing_history(&item.doc_id, hash).await?;
        }

        // Step 6 (domain half) + ontology persistence: runs after store_document
        // because ElementTermMapping requires the backend-assigned element_pk.
        if let Err(e) = self
            .relationship_detector
            .detect_relationships(&item.doc_id, &self.ontology)
            .await
        {
            warn!(doc_id = %item.doc_id, error = %e, "domain relationship detection failed");
        }

        // Step 8: embeddings.
        if let Some(provider) = &self.embedding_provider {
            for element in &parsed.elements {
                match provider.embed(&element.content_preview).await {
                    Ok(embedding) => {
                        if let Err(e) = self.storage.store_embedding(element.element_pk, &embedding).await {
                            warn!(element_pk = element.element_pk, error = %e, "failed to store embedding");
                        }
                    }
                    Err(e) => warn!(element_pk = element.element_pk, error = %e, "embedding generation failed"),
                }
            }
        }

        // Step 9: bounded link discovery.
        let max_link_depth = item.max_link_depth();
        if item.link_depth < max_link_depth {
            let links = source
                .follow_links(&fetched.content, &item.doc_id, item.link_depth, &Default::default())
                .await?;
            for link in links {
                self.queue
                    .add_linked_document(
                        &self.run_id,
                        &item.doc_id,
                        &link.id,
                        &item.source_name,
                        item.link_depth + 1,
                        &self.worker_id,
                        &link.link_type,
                    )
                    .await?;
            }
        }

        Ok(ProcessedOutcome {
            content_hash: fetched.content_hash,
            file_size: Some(fetched.content.len() as i64),
        })
    }

    /// Step 11: critical errors and exhausted retries go straight to the
    /// DLQ; everything else is a scheduled retry via `mark_failed`.
    async fn handle_failure(&self, item: &QueueItem, error: anyhow::Error) -> Result<()> {
        let (error_type, message) = classify_error(&error);
        let error_details = json!({
            "error_type": error_type,
            "worker_id": self.worker_id,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let critical = PipelineError::is_critical(&error_type, &message);
        let retries_exhausted = item.retry_count >= item.max_retries;

        if critical {
            info!(doc_id = %item.doc_id, error_type = %error_type, "routing to dead-letter queue (critical error)");
            self.dead_letter
                .move_to_dead_letter(
                    item.queue_id,
                    &item.run_id,
                    &item.doc_id,
                    &item.source_name,
                    &message,
                    error_details,
                    item.retry_count,
                    serde_json::to_value(item).unwrap_or(serde_json::Value::Null),
                )
                .await?;
            return Ok(());
        }

        let terminally_failed = self
            .queue
            .mark_failed(item.queue_id, &message, Some(error_details.clone()))
            .await?;

        if terminally_failed {
            info!(doc_id = %item.doc_id, "routing to dead-letter queue (retries exhausted)");
            self.dead_letter
                .move_to_dead_letter(
                    item.queue_id,
                    &item.run_id,
                    &item.doc_id,
                    &item.source_name,
                    &message,
                    error_details,
                    item.retry_count,
                    serde_json::to_value(item).unwrap_or(serde_json::Value::Null),
                )
                .await?;
        } else if retries_exhausted {
            // Shouldn't happen: mark_failed already routes to `failed` once
            // retry_count >= max_retries. Defensive log only.
            warn!(doc_id = %item.doc_id, "retry budget exhausted but queue did not report terminal failure");
        }

        Ok(())
    }
}

struct ProcessedOutcome {
    content_hash: Option<String>,
    file_size: Option<i64>,
}

/// Extracts an `(error_type, message)` pair for DLQ diagnostics. Errors
/// produced as [`PipelineError::Critical`] carry an explicit type name;
/// everything else is classified by message substring only.
fn classify_error(error: &anyhow::Error) -> (String, String) {
    if let Some(PipelineError::Critical { error_type, message }) = error.downcast_ref::<PipelineError>() {
        return (error_type.clone(), message.clone());
    }
    ("Error".to_string(), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_error_extracts_critical_error_type() {
        let err = anyhow::Error::from(PipelineError::Critical {
            error_type: "UnsupportedFileFormatError".to_string(),
            message: "cannot parse .xyz".to_string(),
        });
        let (error_type, message) = classify_error(&err);
        assert_eq!(error_type, "UnsupportedFileFormatError");
        assert_eq!(message, "cannot parse .xyz");
        assert!(PipelineError::is_critical(&error_type, &message));
    }

    #[test]
    fn classify_error_falls_back_to_message_substring_match() {
        let err = anyhow::anyhow!("Authentication failed for remote host");
        let (error_type, message) = classify_error(&err);
        assert!(PipelineError::is_critical(&error_type, &message));
    }

    #[test]
    fn classify_error_non_critical_transient() {
        let err = anyhow::anyhow!("connection reset by peer");
        let (error_type, message) = classify_error(&err);
        assert!(!PipelineError::is_critical(&error_type, &message));
    }
}
