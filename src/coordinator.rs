//! `ProcessingCoordinator`, grounded on
//! [`crate::run_coordinator::RunCoordinator`] for run lifecycle and
//! `supabase_repository`'s transactional-upsert idiom for seeding.

use crate::config::PipelineConfig;
use crate::content_source::{self, ContentSourceRegistry};
use crate::contracts::{EmbeddingProvider, Storage};
use crate::model::{RunStats, SourceType};
use crate::ontology::OntologyManager;
use crate::queue::WorkQueue;
use crate::relationships::DomainRelationshipDetector;
use crate::run_coordinator::{run_id_from_config, RunCoordinator};
use anyhow::Result;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

pub struct ProcessingCoordinator {
    coordinator_id: String,
    run_coordinator: RunCoordinator,
    queue: Arc<dyn WorkQueue>,
    storage: Arc<dyn Storage>,
    content_sources: ContentSourceRegistry,
    ontology: Arc<OntologyManager>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl ProcessingCoordinator {
    pub fn new(
        coordinator_id: String,
        run_coordinator: RunCoordinator,
        queue: Arc<dyn WorkQueue>,
        storage: Arc<dyn Storage>,
        content_sources: ContentSourceRegistry,
        ontology: Arc<OntologyManager>,
        embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            coordinator_id,
            run_coordinator,
            queue,
            storage,
            content_sources,
            ontology,
            embedding_provider,
        }
    }

    /// Materialize a run, seed every configured source's
    /// documents, wait for quiescence, then run post-processing.
    #[instrument(skip(self, config))]
    pub async fn coordinate_processing_run(&self, config: &PipelineConfig) -> Result<RunStats> {
        let started = Instant::now();
        let run_id = run_id_from_config(config);
        self.run_coordinator.ensure_run_exists(&run_id, config).await?;

        self.discover_and_queue_documents(&run_id, config).await?;

        self.wait_for_processing_completion(&run_id, &config.worker.check_interval(), config.worker.max_wait_time())
            .await;

        let cross_document_relationships = self.perform_post_processing(&run_id, config).await;

        let status = self.queue.get_queue_status(&run_id).await?;
        Ok(RunStats {
            run_id,
            coordinator_id: self.coordinator_id.clone(),
            documents_queued: status.total,
            documents_processed: status.completed,
            documents_failed: status.failed,
            cross_document_relationships,
            total_runtime_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Instantiate every configured source via the
    /// factory, register it, and enqueue its documents at `link_depth=0`.
    async fn discover_and_queue_documents(&self, run_id: &str, config: &PipelineConfig) -> Result<()> {
        for (index, source_config) in config.content_sources.iter().enumerate() {
            let name = source_config
                .get("name")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("source-{index}"));

            let source = content_source::create(&name, source_config)?;
            self.content_sources.register(source.clone());

            let max_link_depth = source_config
                .get("max_link_depth")
                .and_then(JsonValue::as_i64)
                .unwrap_or(1);

            let documents = source.list_documents().await?;
            info!(source = %name, count = documents.len(), "discovered documents");

            for doc in documents {
                let metadata = json!({
                    "max_link_depth": max_link_depth,
                    "source_config": source_config,
                    "discovered_metadata": doc.metadata,
                });
                self.queue
                    .add_document(run_id, &doc.id, &name, SourceType::Configured, None, 0, metadata)
                    .await?;
            }
        }
        Ok(())
    }

    /// Poll until `pending + processing + retry == 0`,
    /// logging every 60s, aborting (not failing) at `max_wait_time`.
    async fn wait_for_processing_completion(
        &self,
        run_id: &str,
        check_interval: &std::time::Duration,
        max_wait_time: std::time::Duration,
    ) {
        let started = Instant::now();
        let mut last_logged = Instant::now();
        loop {
            match self.queue.get_queue_status(run_id).await {
                Ok(status) => {
                    if status.pending + status.processing + status.retry == 0 {
                        info!(run_id, "processing run reached quiescence");
                        return;
                    }
                    if last_logged.elapsed() >= std::time::Duration::from_secs(60) {
                        info!(
                            run_id,
                            pending = status.pending,
                            processing = status.processing,
                            retry = status.retry,
                            completed = status.completed,
                            "waiting for processing run to quiesce"
                        );
                        last_logged = Instant::now();
                    }
                }
                Err(e) => warn!(run_id, error = %e, "failed to poll queue status while waiting"),
            }

            if started.elapsed() >= max_wait_time {
                error!(run_id, "timed out waiting for processing run to quiesce; proceeding anyway");
                return;
            }

            sleep(*check_interval).await;
        }
    }

    /// Cross-document relationships over the run's
    /// completed documents. Failures are logged, never fail the run.
    async fn perform_post_processing(&self, run_id: &str, config: &PipelineConfig) -> i64 {
        if !config.is_embedding_enabled() {
            return 0;
        }

        let completed_docs = match self.completed_doc_ids(run_id).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(run_id, error = %e, "post-processing: failed to list completed documents");
                return 0;
            }
        };

        if completed_docs.len() < 2 {
            return 0;
        }

        let detector = DomainRelationshipDetector::new(self.storage.clone(), self.embedding_provider.clone());
        match detector
            .detect_cross_document_relationships(&completed_docs, &self.ontology)
            .await
        {
            Ok(relationships) => relationships.len() as i64,
            Err(e) => {
                warn!(run_id, doc_count = completed_docs.len(), error = %e, "cross-document relationship detection failed");
                0
            }
        }
    }

    async fn completed_doc_ids(&self, run_id: &str) -> Result<Vec<String>> {
        self.queue.completed_document_ids(run_id).await
    }
}
