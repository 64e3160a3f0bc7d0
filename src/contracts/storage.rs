//! The capability-gated storage contract.
//!
//! The reference implementation dispatches on runtime type checks and
//! optional method overrides. Here a backend declares a fixed
//! [`BackendCapabilities`] set up front; the core checks requirements against
//! it before dispatching a call, so an unsupported operation surfaces a typed
//! [`UnsupportedSearchError`] instead of a runtime `AttributeError`-style
//! failure.

use crate::error::{BackendCapability, UnsupportedSearchError};
use crate::model::ElementRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;

/// The set of optional capabilities a backend declares support for. Core
/// required operations (document/element/relationship CRUD, processing
/// history) are not gated — every backend must implement them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    supported: HashSet<BackendCapability>,
}

impl BackendCapabilities {
    pub fn new(supported: impl IntoIterator<Item = BackendCapability>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
        }
    }

    pub fn supports(&self, capability: BackendCapability) -> bool {
        self.supported.contains(&capability)
    }

    /// Validate that every capability in `needed` is declared, returning a
    /// typed error listing everything missing otherwise.
    pub fn require(&self, needed: &[BackendCapability]) -> Result<(), UnsupportedSearchError> {
        let missing: Vec<BackendCapability> = needed
            .iter()
            .copied()
            .filter(|c| !self.supported.contains(c))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(UnsupportedSearchError::new(missing))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub doc_id: String,
    pub source_name: String,
    pub metadata: JsonValue,
    pub content_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRelationship {
    pub source_element_id: String,
    pub target_element_id: String,
    pub relationship_type: String,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDate {
    pub element_pk: i64,
    pub date_value: DateTime<Utc>,
    pub date_type: String,
    pub raw_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastProcessedInfo {
    pub doc_id: String,
    pub content_hash: Option<String>,
    pub last_modified: Option<String>,
    pub last_processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermStatistic {
    pub term_id: String,
    pub domain: String,
    pub usage_count: i64,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub entity_type: String,
    pub name: String,
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relationship_type: String,
    pub attributes: JsonValue,
}

/// A scored hit from an embedding or text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub element_pk: i64,
    pub score: f64,
}

/// A backend-specific query handed to `execute_structured_search`, e.g. a
/// structured filter expression the core does not need to understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub query: JsonValue,
}

/// Everything the core requires of a persistence backend.
/// [`crate::storage::postgres::PostgresStorage`] is the one concrete
/// implementation shipped with this crate.
#[async_trait]
pub trait Storage: Send + Sync {
    fn capabilities(&self) -> &BackendCapabilities;

    // --- document + element + relationship persistence (unconditional) ---

    async fn store_document(
        &self,
        document: &PersistedDocument,
        elements: &[ElementRecord],
        relationships: &[StoredRelationship],
        element_dates: &[ElementDate],
    ) -> Result<()>;

    async fn update_document(&self, document: &PersistedDocument) -> Result<()>;

    async fn get_document(&self, doc_id: &str) -> Result<Option<PersistedDocument>>;

    async fn get_document_elements(&self, doc_id: &str) -> Result<Vec<ElementRecord>>;

    async fn get_document_relationships(&self, doc_id: &str) -> Result<Vec<StoredRelationship>>;

    async fn delete_document(&self, doc_id: &str) -> Result<bool>;

    /// Append relationships discovered by a post-storage pass (domain
    /// evaluation, cross-document detection) — distinct from the bulk
    /// relationships passed to `store_document` at ingest time.
    async fn store_relationships(&self, doc_id: &str, relationships: &[StoredRelationship]) -> Result<()>;

    async fn get_element(&self, element_pk: i64) -> Result<Option<ElementRecord>>;

    /// Ancestor chain for an element, nearest first. Lets the evaluator
    /// resolve hierarchy-level constraints deeper than one hop without
    /// walking `parent_id` itself.
    async fn get_ancestors(&self, element_pk: i64, depth: u32) -> Result<Vec<ElementRecord>>;

    async fn get_elements_by_document(&self, doc_id: &str) -> Result<Vec<ElementRecord>> {
        self.get_document_elements(doc_id).await
    }

    // --- change detection / idempotency (unconditional) ---

    async fn get_last_processed_info(&self, doc_id: &str) -> Result<Option<LastProcessedInfo>>;

    async fn update_processing_history(&self, doc_id: &str, content_hash: &str) -> Result<()>;

    // --- embeddings (capability-gated) ---

    async fn store_embedding(&self, element_pk: i64, embedding: &[f32]) -> Result<()>;

    async fn get_embedding(&self, element_pk: i64) -> Result<Option<Vec<f32>>>;

    async fn search_by_embedding(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        self.capabilities()
            .require(&[BackendCapability::EmbeddingSearch])?;
        self.search_by_embedding_impl(embedding, limit).await
    }

    /// Backend-specific implementation; not called directly — go through
    /// [`Storage::search_by_embedding`] so the capability check always runs.
    async fn search_by_embedding_impl(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    async fn search_by_text(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.capabilities().require(&[BackendCapability::TextSearch])?;
        self.search_by_text_impl(query, limit).await
    }

    async fn search_by_text_impl(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;

    // --- element dates (capability-gated) ---

    async fn store_element_dates(&self, element_pk: i64, dates: &[ElementDate]) -> Result<()> {
        self.capabilities().require(&[BackendCapability::ElementDates])?;
        self.store_element_dates_impl(element_pk, dates).await
    }

    async fn store_element_dates_impl(&self, element_pk: i64, dates: &[ElementDate]) -> Result<()>;

    async fn get_element_dates(&self, element_pk: i64) -> Result<Vec<ElementDate>> {
        self.capabilities().require(&[BackendCapability::ElementDates])?;
        self.get_element_dates_impl(element_pk).await
    }

    async fn get_element_dates_impl(&self, element_pk: i64) -> Result<Vec<ElementDate>>;

    async fn search_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ElementDate>> {
        self.capabilities()
            .require(&[BackendCapability::DateRangeSearch])?;
        self.search_by_date_range_impl(from, to).await
    }

    async fn search_by_date_range_impl(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ElementDate>>;

    // --- domain-ontology mappings (capability-gated) ---

    async fn store_element_term_mappings(
        &self,
        element_pk: i64,
        mappings: &[crate::ontology::evaluator::ElementTermMapping],
    ) -> Result<()> {
        self.capabilities()
            .require(&[BackendCapability::DomainMappings])?;
        self.store_element_term_mappings_impl(element_pk, mappings).await
    }

    async fn store_element_term_mappings_impl(
        &self,
        element_pk: i64,
        mappings: &[crate::ontology::evaluator::ElementTermMapping],
    ) -> Result<()>;

    async fn find_elements_by_term(&self, domain: &str, term_id: &str) -> Result<Vec<ElementRecord>> {
        self.capabilities()
            .require(&[BackendCapability::DomainMappings])?;
        self.find_elements_by_term_impl(domain, term_id).await
    }

    async fn find_elements_by_term_impl(
        &self,
        domain: &str,
        term_id: &str,
    ) -> Result<Vec<ElementRecord>>;

    async fn get_term_statistics(&self, domain: Option<&str>) -> Result<Vec<TermStatistic>> {
        self.capabilities()
            .require(&[BackendCapability::DomainMappings])?;
        self.get_term_statistics_impl(domain).await
    }

    async fn get_term_statistics_impl(&self, domain: Option<&str>) -> Result<Vec<TermStatistic>>;

    // --- entity graph (capability-gated) ---

    async fn upsert_entity(&self, entity: &Entity) -> Result<()> {
        self.capabilities().require(&[BackendCapability::EntityGraph])?;
        self.upsert_entity_impl(entity).await
    }

    async fn upsert_entity_impl(&self, entity: &Entity) -> Result<()>;

    async fn delete_entity(&self, entity_id: &str) -> Result<bool> {
        self.capabilities().require(&[BackendCapability::EntityGraph])?;
        self.delete_entity_impl(entity_id).await
    }

    async fn delete_entity_impl(&self, entity_id: &str) -> Result<bool>;

    async fn upsert_entity_relationship(&self, relationship: &EntityRelationship) -> Result<()> {
        self.capabilities().require(&[BackendCapability::EntityGraph])?;
        self.upsert_entity_relationship_impl(relationship).await
    }

    async fn upsert_entity_relationship_impl(&self, relationship: &EntityRelationship) -> Result<()>;

    // --- structured search escape hatch (capability-gated) ---

    async fn execute_structured_search(&self, query: &StructuredQuery) -> Result<Vec<SearchHit>> {
        self.capabilities()
            .require(&[BackendCapability::StructuredSearch])?;
        self.execute_structured_search_impl(query).await
    }

    async fn execute_structured_search_impl(&self, query: &StructuredQuery) -> Result<Vec<SearchHit>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_require_reports_all_missing() {
        let caps = BackendCapabilities::new([BackendCapability::TextSearch]);
        let err = caps
            .require(&[BackendCapability::EmbeddingSearch, BackendCapability::EntityGraph])
            .unwrap_err();
        assert_eq!(
            err.missing,
            vec![BackendCapability::EmbeddingSearch, BackendCapability::EntityGraph]
        );
    }

    #[test]
    fn capability_require_ok_when_declared() {
        let caps = BackendCapabilities::new([BackendCapability::TextSearch, BackendCapability::EntityGraph]);
        assert!(caps.require(&[BackendCapability::TextSearch]).is_ok());
    }
}
