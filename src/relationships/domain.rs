//! `DomainRelationshipDetector`, grounded on `relationships/domain.py`.

use crate::contracts::storage::StoredRelationship;
use crate::contracts::{EmbeddingProvider, Storage};
use crate::model::ElementRecord;
use crate::ontology::evaluator::{DomainRelationship, ElementTermMapping, OntologyEvaluator};
use crate::ontology::OntologyManager;
use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// How many hierarchy levels to materialize onto `ElementRecord.attributes`
/// before evaluation, so the evaluator can check `hierarchy_level` up to
/// this depth without touching storage itself.
const MAX_HIERARCHY_DEPTH: u32 = 8;

/// Detector-level floor applied to every Phase A mapping before it is
/// persisted or used as a relationship candidate.
const DEFAULT_MIN_MAPPING_CONFIDENCE: f64 = 0.5;

/// Detector-level floor applied on top of each relationship rule's own
/// `confidence.minimum`.
const DEFAULT_MIN_RELATIONSHIP_CONFIDENCE: f64 = 0.6;

pub struct DomainRelationshipDetector {
    storage: Arc<dyn Storage>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    min_mapping_confidence: f64,
    min_relationship_confidence: f64,
}

impl DomainRelationshipDetector {
    pub fn new(storage: Arc<dyn Storage>, embedding_provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            storage,
            embedding_provider,
            min_mapping_confidence: DEFAULT_MIN_MAPPING_CONFIDENCE,
            min_relationship_confidence: DEFAULT_MIN_RELATIONSHIP_CONFIDENCE,
        }
    }

    pub fn with_thresholds(mut self, min_mapping_confidence: f64, min_relationship_confidence: f64) -> Self {
        self.min_mapping_confidence = min_mapping_confidence;
        self.min_relationship_confidence = min_relationship_confidence;
        self
    }

    /// Materialize each element's ancestor chain (nearest first) into
    /// `attributes.ancestor_ids`, and its embedding, for evaluation.
    async fn prepare_elements(
        &self,
        elements: &[ElementRecord],
    ) -> Result<HashMap<String, (ElementRecord, Option<Vec<f32>>)>> {
        let mut lookup = HashMap::with_capacity(elements.len());
        for element in elements {
            let mut prepared = element.clone();
            let ancestors = self
                .storage
                .get_ancestors(element.element_pk, MAX_HIERARCHY_DEPTH)
                .await?;
            let ancestor_ids: Vec<_> = ancestors.iter().map(|a| json!(a.element_id)).collect();
            prepared
                .attributes
                .insert("ancestor_ids".to_string(), serde_json::Value::Array(ancestor_ids));

            let embedding = if let Some(provider) = &self.embedding_provider {
                provider.embed(&element.content_preview).await.ok()
            } else {
                self.storage.get_embedding(element.element_pk).await.unwrap_or(None)
            };

            lookup.insert(element.element_id.clone(), (prepared, embedding));
        }
        Ok(lookup)
    }

    /// Phase A + Phase B for a single document against every active ontology
    ///, persisting element→term mappings and relationships.
    #[instrument(skip(self, ontologies), fields(doc_id = %doc_id))]
    pub async fn detect_relationships(
        &self,
        doc_id: &str,
        ontologies: &OntologyManager,
    ) -> Result<Vec<DomainRelationship>> {
        let elements = self.storage.get_document_elements(doc_id).await?;
        if elements.is_empty() {
            return Ok(Vec::new());
        }
        let element_lookup = self.prepare_elements(&elements).await?;

        let mut all_relationships = Vec::new();
        for ontology in ontologies.get_active_ontologies() {
            let evaluator = OntologyEvaluator::new(ontology, self.embedding_provider.clone());

            let mut elements_with_terms: HashMap<String, Vec<ElementTermMapping>> = HashMap::new();
            for element in elements.iter() {
                let embedding = element_lookup.get(&element.element_id).and_then(|(_, e)| e.as_deref());
                let mappings: Vec<ElementTermMapping> = evaluator
                    .map_element_to_terms(element, embedding)
                    .await
                    .into_iter()
                    .filter(|m| m.confidence >= self.min_mapping_confidence)
                    .collect();
                if mappings.is_empty() {
                    continue;
                }
                if let Err(e) = self
                    .storage
                    .store_element_term_mappings(element.element_pk, &mappings)
                    .await
                {
                    warn!(element_pk = element.element_pk, error = %e, "failed to persist term mappings");
                }
                for mapping in mappings {
                    elements_with_terms
                        .entry(mapping.term_id.clone())
                        .or_default()
                        .push(mapping);
                }
            }

            let relationships: Vec<DomainRelationship> = evaluator
                .discover_relationships(&elements_with_terms, &element_lookup)
                .await
                .into_iter()
                .filter(|r| r.confidence >= self.min_relationship_confidence)
                .collect();
            info!(domain = %ontology.name, count = relationships.len(), "discovered domain relationships");
            all_relationships.extend(relationships);
        }

        if !all_relationships.is_empty() {
            let stored: Vec<StoredRelationship> = all_relationships
                .iter()
                .map(|r| StoredRelationship {
                    source_element_id: r.source_element_id.clone(),
                    target_element_id: r.target_element_id.clone(),
                    relationship_type: r.relationship_type.clone(),
                    metadata: r.to_dict(),
                })
                .collect();
            self.storage.store_relationships(doc_id, &stored).await?;
        }

        Ok(all_relationships)
    }

    /// Cross-document relationship discovery: pool every element across
    /// `doc_ids` into one evaluation, keeping only relationships whose
    /// endpoints land in different documents, then persist each one tagged
    /// with `cross_document`/`source_doc`/`target_doc` metadata.
    #[instrument(skip(self, ontologies, doc_ids), fields(doc_count = doc_ids.len()))]
    pub async fn detect_cross_document_relationships(
        &self,
        doc_ids: &[String],
        ontologies: &OntologyManager,
    ) -> Result<Vec<DomainRelationship>> {
        let mut elements = Vec::new();
        for doc_id in doc_ids {
            elements.extend(self.storage.get_document_elements(doc_id).await?);
        }
        if elements.is_empty() {
            return Ok(Vec::new());
        }

        let element_lookup = self.prepare_elements(&elements).await?;
        let doc_of: HashMap<&str, &str> = elements.iter().map(|e| (e.element_id.as_str(), e.doc_id.as_str())).collect();

        let mut cross_doc = Vec::new();
        for ontology in ontologies.get_active_ontologies() {
            let evaluator = OntologyEvaluator::new(ontology, self.embedding_provider.clone());

            let mut elements_with_terms: HashMap<String, Vec<ElementTermMapping>> = HashMap::new();
            for element in elements.iter() {
                let embedding = element_lookup.get(&element.element_id).and_then(|(_, e)| e.as_deref());
                let mappings = evaluator
                    .map_element_to_terms(element, embedding)
                    .await
                    .into_iter()
                    .filter(|m| m.confidence >= self.min_mapping_confidence);
                for mapping in mappings {
                    elements_with_terms.entry(mapping.term_id.clone()).or_default().push(mapping);
                }
            }

            let relationships = evaluator
                .discover_relationships(&elements_with_terms, &element_lookup)
                .await;
            cross_doc.extend(relationships.into_iter().filter(|r| {
                r.confidence >= self.min_relationship_confidence
                    && doc_of.get(r.source_element_id.as_str()) != doc_of.get(r.target_element_id.as_str())
            }));
        }

        let mut by_doc: HashMap<&str, Vec<StoredRelationship>> = HashMap::new();
        for relationship in &mut cross_doc {
            let source_doc = doc_of.get(relationship.source_element_id.as_str()).copied().unwrap_or_default();
            let target_doc = doc_of.get(relationship.target_element_id.as_str()).copied().unwrap_or_default();
            if let Some(obj) = relationship.metadata.as_object_mut() {
                obj.insert("cross_document".to_string(), json!(true));
                obj.insert("source_doc".to_string(), json!(source_doc));
                obj.insert("target_doc".to_string(), json!(target_doc));
            }
            by_doc.entry(source_doc).or_default().push(StoredRelationship {
                source_element_id: relationship.source_element_id.clone(),
                target_element_id: relationship.target_element_id.clone(),
                relationship_type: relationship.relationship_type.clone(),
                metadata: relationship.to_dict(),
            });
        }
        for (doc_id, stored) in by_doc {
            self.storage.store_relationships(doc_id, &stored).await?;
        }

        Ok(cross_doc)
    }

    /// Term usage report across one or more domains,
    /// grounded on `relationships/domain.py`'s `get_term_usage_report`.
    pub async fn term_usage_report(&self, domain: Option<&str>) -> Result<Vec<crate::contracts::storage::TermStatistic>> {
        self.storage.get_term_statistics(domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_hierarchy_depth_is_positive() {
        assert!(MAX_HIERARCHY_DEPTH > 0);
    }
}
