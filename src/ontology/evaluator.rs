//! Element-to-term mapping and relationship discovery.
//!
//! Grounded on `domain/evaluator.py`'s `OntologyEvaluator`. The Python
//! original's hierarchy-level constraint only walks `parent_id` one hop
//! (a TODO in the reference: "need to look up parent's parent from storage").
//! This implementation resolves arbitrary depth by having callers
//! materialize an `ancestor_ids` attribute (nearest ancestor first) onto
//! each [`ElementRecord`] before evaluation — see
//! `relationships::domain::DomainRelationshipDetector::prepare_elements`,
//! which populates it from `Storage::get_ancestors`.

use crate::contracts::EmbeddingProvider;
use crate::model::ElementRecord;
use crate::ontology::model::{DomainOntology, MappingRule, RelationshipDirection, RelationshipRule};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementTermMapping {
    pub element_pk: i64,
    pub element_id: String,
    pub term_id: String,
    pub domain: String,
    pub confidence: f64,
    pub mapping_rule: String,
}

impl ElementTermMapping {
    pub fn to_dict(&self) -> JsonValue {
        serde_json::to_value(self).expect("ElementTermMapping always serializes")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRelationship {
    pub source_element_id: String,
    pub target_element_id: String,
    pub relationship_type: String,
    pub domain: String,
    pub confidence: f64,
    pub source_term: String,
    pub target_term: String,
    pub metadata: JsonValue,
}

impl DomainRelationship {
    pub fn to_dict(&self) -> JsonValue {
        serde_json::to_value(self).expect("DomainRelationship always serializes")
    }
}

pub struct OntologyEvaluator<'a> {
    ontology: &'a DomainOntology,
    embedding_provider: Option<std::sync::Arc<dyn EmbeddingProvider>>,
    phrase_embeddings: Mutex<HashMap<String, Vec<f32>>>,
}

impl<'a> OntologyEvaluator<'a> {
    pub fn new(
        ontology: &'a DomainOntology,
        embedding_provider: Option<std::sync::Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            ontology,
            embedding_provider,
            phrase_embeddings: Mutex::new(HashMap::new()),
        }
    }

    async fn phrase_embedding(&self, phrase: &str) -> anyhow::Result<Vec<f32>> {
        if let Some(cached) = self.phrase_embeddings.lock().unwrap().get(phrase).cloned() {
            return Ok(cached);
        }
        let provider = self
            .embedding_provider
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("semantic rule requires an embedding provider"))?;
        let embedding = provider.embed(phrase).await?;
        self.phrase_embeddings
            .lock()
            .unwrap()
            .insert(phrase.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// Phase A: evaluate every `(term, rule)` pair against one
    /// element, emitting a mapping for each rule that fires.
    pub async fn map_element_to_terms(
        &self,
        element: &ElementRecord,
        element_embedding: Option<&[f32]>,
    ) -> Vec<ElementTermMapping> {
        let mut mappings = Vec::new();
        for mapping in &self.ontology.element_mappings {
            for rule in &mapping.rules {
                if !rule.matches_element_type(&element.element_type) {
                    continue;
                }
                let confidence = self
                    .evaluate_mapping_rule(rule, element, element_embedding)
                    .await;
                if let Some(confidence) = confidence {
                    mappings.push(ElementTermMapping {
                        element_pk: element.element_pk,
                        element_id: element.element_id.clone(),
                        term_id: mapping.term_id.clone(),
                        domain: self.ontology.name.clone(),
                        confidence,
                        mapping_rule: rule_kind(rule).to_string(),
                    });
                }
            }
        }
        mappings
    }

    async fn evaluate_mapping_rule(
        &self,
        rule: &MappingRule,
        element: &ElementRecord,
        element_embedding: Option<&[f32]>,
    ) -> Option<f64> {
        match rule {
            MappingRule::Semantic {
                semantic_phrase,
                confidence_threshold,
                ..
            } => {
                let element_embedding = element_embedding?;
                let phrase_embedding = self.phrase_embedding(semantic_phrase).await.ok()?;
                let similarity = cosine_similarity(element_embedding, &phrase_embedding);
                (similarity >= *confidence_threshold).then_some(similarity)
            }
            MappingRule::Regex { .. } | MappingRule::Keywords { .. } => {
                let pattern = rule.compile_pattern().ok()??;
                pattern.is_match(&element.content_preview).then_some(1.0)
            }
        }
    }

    /// Phase B: cross-product candidate pairs per
    /// relationship rule, apply constraints, score, and emit.
    pub async fn discover_relationships(
        &self,
        elements_with_terms: &HashMap<String, Vec<ElementTermMapping>>,
        element_lookup: &HashMap<String, (ElementRecord, Option<Vec<f32>>)>,
    ) -> Vec<DomainRelationship> {
        let mut out = Vec::new();
        for rule in &self.ontology.relationship_rules {
            let Some(sources) = elements_with_terms.get(&rule.source.term_id) else {
                continue;
            };
            let Some(targets) = elements_with_terms.get(&rule.target.term_id) else {
                continue;
            };

            for src_mapping in sources {
                for tgt_mapping in targets {
                    if src_mapping.element_id == tgt_mapping.element_id {
                        continue;
                    }
                    let Some((src_elem, src_embedding)) = element_lookup.get(&src_mapping.element_id)
                    else {
                        continue;
                    };
                    let Some((tgt_elem, tgt_embedding)) = element_lookup.get(&tgt_mapping.element_id)
                    else {
                        continue;
                    };

                    if !check_constraints(rule, src_elem, tgt_elem) {
                        continue;
                    }

                    let Some(relationship) = self
                        .evaluate_relationship_rule(
                            rule,
                            src_mapping,
                            tgt_mapping,
                            src_embedding.as_deref(),
                            tgt_embedding.as_deref(),
                        )
                        .await
                    else {
                        continue;
                    };

                    if rule.bidirectional {
                        let mut reverse = relationship.clone();
                        std::mem::swap(&mut reverse.source_element_id, &mut reverse.target_element_id);
                        std::mem::swap(&mut reverse.source_term, &mut reverse.target_term);
                        if let Some(obj) = reverse.metadata.as_object_mut() {
                            obj.insert("bidirectional".to_string(), json!(true));
                        }
                        out.push(reverse);
                    }

                    out.push(relationship);
                }
            }
        }
        out
    }

    async fn evaluate_relationship_rule(
        &self,
        rule: &RelationshipRule,
        src_mapping: &ElementTermMapping,
        tgt_mapping: &ElementTermMapping,
        src_embedding: Option<&[f32]>,
        tgt_embedding: Option<&[f32]>,
    ) -> Option<DomainRelationship> {
        let (src_embedding, tgt_embedding) = (src_embedding?, tgt_embedding?);

        let src_phrase = self.phrase_embedding(&rule.source.semantic_phrase).await.ok()?;
        let tgt_phrase = self.phrase_embedding(&rule.target.semantic_phrase).await.ok()?;

        let source_similarity = cosine_similarity(src_embedding, &src_phrase);
        let target_similarity = cosine_similarity(tgt_embedding, &tgt_phrase);

        if source_similarity < rule.source.confidence_threshold
            || target_similarity < rule.target.confidence_threshold
        {
            return None;
        }

        let combined = rule.confidence.calculate(source_similarity, target_similarity);
        if combined < rule.confidence.minimum {
            return None;
        }

        Some(DomainRelationship {
            source_element_id: src_mapping.element_id.clone(),
            target_element_id: tgt_mapping.element_id.clone(),
            relationship_type: rule.relationship_type.clone(),
            domain: self.ontology.name.clone(),
            confidence: combined,
            source_term: rule.source.term_id.clone(),
            target_term: rule.target.term_id.clone(),
            metadata: json!({
                "rule_id": rule.id,
                "source_similarity": source_similarity,
                "target_similarity": target_similarity,
                "source_mapping_confidence": src_mapping.confidence,
                "target_mapping_confidence": tgt_mapping.confidence,
            }),
        })
    }
}

fn rule_kind(rule: &MappingRule) -> &'static str {
    match rule {
        MappingRule::Semantic { .. } => "semantic",
        MappingRule::Regex { .. } => "regex",
        MappingRule::Keywords { .. } => "keywords",
    }
}

/// `ancestor_ids` on an [`ElementRecord`] is nearest-ancestor-first: index 0
/// is the immediate parent, index 1 the grandparent, and so on.
fn ancestor_at(element: &ElementRecord, level: i32) -> Option<String> {
    if level == 0 {
        return element.parent_id.clone();
    }
    element
        .attributes
        .get("ancestor_ids")
        .and_then(JsonValue::as_array)
        .and_then(|ids| ids.get(level as usize))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

fn check_constraints(rule: &RelationshipRule, source: &ElementRecord, target: &ElementRecord) -> bool {
    if let Some(constraints) = &rule.constraints {
        match constraints.hierarchy_level {
            None => {}
            Some(-1) => {
                if source.doc_id != target.doc_id {
                    return false;
                }
            }
            Some(level) => {
                let src_ancestor = ancestor_at(source, level);
                let tgt_ancestor = ancestor_at(target, level);
                match (src_ancestor, tgt_ancestor) {
                    (Some(a), Some(b)) if a == b => {}
                    _ => return false,
                }
            }
        }

        match constraints.direction {
            RelationshipDirection::Forward => {
                match (source.document_position, target.document_position) {
                    (Some(s), Some(t)) if s < t => {}
                    _ => return false,
                }
            }
            RelationshipDirection::Backward => {
                match (source.document_position, target.document_position) {
                    (Some(s), Some(t)) if s > t => {}
                    _ => return false,
                }
            }
            RelationshipDirection::Any => {}
        }
    }
    true
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::model::{
        ConfidenceCalculation, DomainSettings, ElementMapping, RelationshipConfidence,
        RelationshipConstraints, RelationshipEndpoint,
    };

    fn element(id: &str, doc: &str, parent: Option<&str>, pos: i64) -> ElementRecord {
        ElementRecord {
            element_pk: 1,
            element_id: id.into(),
            doc_id: doc.into(),
            element_type: "paragraph".into(),
            content_preview: "the front brake lever engages the caliper".into(),
            parent_id: parent.map(str::to_string),
            document_position: Some(pos),
            attributes: Default::default(),
        }
    }

    fn ontology_with_keyword_rule() -> DomainOntology {
        DomainOntology {
            name: "vehicles".into(),
            version: "1".into(),
            description: String::new(),
            settings: DomainSettings::default(),
            terms: vec![
                crate::ontology::model::Term {
                    id: "brake".into(),
                    label: "Brake".into(),
                    description: String::new(),
                    aliases: vec![],
                },
            ],
            element_mappings: vec![ElementMapping {
                term_id: "brake".into(),
                rules: vec![MappingRule::Keywords {
                    keywords: vec!["brake".into()],
                    word_boundary: true,
                    element_types: Default::default(),
                }],
            }],
            relationship_rules: vec![],
        }
    }

    #[tokio::test]
    async fn keyword_rule_maps_matching_element() {
        let ontology = ontology_with_keyword_rule();
        let evaluator = OntologyEvaluator::new(&ontology, None);
        let elem = element("e1", "d1", None, 0);
        let mappings = evaluator.map_element_to_terms(&elem, None).await;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].confidence, 1.0);
        assert_eq!(mappings[0].mapping_rule, "keywords");
    }

    #[tokio::test]
    async fn keyword_rule_skips_non_matching_element_type() {
        let mut ontology = ontology_with_keyword_rule();
        if let MappingRule::Keywords { element_types, .. } = &mut ontology.element_mappings[0].rules[0]
        {
            *element_types = crate::ontology::model::ElementTypeFilter(vec!["heading".into()]);
        }
        let evaluator = OntologyEvaluator::new(&ontology, None);
        let elem = element("e1", "d1", None, 0);
        let mappings = evaluator.map_element_to_terms(&elem, None).await;
        assert!(mappings.is_empty());
    }

    #[test]
    fn constraint_hierarchy_level_zero_requires_same_parent() {
        let rule = RelationshipRule {
            id: "r1".into(),
            relationship_type: "connects_to".into(),
            description: String::new(),
            source: RelationshipEndpoint {
                term_id: "a".into(),
                semantic_phrase: "x".into(),
                confidence_threshold: 0.5,
                element_types: Default::default(),
            },
            target: RelationshipEndpoint {
                term_id: "b".into(),
                semantic_phrase: "y".into(),
                confidence_threshold: 0.5,
                element_types: Default::default(),
            },
            confidence: RelationshipConfidence {
                minimum: 0.5,
                calculation: ConfidenceCalculation::Average,
                weights: None,
            },
            constraints: Some(RelationshipConstraints {
                hierarchy_level: Some(0),
                direction: RelationshipDirection::Any,
            }),
            bidirectional: false,
        };
        let same_parent_a = element("e1", "d1", Some("p1"), 0);
        let same_parent_b = element("e2", "d1", Some("p1"), 1);
        let diff_parent = element("e3", "d1", Some("p2"), 2);

        assert!(check_constraints(&rule, &same_parent_a, &same_parent_b));
        assert!(!check_constraints(&rule, &same_parent_a, &diff_parent));
    }

    #[test]
    fn constraint_forward_direction_requires_increasing_position() {
        let rule = RelationshipRule {
            id: "r1".into(),
            relationship_type: "follows".into(),
            description: String::new(),
            source: RelationshipEndpoint {
                term_id: "a".into(),
                semantic_phrase: "x".into(),
                confidence_threshold: 0.5,
                element_types: Default::default(),
            },
            target: RelationshipEndpoint {
                term_id: "b".into(),
                semantic_phrase: "y".into(),
                confidence_threshold: 0.5,
                element_types: Default::default(),
            },
            confidence: RelationshipConfidence {
                minimum: 0.5,
                calculation: ConfidenceCalculation::Average,
                weights: None,
            },
            constraints: Some(RelationshipConstraints {
                hierarchy_level: None,
                direction: RelationshipDirection::Forward,
            }),
            bidirectional: false,
        };
        let source = element("e1", "d1", None, 10);
        let target = element("e2", "d1", None, 20);
        assert!(check_constraints(&rule, &source, &target));
        assert!(!check_constraints(&rule, &target, &source));
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0f32, 0.0, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero() {
        let v = vec![0.0f32, 0.0];
        let w = vec![1.0f32, 0.0];
        assert_eq!(cosine_similarity(&v, &w), 0.0);
    }
}
