//! Ontology data model, grounded on `domain/ontology.py`.
//!
//! Mapping rules multiplex three shapes behind a `type` discriminator in the
//! Python original; here they're a proper sum type.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceCalculation {
    Average,
    Min,
    Max,
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipDirection {
    Forward,
    Backward,
    #[default]
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSettings {
    #[serde(default = "default_confidence_threshold")]
    pub default_confidence_threshold: f64,
    #[serde(default = "default_max_relationships_per_pair")]
    pub max_relationships_per_pair: u32,
    #[serde(default)]
    pub enable_transitive_inference: bool,
}

fn default_confidence_threshold() -> f64 {
    0.70
}
fn default_max_relationships_per_pair() -> u32 {
    3
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            default_confidence_threshold: default_confidence_threshold(),
            max_relationships_per_pair: default_max_relationships_per_pair(),
            enable_transitive_inference: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Term {
    pub fn all_names(&self) -> Vec<&str> {
        std::iter::once(self.label.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }
}

/// An element-type filter: `None`/empty/`["*"]` matches everything; entries
/// containing regex metacharacters are treated as patterns, otherwise exact
/// string match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ElementTypeFilter(#[serde(default)] pub Vec<String>);

impl ElementTypeFilter {
    pub fn matches(&self, element_type: &str) -> bool {
        if self.0.is_empty() || self.0.iter().any(|t| t == "*") {
            return true;
        }
        for entry in &self.0 {
            if entry == element_type {
                return true;
            }
            if has_regex_metacharacters(entry) {
                if let Ok(re) = Regex::new(entry) {
                    if re.is_match(element_type) {
                        return true;
                    }
                }
            }
        }
        false
    }
}

fn has_regex_metacharacters(s: &str) -> bool {
    s.chars().any(|c| "\\^$.|?*+()[]{}".contains(c))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MappingRule {
    Semantic {
        semantic_phrase: String,
        confidence_threshold: f64,
        #[serde(default)]
        element_types: ElementTypeFilter,
    },
    Regex {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
        #[serde(default)]
        element_types: ElementTypeFilter,
    },
    Keywords {
        keywords: Vec<String>,
        #[serde(default = "default_word_boundary")]
        word_boundary: bool,
        #[serde(default)]
        element_types: ElementTypeFilter,
    },
}

fn default_word_boundary() -> bool {
    true
}

impl MappingRule {
    pub fn element_types(&self) -> &ElementTypeFilter {
        match self {
            Self::Semantic { element_types, .. } => element_types,
            Self::Regex { element_types, .. } => element_types,
            Self::Keywords { element_types, .. } => element_types,
        }
    }

    pub fn matches_element_type(&self, element_type: &str) -> bool {
        self.element_types().matches(element_type)
    }

    /// Compile the rule's pattern, synthesizing `\b(k1|k2|...)\b` for keyword
    /// rules exactly as `_keywords_to_pattern` does in the original.
    pub fn compile_pattern(&self) -> anyhow::Result<Option<Regex>> {
        match self {
            Self::Semantic { .. } => Ok(None),
            Self::Regex {
                pattern,
                case_sensitive,
                ..
            } => {
                let pattern = if *case_sensitive {
                    pattern.clone()
                } else {
                    format!("(?i){pattern}")
                };
                Ok(Some(Regex::new(&pattern)?))
            }
            Self::Keywords {
                keywords,
                word_boundary,
                ..
            } => {
                let escaped: Vec<String> = keywords.iter().map(|k| regex::escape(k)).collect();
                let joined = escaped.join("|");
                let pattern = if *word_boundary {
                    format!(r"(?i)\b({joined})\b")
                } else {
                    format!("(?i)({joined})")
                };
                Ok(Some(Regex::new(&pattern)?))
            }
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        match self {
            Self::Semantic {
                semantic_phrase,
                confidence_threshold,
                ..
            } => {
                if semantic_phrase.trim().is_empty() {
                    issues.push("semantic mapping rule missing semantic_phrase".to_string());
                }
                if !(0.0..=1.0).contains(confidence_threshold) {
                    issues.push(format!(
                        "semantic mapping rule confidence_threshold {confidence_threshold} out of [0,1]"
                    ));
                }
            }
            Self::Regex { pattern, .. } => {
                if pattern.trim().is_empty() {
                    issues.push("regex mapping rule missing pattern".to_string());
                } else if let Err(e) = Regex::new(pattern) {
                    issues.push(format!("regex mapping rule pattern '{pattern}' invalid: {e}"));
                }
            }
            Self::Keywords { keywords, .. } => {
                if keywords.is_empty() {
                    issues.push("keywords mapping rule has an empty keyword list".to_string());
                }
            }
        }
        issues
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementMapping {
    pub term_id: String,
    pub rules: Vec<MappingRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RelationshipConstraints {
    #[serde(default)]
    pub hierarchy_level: Option<i32>,
    #[serde(default)]
    pub direction: RelationshipDirection,
}

impl RelationshipConstraints {
    /// Accept the legacy `same_section`/`max_distance` fields from the
    /// Python original's `RelationshipConstraints.from_dict`:
    /// `same_section=true` → `hierarchy_level=Some(0)`;
    /// `max_distance` present → `hierarchy_level=Some(-1)` (same document).
    pub fn from_legacy(
        hierarchy_level: Option<i32>,
        direction: RelationshipDirection,
        same_section: Option<bool>,
        max_distance: Option<i32>,
    ) -> Self {
        let hierarchy_level = hierarchy_level.or_else(|| {
            if same_section == Some(true) {
                Some(0)
            } else if max_distance.is_some() {
                Some(-1)
            } else {
                None
            }
        });
        Self {
            hierarchy_level,
            direction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEndpoint {
    pub term_id: String,
    pub semantic_phrase: String,
    pub confidence_threshold: f64,
    #[serde(default)]
    pub element_types: ElementTypeFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipConfidence {
    #[serde(default = "default_confidence_threshold")]
    pub minimum: f64,
    #[serde(default = "default_calculation")]
    pub calculation: ConfidenceCalculation,
    #[serde(default)]
    pub weights: Option<HashMap<String, f64>>,
}

fn default_calculation() -> ConfidenceCalculation {
    ConfidenceCalculation::Average
}

impl RelationshipConfidence {
    pub fn calculate(&self, source_score: f64, target_score: f64) -> f64 {
        match self.calculation {
            ConfidenceCalculation::Average => (source_score + target_score) / 2.0,
            ConfidenceCalculation::Min => source_score.min(target_score),
            ConfidenceCalculation::Max => source_score.max(target_score),
            ConfidenceCalculation::Weighted => {
                let weights = self.weights.clone().unwrap_or_default();
                let w_s = weights.get("source").copied().unwrap_or(0.5);
                let w_t = weights.get("target").copied().unwrap_or(0.5);
                if w_s + w_t == 0.0 {
                    (source_score + target_score) / 2.0
                } else {
                    (source_score * w_s + target_score * w_t) / (w_s + w_t)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRule {
    pub id: String,
    pub relationship_type: String,
    #[serde(default)]
    pub description: String,
    pub source: RelationshipEndpoint,
    pub target: RelationshipEndpoint,
    pub confidence: RelationshipConfidence,
    #[serde(default)]
    pub constraints: Option<RelationshipConstraints>,
    #[serde(default)]
    pub bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainOntology {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub settings: DomainSettings,
    pub terms: Vec<Term>,
    #[serde(default)]
    pub element_mappings: Vec<ElementMapping>,
    #[serde(default)]
    pub relationship_rules: Vec<RelationshipRule>,
}

impl DomainOntology {
    pub fn term_ids(&self) -> std::collections::HashSet<&str> {
        self.terms.iter().map(|t| t.id.as_str()).collect()
    }

    /// Every mapping rule that targets `term_id`, across all `element_mappings`.
    pub fn mappings_by_term(&self) -> HashMap<&str, Vec<(&str, &MappingRule)>> {
        let mut by_term: HashMap<&str, Vec<(&str, &MappingRule)>> = HashMap::new();
        for mapping in &self.element_mappings {
            for rule in &mapping.rules {
                by_term
                    .entry(mapping.term_id.as_str())
                    .or_default()
                    .push((mapping.term_id.as_str(), rule));
            }
        }
        by_term
    }

    /// Collect every validation issue rather than stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut seen_ids = std::collections::HashSet::new();
        for term in &self.terms {
            if !seen_ids.insert(term.id.as_str()) {
                issues.push(format!("duplicate term id: {}", term.id));
            }
        }

        let term_ids = self.term_ids();

        for mapping in &self.element_mappings {
            if !term_ids.contains(mapping.term_id.as_str()) {
                issues.push(format!(
                    "element_mapping references unknown term_id: {}",
                    mapping.term_id
                ));
            }
            for rule in &mapping.rules {
                issues.extend(rule.validate());
            }
        }

        for rule in &self.relationship_rules {
            if !term_ids.contains(rule.source.term_id.as_str()) {
                issues.push(format!(
                    "relationship_rule '{}' source references unknown term_id: {}",
                    rule.id, rule.source.term_id
                ));
            }
            if !term_ids.contains(rule.target.term_id.as_str()) {
                issues.push(format!(
                    "relationship_rule '{}' target references unknown term_id: {}",
                    rule.id, rule.target.term_id
                ));
            }
            if !(0.0..=1.0).contains(&rule.confidence.minimum) {
                issues.push(format!(
                    "relationship_rule '{}' confidence.minimum {} out of [0,1]",
                    rule.id, rule.confidence.minimum
                ));
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_type_filter_wildcard_matches_everything() {
        let filter = ElementTypeFilter(vec!["*".to_string()]);
        assert!(filter.matches("paragraph"));
        assert!(filter.matches("anything"));
    }

    #[test]
    fn element_type_filter_empty_matches_everything() {
        let filter = ElementTypeFilter::default();
        assert!(filter.matches("paragraph"));
    }

    #[test]
    fn element_type_filter_exact_list() {
        let filter = ElementTypeFilter(vec!["paragraph".to_string(), "heading".to_string()]);
        assert!(filter.matches("heading"));
        assert!(!filter.matches("table"));
    }

    #[test]
    fn element_type_filter_regex_pattern() {
        let filter = ElementTypeFilter(vec!["heading.*".to_string()]);
        assert!(filter.matches("heading1"));
        assert!(!filter.matches("paragraph"));
    }

    #[test]
    fn confidence_calculation_min_and_max_bound_average() {
        let avg = RelationshipConfidence {
            minimum: 0.0,
            calculation: ConfidenceCalculation::Average,
            weights: None,
        };
        let min = RelationshipConfidence {
            calculation: ConfidenceCalculation::Min,
            ..avg.clone()
        };
        let max = RelationshipConfidence {
            calculation: ConfidenceCalculation::Max,
            ..avg.clone()
        };
        let (s, t) = (0.6, 0.9);
        assert!(min.calculate(s, t) <= avg.calculate(s, t));
        assert!(avg.calculate(s, t) <= max.calculate(s, t));
    }

    #[test]
    fn weighted_defaults_to_equal_weights() {
        let weighted = RelationshipConfidence {
            minimum: 0.0,
            calculation: ConfidenceCalculation::Weighted,
            weights: None,
        };
        assert_eq!(weighted.calculate(0.4, 0.8), 0.6);
    }

    #[test]
    fn legacy_same_section_maps_to_hierarchy_level_zero() {
        let constraints = RelationshipConstraints::from_legacy(None, RelationshipDirection::Any, Some(true), None);
        assert_eq!(constraints.hierarchy_level, Some(0));
    }

    #[test]
    fn legacy_max_distance_maps_to_same_document() {
        let constraints = RelationshipConstraints::from_legacy(None, RelationshipDirection::Any, None, Some(5));
        assert_eq!(constraints.hierarchy_level, Some(-1));
    }

    #[test]
    fn validate_collects_all_issues_not_just_first() {
        let ontology = DomainOntology {
            name: "test".into(),
            version: "1".into(),
            description: String::new(),
            settings: DomainSettings::default(),
            terms: vec![
                Term {
                    id: "a".into(),
                    label: "A".into(),
                    description: String::new(),
                    aliases: vec![],
                },
                Term {
                    id: "a".into(),
                    label: "A dup".into(),
                    description: String::new(),
                    aliases: vec![],
                },
            ],
            element_mappings: vec![ElementMapping {
                term_id: "missing".into(),
                rules: vec![MappingRule::Regex {
                    pattern: "(".into(),
                    case_sensitive: false,
                    element_types: ElementTypeFilter::default(),
                }],
            }],
            relationship_rules: vec![],
        };

        let issues = ontology.validate();
        assert!(issues.len() >= 3, "expected multiple collected issues, got {issues:?}");
    }
}
