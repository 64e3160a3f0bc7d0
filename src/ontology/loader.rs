//! Ontology loading and active-domain management, grounded on `domain/loader.py`'s `OntologyLoader` /
//! `OntologyManager` split.

use super::model::{DomainOntology, Term};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Stateless parsing of ontology documents from file/string. Validation
/// issues are logged, not raised — the caller decides whether to escalate.
#[derive(Default)]
pub struct OntologyLoader {
    ontologies: HashMap<String, DomainOntology>,
}

impl OntologyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<&DomainOntology> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ontology file {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => self.load_from_yaml(&raw),
            Some("json") => self.load_from_json(&raw),
            other => anyhow::bail!("unsupported ontology file extension: {other:?}"),
        }
    }

    pub fn load_from_yaml(&mut self, raw: &str) -> Result<&DomainOntology> {
        let ontology: DomainOntology =
            serde_yaml::from_str(raw).context("failed to parse ontology YAML")?;
        self.load_from_ontology(ontology)
    }

    pub fn load_from_json(&mut self, raw: &str) -> Result<&DomainOntology> {
        let ontology: DomainOntology =
            serde_json::from_str(raw).context("failed to parse ontology JSON")?;
        self.load_from_ontology(ontology)
    }

    fn load_from_ontology(&mut self, ontology: DomainOntology) -> Result<&DomainOntology> {
        let issues = ontology.validate();
        if !issues.is_empty() {
            warn!(domain = %ontology.name, issues = ?issues, "ontology failed validation checks");
        }
        let name = ontology.name.clone();
        self.ontologies.insert(name.clone(), ontology);
        Ok(self.ontologies.get(&name).expect("just inserted"))
    }

    pub fn load_from_directory(&mut self, dir: impl AsRef<Path>) -> Result<Vec<String>> {
        let dir = dir.as_ref();
        let mut loaded = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to list ontology directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let is_ontology_file = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml") | Some("json")
            );
            if !is_ontology_file {
                continue;
            }
            let ontology = self.load_from_file(&path)?;
            loaded.push(ontology.name.clone());
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<&DomainOntology> {
        self.ontologies.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.ontologies.keys().map(String::as_str).collect()
    }
}

/// Tracks which loaded domains are *active* for a run.
pub struct OntologyManager {
    loader: OntologyLoader,
    active_domains: Vec<String>,
}

impl OntologyManager {
    pub fn new(loader: OntologyLoader) -> Self {
        Self {
            loader,
            active_domains: Vec::new(),
        }
    }

    pub fn activate_domain(&mut self, name: &str) -> Result<()> {
        if self.loader.get(name).is_none() {
            anyhow::bail!("cannot activate unknown ontology domain: {name}");
        }
        if !self.active_domains.iter().any(|d| d == name) {
            self.active_domains.push(name.to_string());
        }
        Ok(())
    }

    pub fn deactivate_domain(&mut self, name: &str) {
        self.active_domains.retain(|d| d != name);
    }

    pub fn get_active_ontologies(&self) -> Vec<&DomainOntology> {
        self.active_domains
            .iter()
            .filter_map(|name| self.loader.get(name))
            .collect()
    }

    pub fn get_all_terms(&self) -> Vec<&Term> {
        self.get_active_ontologies()
            .into_iter()
            .flat_map(|o| o.terms.iter())
            .collect()
    }

    pub fn find_term(&self, term_id: &str) -> Option<&Term> {
        self.get_active_ontologies()
            .into_iter()
            .find_map(|o| o.terms.iter().find(|t| t.id == term_id))
    }

    pub fn loader(&self) -> &OntologyLoader {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut OntologyLoader {
        &mut self.loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
name: test-domain
version: "1.0"
terms:
  - id: t1
    label: Term One
element_mappings: []
relationship_rules: []
"#;

    #[test]
    fn loads_and_activates_domain() {
        let mut loader = OntologyLoader::new();
        loader.load_from_yaml(MINIMAL_YAML).unwrap();
        let mut manager = OntologyManager::new(loader);
        manager.activate_domain("test-domain").unwrap();
        assert_eq!(manager.get_active_ontologies().len(), 1);
        assert!(manager.find_term("t1").is_some());
    }

    #[test]
    fn inactive_domain_terms_not_visible() {
        let mut loader = OntologyLoader::new();
        loader.load_from_yaml(MINIMAL_YAML).unwrap();
        let manager = OntologyManager::new(loader);
        assert!(manager.find_term("t1").is_none());
    }

    #[test]
    fn activating_unknown_domain_fails() {
        let manager_loader = OntologyLoader::new();
        let mut manager = OntologyManager::new(manager_loader);
        assert!(manager.activate_domain("nope").is_err());
    }
}
