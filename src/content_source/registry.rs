//! Process-local content-source registry.
//!
//! The registry is process-global in the reference implementation; here it's
//! modeled as an explicit dependency constructed once per process and handed
//! to the coordinator and every worker,
//! rather than a module-level singleton.

use super::ContentSource;
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct ContentSourceRegistry {
    sources: Arc<DashMap<String, Arc<dyn ContentSource>>>,
}

impl ContentSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn ContentSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ContentSource>> {
        self.sources
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!(crate::error::PipelineError::UnknownContentSource(name.to_string())))
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_source::file::FileContentSource;

    #[test]
    fn register_then_resolve_by_name() {
        let registry = ContentSourceRegistry::new();
        registry.register(Arc::new(FileContentSource::new("docs", "/tmp")));
        assert!(registry.get("docs").is_ok());
        assert!(registry.get("missing").is_err());
    }
}
