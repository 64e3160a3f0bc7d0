//! The document-parser contract. Per-format parsers are out of scope for
//! this crate; this module defines only the seam the worker dispatches
//! through, and per-format implementations are an external collaborator.

use crate::contracts::storage::{ElementDate, PersistedDocument, StoredRelationship};
use crate::model::{ElementRecord, FetchedDocument};
use anyhow::Result;
use async_trait::async_trait;

/// Output of parsing one fetched document into the shapes the storage
/// contract persists.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub document: Option<PersistedDocument>,
    pub elements: Vec<ElementRecord>,
    pub relationships: Vec<StoredRelationship>,
    pub element_dates: Vec<ElementDate>,
}

#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Whether this parser handles the given content type (e.g. a MIME type
    /// or file extension reported by the content source).
    fn supports(&self, content_type: Option<&str>) -> bool;

    async fn parse(&self, document: &FetchedDocument) -> Result<ParsedDocument>;
}

/// Dispatches to the first registered parser whose `supports` matches,
/// mirroring the content-source registry's lookup-by-predicate shape.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<std::sync::Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, parser: std::sync::Arc<dyn DocumentParser>) {
        self.parsers.push(parser);
    }

    pub fn resolve(&self, content_type: Option<&str>) -> Option<std::sync::Arc<dyn DocumentParser>> {
        self.parsers.iter().find(|p| p.supports(content_type)).cloned()
    }
}
