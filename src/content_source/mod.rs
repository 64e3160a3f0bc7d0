//! Content-source trait, factory, and process-local registry.
//!
//! Concrete adapters (filesystem, HTTP, object stores, SaaS APIs) are out of
//! scope — this module defines the contract and the
//! database-backed adapter used to ground the `db://` id scheme, plus a `file` adapter for local smoke-testing the pipeline end to
//! end without external services.

pub mod database;
pub mod factory;
pub mod file;
pub mod registry;

pub use factory::create;
pub use registry::ContentSourceRegistry;

use crate::model::{FetchedDocument, LinkedDocument, ListedDocument};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

/// The core contract a content source must satisfy.
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn name(&self) -> &str;

    async fn list_documents(&self) -> Result<Vec<ListedDocument>>;

    async fn fetch_document(&self, id: &str) -> Result<FetchedDocument>;

    /// `last_modified` is whatever opaque string the source itself produced
    /// on a previous fetch; sources that can't support change detection
    /// should conservatively return `true`.
    async fn has_changed(&self, id: &str, last_modified: Option<&str>) -> Result<bool>;

    /// May be a no-op for leaf sources that never produce links.
    async fn follow_links(
        &self,
        content: &[u8],
        source_id: &str,
        current_depth: i32,
        visited: &HashSet<String>,
    ) -> Result<Vec<LinkedDocument>>;
}
