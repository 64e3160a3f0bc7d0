//! A filesystem content source: the one adapter simple enough to ship without
//! pulling in an external collaborator, used to exercise the pipeline
//! end-to-end in tests and the CLI's `run` command against a local directory.

use super::ContentSource;
use crate::model::{FetchedDocument, LinkedDocument, ListedDocument};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;

pub struct FileContentSource {
    name: String,
    root: PathBuf,
}

impl FileContentSource {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    fn resolve(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

#[async_trait]
impl ContentSource for FileContentSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_documents(&self) -> Result<Vec<ListedDocument>> {
        let mut docs = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("failed to list {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                let metadata = entry.metadata().await?;
                docs.push(ListedDocument {
                    id: relative,
                    metadata: json!({ "size": metadata.len() }),
                });
            }
        }
        Ok(docs)
    }

    async fn fetch_document(&self, id: &str) -> Result<FetchedDocument> {
        let path = self.resolve(id);
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        let content_hash = hex::encode(hasher.finalize());
        Ok(FetchedDocument {
            doc_id: id.to_string(),
            content,
            metadata: json!({}),
            content_hash: Some(content_hash),
            content_type: None,
        })
    }

    async fn has_changed(&self, id: &str, last_modified: Option<&str>) -> Result<bool> {
        let Some(last_modified) = last_modified else {
            return Ok(true);
        };
        // Reference implementation's single supported format.
        let parsed = chrono::NaiveDateTime::parse_from_str(last_modified, "%Y-%m-%d %H:%M:%S");
        let Ok(parsed) = parsed else {
            // Unrecognized format: fail-open, assume changed.
            return Ok(true);
        };
        let metadata = tokio::fs::metadata(self.resolve(id)).await?;
        let modified: chrono::DateTime<chrono::Utc> = metadata.modified()?.into();
        Ok(modified.naive_utc() > parsed)
    }

    async fn follow_links(
        &self,
        _content: &[u8],
        _source_id: &str,
        _current_depth: i32,
        _visited: &HashSet<String>,
    ) -> Result<Vec<LinkedDocument>> {
        Ok(Vec::new())
    }
}
