//! The embedding-provider contract, used by the
//! domain-ontology evaluator's semantic mapping rules and by the worker
//! when it persists element embeddings. A concrete model-backed provider is
//! out of scope for this crate; callers supply their own or run without one
//! (semantic rules then simply never fire).

use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}
