//! Postgres-backed [`Storage`], grounded on `supabase_repository/mod.rs`'s
//! query/bind/`FromRow` idiom — the same pool, the same runtime (not
//! compile-time checked) `sqlx::query`/`query_as` style as
//! [`crate::queue::postgres::PostgresWorkQueue`].
//!
//! Embeddings are stored as a JSONB float array rather than a vector-typed
//! column: the dependency stack has no pgvector extension crate, and adding
//! one would be a fabricated dependency. `search_by_embedding_impl`
//! scores candidates in-process with [`crate::ontology::evaluator::cosine_similarity`];
//! fine for grounding the contract, not for production-scale nearest-neighbor search.

use crate::contracts::storage::{
    BackendCapabilities, ElementDate, Entity, EntityRelationship, LastProcessedInfo,
    PersistedDocument, SearchHit, StoredRelationship, StructuredQuery, TermStatistic,
};
use crate::contracts::Storage;
use crate::error::BackendCapability;
use crate::model::ElementRecord;
use crate::ontology::evaluator::{cosine_similarity, ElementTermMapping};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::instrument;

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    capabilities: BackendCapabilities,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        let capabilities = BackendCapabilities::new([
            BackendCapability::EmbeddingSearch,
            BackendCapability::TextSearch,
            BackendCapability::ElementDates,
            BackendCapability::DateRangeSearch,
            BackendCapability::DomainMappings,
            BackendCapability::EntityGraph,
        ]);
        Self { pool, capabilities }
    }

    async fn get_element_by_element_id(&self, element_id: &str) -> Result<Option<ElementRecord>> {
        sqlx::query_as::<_, ElementRow>(
            r#"
            SELECT element_pk, element_id, doc_id, element_type, content_preview,
                   parent_id, document_position, attributes
            FROM elements
            WHERE element_id = $1
            "#,
        )
        .bind(element_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up element by element_id")
        .map(|row| row.map(Into::into))
    }
}

#[derive(sqlx::FromRow)]
struct ElementRow {
    element_pk: i64,
    element_id: String,
    doc_id: String,
    element_type: String,
    content_preview: String,
    parent_id: Option<String>,
    document_position: Option<i64>,
    attributes: JsonValue,
}

impl From<ElementRow> for ElementRecord {
    fn from(row: ElementRow) -> Self {
        let attributes = match row.attributes {
            JsonValue::Object(map) => map.into_iter().collect(),
            _ => Default::default(),
        };
        ElementRecord {
            element_pk: row.element_pk,
            element_id: row.element_id,
            doc_id: row.doc_id,
            element_type: row.element_type,
            content_preview: row.content_preview,
            parent_id: row.parent_id,
            document_position: row.document_position,
            attributes,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    doc_id: String,
    source_name: String,
    metadata: JsonValue,
    content_hash: Option<String>,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for PersistedDocument {
    fn from(row: DocumentRow) -> Self {
        PersistedDocument {
            doc_id: row.doc_id,
            source_name: row.source_name,
            metadata: row.metadata,
            content_hash: row.content_hash,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RelationshipRow {
    source_element_id: String,
    target_element_id: String,
    relationship_type: String,
    metadata: JsonValue,
}

impl From<RelationshipRow> for StoredRelationship {
    fn from(row: RelationshipRow) -> Self {
        StoredRelationship {
            source_element_id: row.source_element_id,
            target_element_id: row.target_element_id,
            relationship_type: row.relationship_type,
            metadata: row.metadata,
        }
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    #[instrument(skip(self, elements, relationships, element_dates))]
    async fn store_document(
        &self,
        document: &PersistedDocument,
        elements: &[ElementRecord],
        relationships: &[StoredRelationship],
        element_dates: &[ElementDate],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (doc_id, source_name, metadata, content_hash, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (doc_id) DO UPDATE
            SET source_name = EXCLUDED.source_name,
                metadata = EXCLUDED.metadata,
                content_hash = EXCLUDED.content_hash,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&document.doc_id)
        .bind(&document.source_name)
        .bind(Json(&document.metadata))
        .bind(&document.content_hash)
        .bind(document.updated_at)
        .execute(&mut *tx)
        .await
        .context("failed to upsert document")?;

        sqlx::query("DELETE FROM elements WHERE doc_id = $1")
            .bind(&document.doc_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear prior elements before re-store")?;

        for element in elements {
            sqlx::query(
                r#"
                INSERT INTO elements (
                    element_id, doc_id, element_type, content_preview,
                    parent_id, document_position, attributes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (element_id) DO UPDATE
                SET element_type = EXCLUDED.element_type,
                    content_preview = EXCLUDED.content_preview,
                    parent_id = EXCLUDED.parent_id,
                    document_position = EXCLUDED.document_position,
                    attributes = EXCLUDED.attributes
                "#,
            )
            .bind(&element.element_id)
            .bind(&element.doc_id)
            .bind(&element.element_type)
            .bind(&element.content_preview)
            .bind(&element.parent_id)
            .bind(element.document_position)
            .bind(Json(JsonValue::Object(
                element.attributes.clone().into_iter().collect::<Map<_, _>>(),
            )))
            .execute(&mut *tx)
            .await
            .context("failed to upsert element")?;
        }

        for rel in relationships {
            sqlx::query(
                r#"
                INSERT INTO relationships (doc_id, source_element_id, target_element_id, relationship_type, metadata)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&document.doc_id)
            .bind(&rel.source_element_id)
            .bind(&rel.target_element_id)
            .bind(&rel.relationship_type)
            .bind(Json(&rel.metadata))
            .execute(&mut *tx)
            .await
            .context("failed to insert relationship")?;
        }

        for date in element_dates {
            sqlx::query(
                r#"
                INSERT INTO element_dates (element_pk, date_value, date_type, raw_text)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(date.element_pk)
            .bind(date.date_value)
            .bind(&date.date_type)
            .bind(&date.raw_text)
            .execute(&mut *tx)
            .await
            .context("failed to insert element date")?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, document))]
    async fn update_document(&self, document: &PersistedDocument) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET source_name = $2, metadata = $3, content_hash = $4, updated_at = $5
            WHERE doc_id = $1
            "#,
        )
        .bind(&document.doc_id)
        .bind(&document.source_name)
        .bind(Json(&document.metadata))
        .bind(&document.content_hash)
        .bind(document.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to update document")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_document(&self, doc_id: &str) -> Result<Option<PersistedDocument>> {
        sqlx::query_as::<_, DocumentRow>(
            "SELECT doc_id, source_name, metadata, content_hash, updated_at FROM documents WHERE doc_id = $1",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch document")
        .map(|row| row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn get_document_elements(&self, doc_id: &str) -> Result<Vec<ElementRecord>> {
        sqlx::query_as::<_, ElementRow>(
            r#"
            SELECT element_pk, element_id, doc_id, element_type, content_preview,
                   parent_id, document_position, attributes
            FROM elements
            WHERE doc_id = $1
            ORDER BY document_position NULLS LAST, element_pk
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch document elements")
        .map(|rows| rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn get_document_relationships(&self, doc_id: &str) -> Result<Vec<StoredRelationship>> {
        sqlx::query_as::<_, RelationshipRow>(
            "SELECT source_element_id, target_element_id, relationship_type, metadata FROM relationships WHERE doc_id = $1",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch document relationships")
        .map(|rows| rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE doc_id = $1")
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .context("failed to delete document")?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, relationships))]
    async fn store_relationships(&self, doc_id: &str, relationships: &[StoredRelationship]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for rel in relationships {
            sqlx::query(
                r#"
                INSERT INTO relationships (doc_id, source_element_id, target_element_id, relationship_type, metadata)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(doc_id)
            .bind(&rel.source_element_id)
            .bind(&rel.target_element_id)
            .bind(&rel.relationship_type)
            .bind(Json(&rel.metadata))
            .execute(&mut *tx)
            .await
            .context("failed to append relationship")?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_element(&self, element_pk: i64) -> Result<Option<ElementRecord>> {
        sqlx::query_as::<_, ElementRow>(
            r#"
            SELECT element_pk, element_id, doc_id, element_type, content_preview,
                   parent_id, document_position, attributes
            FROM elements
            WHERE element_pk = $1
            "#,
        )
        .bind(element_pk)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch element")
        .map(|row| row.map(Into::into))
    }

    /// Walks `parent_id` up to `depth` hops, one row at a time — a
    /// recursive CTE would do this in one round trip, but `parent_id`
    /// isn't indexed as a closure table and the chains this resolves are
    /// shallow.
    #[instrument(skip(self))]
    async fn get_ancestors(&self, element_pk: i64, depth: u32) -> Result<Vec<ElementRecord>> {
        let Some(mut current) = self.get_element(element_pk).await? else {
            return Ok(Vec::new());
        };

        let mut ancestors = Vec::new();
        for _ in 0..depth {
            let Some(parent_id) = current.parent_id.clone() else {
                break;
            };
            let Some(parent) = self.get_element_by_element_id(&parent_id).await? else {
                break;
            };
            ancestors.push(parent.clone());
            current = parent;
        }
        Ok(ancestors)
    }

    #[instrument(skip(self))]
    async fn get_last_processed_info(&self, doc_id: &str) -> Result<Option<LastProcessedInfo>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            doc_id: String,
            content_hash: Option<String>,
            last_modified: Option<String>,
            last_processed_at: DateTime<Utc>,
        }

        sqlx::query_as::<_, Row>(
            "SELECT doc_id, content_hash, last_modified, last_processed_at FROM processing_history WHERE doc_id = $1",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch processing history")
        .map(|row| {
            row.map(|r| LastProcessedInfo {
                doc_id: r.doc_id,
                content_hash: r.content_hash,
                last_modified: r.last_modified,
                last_processed_at: r.last_processed_at,
            })
        })
    }

    #[instrument(skip(self))]
    async fn update_processing_history(&self, doc_id: &str, content_hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_history (doc_id, content_hash, last_processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (doc_id) DO UPDATE
            SET content_hash = EXCLUDED.content_hash, last_processed_at = NOW()
            "#,
        )
        .bind(doc_id)
        .bind(content_hash)
        .execute(&self.pool)
        .await
        .context("failed to update processing history")?;
        Ok(())
    }

    #[instrument(skip(self, embedding))]
    async fn store_embedding(&self, element_pk: i64, embedding: &[f32]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO element_embeddings (element_pk, embedding)
            VALUES ($1, $2)
            ON CONFLICT (element_pk) DO UPDATE SET embedding = EXCLUDED.embedding
            "#,
        )
        .bind(element_pk)
        .bind(Json(embedding))
        .execute(&self.pool)
        .await
        .context("failed to store embedding")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_embedding(&self, element_pk: i64) -> Result<Option<Vec<f32>>> {
        sqlx::query_scalar::<_, Json<Vec<f32>>>("SELECT embedding FROM element_embeddings WHERE element_pk = $1")
            .bind(element_pk)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch embedding")
            .map(|row| row.map(|Json(v)| v))
    }

    #[instrument(skip(self, embedding))]
    async fn search_by_embedding_impl(&self, embedding: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            element_pk: i64,
            embedding: Json<Vec<f32>>,
        }

        let rows = sqlx::query_as::<_, Row>("SELECT element_pk, embedding FROM element_embeddings")
            .fetch_all(&self.pool)
            .await
            .context("failed to scan embeddings")?;

        let mut scored: Vec<SearchHit> = rows
            .into_iter()
            .map(|row| SearchHit {
                element_pk: row.element_pk,
                score: cosine_similarity(embedding, &row.embedding.0),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    #[instrument(skip(self))]
    async fn search_by_text_impl(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            element_pk: i64,
            score: f32,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT element_pk, ts_rank(to_tsvector('english', content_preview), plainto_tsquery('english', $1)) AS score
            FROM elements
            WHERE to_tsvector('english', content_preview) @@ plainto_tsquery('english', $1)
            ORDER BY score DESC
            LIMIT $2
            "#,
        )
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to run text search")?;

        Ok(rows
            .into_iter()
            .map(|row| SearchHit { element_pk: row.element_pk, score: row.score as f64 })
            .collect())
    }

    #[instrument(skip(self, dates))]
    async fn store_element_dates_impl(&self, element_pk: i64, dates: &[ElementDate]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for date in dates {
            sqlx::query(
                "INSERT INTO element_dates (element_pk, date_value, date_type, raw_text) VALUES ($1, $2, $3, $4)",
            )
            .bind(element_pk)
            .bind(date.date_value)
            .bind(&date.date_type)
            .bind(&date.raw_text)
            .execute(&mut *tx)
            .await
            .context("failed to store element date")?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_element_dates_impl(&self, element_pk: i64) -> Result<Vec<ElementDate>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            date_value: DateTime<Utc>,
            date_type: String,
            raw_text: String,
        }

        let rows = sqlx::query_as::<_, Row>(
            "SELECT date_value, date_type, raw_text FROM element_dates WHERE element_pk = $1",
        )
        .bind(element_pk)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch element dates")?;

        Ok(rows
            .into_iter()
            .map(|row| ElementDate {
                element_pk,
                date_value: row.date_value,
                date_type: row.date_type,
                raw_text: row.raw_text,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn search_by_date_range_impl(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ElementDate>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            element_pk: i64,
            date_value: DateTime<Utc>,
            date_type: String,
            raw_text: String,
        }

        let rows = sqlx::query_as::<_, Row>(
            "SELECT element_pk, date_value, date_type, raw_text FROM element_dates WHERE date_value BETWEEN $1 AND $2 ORDER BY date_value",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("failed to search element dates by range")?;

        Ok(rows
            .into_iter()
            .map(|row| ElementDate {
                element_pk: row.element_pk,
                date_value: row.date_value,
                date_type: row.date_type,
                raw_text: row.raw_text,
            })
            .collect())
    }

    #[instrument(skip(self, mappings))]
    async fn store_element_term_mappings_impl(
        &self,
        element_pk: i64,
        mappings: &[ElementTermMapping],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for mapping in mappings {
            sqlx::query(
                r#"
                INSERT INTO element_term_mappings (element_pk, term_id, domain, confidence, mapping_rule)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (element_pk, term_id, domain) DO UPDATE
                SET confidence = EXCLUDED.confidence, mapping_rule = EXCLUDED.mapping_rule
                "#,
            )
            .bind(element_pk)
            .bind(&mapping.term_id)
            .bind(&mapping.domain)
            .bind(mapping.confidence)
            .bind(&mapping.mapping_rule)
            .execute(&mut *tx)
            .await
            .context("failed to store element-term mapping")?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_elements_by_term_impl(&self, domain: &str, term_id: &str) -> Result<Vec<ElementRecord>> {
        sqlx::query_as::<_, ElementRow>(
            r#"
            SELECT e.element_pk, e.element_id, e.doc_id, e.element_type, e.content_preview,
                   e.parent_id, e.document_position, e.attributes
            FROM elements e
            JOIN element_term_mappings m ON m.element_pk = e.element_pk
            WHERE m.domain = $1 AND m.term_id = $2
            "#,
        )
        .bind(domain)
        .bind(term_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to find elements by term")
        .map(|rows| rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn get_term_statistics_impl(&self, domain: Option<&str>) -> Result<Vec<TermStatistic>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            term_id: String,
            domain: String,
            usage_count: i64,
            average_confidence: f64,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT term_id, domain, COUNT(*) AS usage_count, AVG(confidence) AS average_confidence
            FROM element_term_mappings
            WHERE $1::text IS NULL OR domain = $1
            GROUP BY term_id, domain
            ORDER BY usage_count DESC
            "#,
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .context("failed to compute term statistics")?;

        Ok(rows
            .into_iter()
            .map(|row| TermStatistic {
                term_id: row.term_id,
                domain: row.domain,
                usage_count: row.usage_count,
                average_confidence: row.average_confidence,
            })
            .collect())
    }

    #[instrument(skip(self, entity))]
    async fn upsert_entity_impl(&self, entity: &Entity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (entity_id, entity_type, name, attributes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity_id) DO UPDATE
            SET entity_type = EXCLUDED.entity_type, name = EXCLUDED.name, attributes = EXCLUDED.attributes
            "#,
        )
        .bind(&entity.entity_id)
        .bind(&entity.entity_type)
        .bind(&entity.name)
        .bind(Json(&entity.attributes))
        .execute(&self.pool)
        .await
        .context("failed to upsert entity")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_entity_impl(&self, entity_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entities WHERE entity_id = $1")
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .context("failed to delete entity")?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, relationship))]
    async fn upsert_entity_relationship_impl(&self, relationship: &EntityRelationship) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_relationships (source_entity_id, target_entity_id, relationship_type, attributes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_entity_id, target_entity_id, relationship_type) DO UPDATE
            SET attributes = EXCLUDED.attributes
            "#,
        )
        .bind(&relationship.source_entity_id)
        .bind(&relationship.target_entity_id)
        .bind(&relationship.relationship_type)
        .bind(Json(&relationship.attributes))
        .execute(&self.pool)
        .await
        .context("failed to upsert entity relationship")?;
        Ok(())
    }

    /// Not declared in [`BackendCapabilities`] — structured search is an
    /// escape hatch for backends with a native query language this one
    /// doesn't have. Unreachable through the public trait method.
    async fn execute_structured_search_impl(&self, _query: &StructuredQuery) -> Result<Vec<SearchHit>> {
        anyhow::bail!("structured search is not supported by the Postgres backend")
    }
}
