//! Embedding-backed content-addressable memory, one logical collection per
//! persona. The index is consumed through the [`VectorIndex`] trait; the
//! shipped implementation keeps everything in a local SQLite file with
//! bincode-serialized embedding blobs and in-process cosine scoring.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use persona_core::{Error, Memory, MemoryType, Result, Visibility};

use crate::embed::{Embedder, cosine_similarity};

/// A retrieval hit: the memory plus its similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub similarity: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn store(&self, memory: &Memory) -> Result<()>;

    /// Similarity search within one persona's collection, highest first.
    async fn search(
        &self,
        persona_id: &str,
        query: &str,
        k: usize,
        min_importance: f64,
        memory_type: Option<MemoryType>,
    ) -> Result<Vec<ScoredMemory>>;

    /// Similarity search restricted to a single visibility level. Cross-
    /// persona retrieval issues one of these per requested level and merges
    /// client-side.
    async fn search_visibility(
        &self,
        persona_id: &str,
        query: &str,
        k: usize,
        min_importance: f64,
        visibility: Visibility,
    ) -> Result<Vec<ScoredMemory>>;

    async fn update_access(
        &self,
        memory_id: &str,
        accessed_count: i64,
        last_accessed: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_importance(&self, memory_id: &str, importance: f64) -> Result<()>;

    async fn delete(&self, memory_id: &str) -> Result<()>;

    /// Drop a persona's entire collection; returns the number of records.
    async fn delete_collection(&self, persona_id: &str) -> Result<u64>;

    async fn list(&self, persona_id: &str) -> Result<Vec<Memory>>;

    async fn count(&self, persona_id: &str) -> Result<i64>;

    /// Persona ids that currently have a collection.
    async fn collections(&self) -> Result<Vec<String>>;
}

fn collection_name(persona_id: &str) -> String {
    format!("persona_{}", persona_id.replace('-', "_"))
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    /// Writes and deletes are serialized; concurrent reads go straight to the
    /// pool.
    write_lock: tokio::sync::Mutex<()>,
}

impl SqliteVectorIndex {
    pub async fn open(path: &str, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(vector_err)?;

        let index = Self {
            pool,
            embedder,
            write_lock: tokio::sync::Mutex::new(()),
        };
        index.migrate().await?;
        Ok(index)
    }

    /// Single-connection in-memory index for tests.
    pub async fn open_in_memory(embedder: Arc<dyn Embedder>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(vector_err)?;

        let index = Self {
            pool,
            embedder,
            write_lock: tokio::sync::Mutex::new(()),
        };
        index.migrate().await?;
        Ok(index)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS memory_vectors (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                persona_id TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB,
                memory_type TEXT NOT NULL DEFAULT 'conversation',
                importance REAL NOT NULL DEFAULT 0.5,
                emotional_valence REAL NOT NULL DEFAULT 0,
                related_personas TEXT NOT NULL DEFAULT '',
                visibility TEXT NOT NULL DEFAULT 'private',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                accessed_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(vector_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_vectors_collection
             ON memory_vectors (collection, visibility, importance);",
        )
        .execute(&self.pool)
        .await
        .map_err(vector_err)?;

        Ok(())
    }

    async fn scored_rows(
        &self,
        persona_id: &str,
        query: &str,
        k: usize,
        min_importance: f64,
        memory_type: Option<MemoryType>,
        visibility: Option<Visibility>,
    ) -> Result<Vec<ScoredMemory>> {
        let mut sql = String::from(
            "SELECT * FROM memory_vectors WHERE collection = ? AND importance >= ?",
        );
        if memory_type.is_some() {
            sql.push_str(" AND memory_type = ?");
        }
        if visibility.is_some() {
            sql.push_str(" AND visibility = ?");
        }

        let mut sql_query = sqlx::query(&sql)
            .bind(collection_name(persona_id))
            .bind(min_importance);
        if let Some(ty) = memory_type {
            sql_query = sql_query.bind(ty.as_str());
        }
        if let Some(vis) = visibility {
            sql_query = sql_query.bind(vis.as_str());
        }

        let rows = sql_query.fetch_all(&self.pool).await.map_err(vector_err)?;
        let query_embedding = self.embedder.embed(query).await;
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut scored: Vec<ScoredMemory> = rows
            .into_iter()
            .map(|row| {
                let embedding_blob: Option<Vec<u8>> = row.get("embedding");
                let content: String = row.get("content");

                let similarity = match (&query_embedding, embedding_blob) {
                    (Some(query_vec), Some(blob)) => {
                        match bincode::deserialize::<Vec<f32>>(&blob) {
                            Ok(stored) => cosine_similarity(query_vec, &stored),
                            Err(_) => lexical_overlap(&query_words, &content),
                        }
                    }
                    _ => lexical_overlap(&query_words, &content),
                };

                ScoredMemory {
                    memory: row_to_memory(row),
                    similarity,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn store(&self, memory: &Memory) -> Result<()> {
        let embedding = self
            .embedder
            .embed(&memory.content)
            .await
            .map(|vec| bincode::serialize(&vec))
            .transpose()
            .map_err(vector_err)?;
        let metadata = serde_json::to_string(&memory.metadata).map_err(vector_err)?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO memory_vectors
                (id, collection, persona_id, content, embedding, memory_type, importance,
                 emotional_valence, related_personas, visibility, metadata, created_at,
                 accessed_count, last_accessed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                embedding = excluded.embedding,
                importance = excluded.importance,
                accessed_count = excluded.accessed_count,
                last_accessed = excluded.last_accessed",
        )
        .bind(&memory.id)
        .bind(collection_name(&memory.persona_id))
        .bind(&memory.persona_id)
        .bind(&memory.content)
        .bind(embedding)
        .bind(memory.memory_type.as_str())
        .bind(memory.importance)
        .bind(memory.emotional_valence)
        .bind(memory.related_personas.join(","))
        .bind(memory.visibility.as_str())
        .bind(metadata)
        .bind(memory.created_at.to_rfc3339())
        .bind(memory.accessed_count)
        .bind(memory.last_accessed.map(|ts| ts.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(vector_err)?;

        Ok(())
    }

    async fn search(
        &self,
        persona_id: &str,
        query: &str,
        k: usize,
        min_importance: f64,
        memory_type: Option<MemoryType>,
    ) -> Result<Vec<ScoredMemory>> {
        self.scored_rows(persona_id, query, k, min_importance, memory_type, None)
            .await
    }

    async fn search_visibility(
        &self,
        persona_id: &str,
        query: &str,
        k: usize,
        min_importance: f64,
        visibility: Visibility,
    ) -> Result<Vec<ScoredMemory>> {
        self.scored_rows(persona_id, query, k, min_importance, None, Some(visibility))
            .await
    }

    async fn update_access(
        &self,
        memory_id: &str,
        accessed_count: i64,
        last_accessed: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE memory_vectors SET accessed_count = ?, last_accessed = ? WHERE id = ?",
        )
        .bind(accessed_count)
        .bind(last_accessed.to_rfc3339())
        .bind(memory_id)
        .execute(&self.pool)
        .await
        .map_err(vector_err)?;
        Ok(())
    }

    async fn set_importance(&self, memory_id: &str, importance: f64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE memory_vectors SET importance = ? WHERE id = ?")
            .bind(importance)
            .bind(memory_id)
            .execute(&self.pool)
            .await
            .map_err(vector_err)?;
        Ok(())
    }

    async fn delete(&self, memory_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM memory_vectors WHERE id = ?")
            .bind(memory_id)
            .execute(&self.pool)
            .await
            .map_err(vector_err)?;
        Ok(())
    }

    async fn delete_collection(&self, persona_id: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let deleted = sqlx::query("DELETE FROM memory_vectors WHERE collection = ?")
            .bind(collection_name(persona_id))
            .execute(&self.pool)
            .await
            .map_err(vector_err)?
            .rows_affected();
        Ok(deleted)
    }

    async fn list(&self, persona_id: &str) -> Result<Vec<Memory>> {
        let rows = sqlx::query("SELECT * FROM memory_vectors WHERE collection = ?")
            .bind(collection_name(persona_id))
            .fetch_all(&self.pool)
            .await
            .map_err(vector_err)?;

        Ok(rows.into_iter().map(row_to_memory).collect())
    }

    async fn count(&self, persona_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM memory_vectors WHERE collection = ?")
            .bind(collection_name(persona_id))
            .fetch_one(&self.pool)
            .await
            .map_err(vector_err)?;
        Ok(row.get("cnt"))
    }

    async fn collections(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT persona_id FROM memory_vectors")
            .fetch_all(&self.pool)
            .await
            .map_err(vector_err)?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("persona_id"))
            .collect())
    }
}

fn vector_err(err: impl std::fmt::Display) -> Error {
    Error::Store(format!("vector index: {err}"))
}

/// Fallback scoring when either side lacks an embedding: fraction of query
/// words present in the content.
fn lexical_overlap(query_words: &[String], content: &str) -> f32 {
    if query_words.is_empty() {
        return 0.0;
    }

    let content = content.to_lowercase();
    let hits = query_words
        .iter()
        .filter(|word| content.contains(word.as_str()))
        .count();
    hits as f32 / query_words.len() as f32
}

fn row_to_memory(row: sqlx::sqlite::SqliteRow) -> Memory {
    let related: String = row.get("related_personas");
    let related_personas = if related.is_empty() {
        Vec::new()
    } else {
        related.split(',').map(str::to_string).collect()
    };

    Memory {
        id: row.get("id"),
        persona_id: row.get("persona_id"),
        content: row.get("content"),
        memory_type: row
            .get::<String, _>("memory_type")
            .parse::<MemoryType>()
            .unwrap_or_default(),
        importance: row.get("importance"),
        emotional_valence: row.get("emotional_valence"),
        related_personas,
        visibility: row
            .get::<String, _>("visibility")
            .parse::<Visibility>()
            .unwrap_or_default(),
        metadata: serde_json::from_str(&row.get::<String, _>("metadata")).unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&row.get::<String, _>("created_at"))
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        accessed_count: row.get("accessed_count"),
        last_accessed: row
            .get::<Option<String>, _>("last_accessed")
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;

    async fn index() -> SqliteVectorIndex {
        SqliteVectorIndex::open_in_memory(Arc::new(HashEmbedder::default()))
            .await
            .expect("in-memory index opens")
    }

    fn memory(persona: &str, content: &str, importance: f64, visibility: Visibility) -> Memory {
        let mut memory = Memory::new(persona, content);
        memory.importance = importance;
        memory.visibility = visibility;
        memory
    }

    #[tokio::test]
    async fn stored_memory_is_found_by_broad_search() -> Result<()> {
        let index = index().await;
        let stored = memory("p1", "the dragon guards ancient treasure", 0.7, Visibility::Private);
        index.store(&stored).await?;

        let hits = index.search("p1", "dragon treasure", 10, 0.0, None).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.id, stored.id);
        assert!(hits[0].similarity > 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn collections_are_isolated_per_persona() -> Result<()> {
        let index = index().await;
        index.store(&memory("p1", "alpha fact", 0.5, Visibility::Private)).await?;
        index.store(&memory("p2", "alpha fact", 0.5, Visibility::Private)).await?;

        let hits = index.search("p1", "alpha fact", 10, 0.0, None).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.persona_id, "p1");
        assert_eq!(index.count("p2").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn importance_filter_applies() -> Result<()> {
        let index = index().await;
        index.store(&memory("p1", "minor detail", 0.2, Visibility::Private)).await?;
        index.store(&memory("p1", "major detail", 0.9, Visibility::Private)).await?;

        let hits = index.search("p1", "detail", 10, 0.5, None).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.content, "major detail");
        Ok(())
    }

    #[tokio::test]
    async fn visibility_search_only_returns_requested_level() -> Result<()> {
        let index = index().await;
        index.store(&memory("p1", "private thing", 0.8, Visibility::Private)).await?;
        index.store(&memory("p1", "shared thing", 0.8, Visibility::Shared)).await?;
        index.store(&memory("p1", "public thing", 0.8, Visibility::Public)).await?;

        let shared = index
            .search_visibility("p1", "thing", 10, 0.0, Visibility::Shared)
            .await?;
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].memory.visibility, Visibility::Shared);
        Ok(())
    }

    #[tokio::test]
    async fn store_is_idempotent_by_id() -> Result<()> {
        let index = index().await;
        let stored = memory("p1", "repeatable", 0.5, Visibility::Private);
        index.store(&stored).await?;
        index.store(&stored).await?;
        assert_eq!(index.count("p1").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_collection_reports_count() -> Result<()> {
        let index = index().await;
        index.store(&memory("p1", "one", 0.5, Visibility::Private)).await?;
        index.store(&memory("p1", "two", 0.5, Visibility::Private)).await?;

        assert_eq!(index.delete_collection("p1").await?, 2);
        assert_eq!(index.count("p1").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn access_updates_persist() -> Result<()> {
        let index = index().await;
        let stored = memory("p1", "touched", 0.5, Visibility::Private);
        index.store(&stored).await?;
        index.update_access(&stored.id, 4, Utc::now()).await?;

        let listed = index.list("p1").await?;
        assert_eq!(listed[0].accessed_count, 4);
        assert!(listed[0].last_accessed.is_some());
        Ok(())
    }
}
