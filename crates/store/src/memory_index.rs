use chrono::{DateTime, Utc};
use sqlx::Row;

use persona_core::{Memory, MemoryType, Result};

use crate::{SqliteStore, parse_rfc3339, parse_rfc3339_opt, store_err, to_rfc3339};

/// The structured-store side of a memory: everything except the content and
/// embedding, which live in the vector store.
#[derive(Debug, Clone)]
pub struct MemoryIndexRow {
    pub id: String,
    pub persona_id: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub emotional_valence: f64,
    pub related_personas: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub accessed_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl MemoryIndexRow {
    pub fn from_memory(memory: &Memory) -> Self {
        Self {
            id: memory.id.clone(),
            persona_id: memory.persona_id.clone(),
            memory_type: memory.memory_type,
            importance: memory.importance,
            emotional_valence: memory.emotional_valence,
            related_personas: memory.related_personas.clone(),
            metadata: memory.metadata.clone(),
            created_at: memory.created_at,
            accessed_count: memory.accessed_count,
            last_accessed: memory.last_accessed,
        }
    }
}

impl SqliteStore {
    /// Upsert keyed on the memory id, which doubles as the idempotency key
    /// for the two-store write.
    pub async fn upsert_memory_index(&self, row: &MemoryIndexRow) -> Result<()> {
        let related = serde_json::to_string(&row.related_personas).map_err(store_err)?;
        let metadata = serde_json::to_string(&row.metadata).map_err(store_err)?;

        sqlx::query(
            "INSERT INTO memories
                (id, persona_id, memory_type, importance, emotional_valence,
                 related_personas, metadata, created_at, accessed_count, last_accessed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                importance = excluded.importance,
                accessed_count = excluded.accessed_count,
                last_accessed = excluded.last_accessed",
        )
        .bind(&row.id)
        .bind(&row.persona_id)
        .bind(row.memory_type.as_str())
        .bind(row.importance)
        .bind(row.emotional_valence)
        .bind(related)
        .bind(metadata)
        .bind(to_rfc3339(row.created_at))
        .bind(row.accessed_count)
        .bind(row.last_accessed.map(to_rfc3339))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn touch_memory_index(
        &self,
        memory_id: &str,
        accessed_count: i64,
        last_accessed: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE memories SET accessed_count = ?, last_accessed = ? WHERE id = ?")
            .bind(accessed_count)
            .bind(to_rfc3339(last_accessed))
            .bind(memory_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn set_memory_importance(&self, memory_id: &str, importance: f64) -> Result<()> {
        sqlx::query("UPDATE memories SET importance = ? WHERE id = ?")
            .bind(importance)
            .bind(memory_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn delete_memory_index(&self, memory_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(memory_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn delete_memory_index_for_persona(&self, persona_id: &str) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM memories WHERE persona_id = ?")
            .bind(persona_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?
            .rows_affected();
        Ok(deleted)
    }

    pub async fn memory_index_count(&self, persona_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM memories WHERE persona_id = ?")
            .bind(persona_id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.get("cnt"))
    }

    pub async fn list_memory_index(&self, persona_id: &str) -> Result<Vec<MemoryIndexRow>> {
        let rows = sqlx::query("SELECT * FROM memories WHERE persona_id = ?")
            .bind(persona_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|row| MemoryIndexRow {
                id: row.get("id"),
                persona_id: row.get("persona_id"),
                memory_type: row
                    .get::<String, _>("memory_type")
                    .parse::<MemoryType>()
                    .unwrap_or_default(),
                importance: row.get("importance"),
                emotional_valence: row.get("emotional_valence"),
                related_personas: serde_json::from_str(&row.get::<String, _>("related_personas"))
                    .unwrap_or_default(),
                metadata: serde_json::from_str(&row.get::<String, _>("metadata"))
                    .unwrap_or_default(),
                created_at: parse_rfc3339(&row.get::<String, _>("created_at")),
                accessed_count: row.get("accessed_count"),
                last_accessed: parse_rfc3339_opt(row.get::<Option<String>, _>("last_accessed")),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::Memory;

    #[tokio::test]
    async fn upsert_is_idempotent_by_id() -> Result<()> {
        let store = SqliteStore::connect_in_memory().await?;

        let mut memory = Memory::new("p1", "the content lives elsewhere");
        memory.importance = 0.6;
        let row = MemoryIndexRow::from_memory(&memory);
        store.upsert_memory_index(&row).await?;
        store.upsert_memory_index(&row).await?;

        assert_eq!(store.memory_index_count("p1").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn importance_and_access_updates_apply() -> Result<()> {
        let store = SqliteStore::connect_in_memory().await?;

        let memory = Memory::new("p1", "fact");
        store
            .upsert_memory_index(&MemoryIndexRow::from_memory(&memory))
            .await?;

        store.set_memory_importance(&memory.id, 0.25).await?;
        store.touch_memory_index(&memory.id, 3, Utc::now()).await?;

        let rows = store.list_memory_index("p1").await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].importance, 0.25);
        assert_eq!(rows[0].accessed_count, 3);
        assert!(rows[0].last_accessed.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn per_persona_delete_removes_only_theirs() -> Result<()> {
        let store = SqliteStore::connect_in_memory().await?;

        for persona in ["p1", "p1", "p2"] {
            let memory = Memory::new(persona, "x");
            store
                .upsert_memory_index(&MemoryIndexRow::from_memory(&memory))
                .await?;
        }

        assert_eq!(store.delete_memory_index_for_persona("p1").await?, 2);
        assert_eq!(store.memory_index_count("p1").await?, 0);
        assert_eq!(store.memory_index_count("p2").await?, 1);
        Ok(())
    }
}
