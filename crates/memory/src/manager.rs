//! The unified memory API over the two stores. The vector index is written
//! first, the structured index second; success means both writes landed.
//! The memory id is the idempotency key, so a retry after partial failure is
//! safe.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use persona_core::{Error, Memory, MemoryType, Persona, Relationship, Result, Visibility};
use persona_store::{MemoryIndexRow, SqliteStore};

use crate::pruning;
use crate::scorer::{ImportanceScorer, ScoringContext};
use crate::vector::{ScoredMemory, VectorIndex};

#[derive(Debug, Clone, Default)]
pub struct StoreMemoryRequest {
    pub persona_id: String,
    pub content: String,
    pub memory_type: Option<String>,
    pub importance: Option<f64>,
    pub emotional_valence: Option<f64>,
    pub related_personas: Vec<String>,
    pub visibility: Option<String>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub total_memories: i64,
    pub avg_importance: f64,
    pub memory_types: serde_json::Map<String, serde_json::Value>,
    pub high_importance_count: i64,
    pub created_today: i64,
}

impl MemoryStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_memories": self.total_memories,
            "avg_importance": self.avg_importance,
            "memory_types": self.memory_types,
            "high_importance_count": self.high_importance_count,
            "created_today": self.created_today,
        })
    }
}

pub struct MemoryManager {
    store: SqliteStore,
    vector: Arc<dyn VectorIndex>,
    scorer: ImportanceScorer,
}

impl MemoryManager {
    pub fn new(store: SqliteStore, vector: Arc<dyn VectorIndex>) -> Self {
        Self {
            store,
            vector,
            scorer: ImportanceScorer::new(),
        }
    }

    pub fn scorer(&self) -> &ImportanceScorer {
        &self.scorer
    }

    pub fn vector(&self) -> &Arc<dyn VectorIndex> {
        &self.vector
    }

    /// Store a new memory, auto-scoring importance when the caller did not
    /// provide one.
    pub async fn store(&self, request: StoreMemoryRequest) -> Result<Memory> {
        if request.persona_id.trim().is_empty() {
            return Err(Error::input("persona_id is required"));
        }
        if request.content.trim().is_empty() {
            return Err(Error::input("content is required"));
        }

        let memory_type = match request.memory_type.as_deref() {
            Some(raw) => MemoryType::from_str(raw).map_err(Error::InputInvalid)?,
            None => MemoryType::Conversation,
        };
        let visibility = match request.visibility.as_deref() {
            Some(raw) => Visibility::from_str(raw).map_err(Error::InputInvalid)?,
            None => Visibility::Private,
        };
        let metadata = request.metadata.unwrap_or_default();

        let importance = match request.importance {
            Some(value) => value.clamp(0.1, 1.0),
            None => {
                let context = ScoringContext::from_metadata(&metadata);
                let base = self
                    .scorer
                    .calculate(&request.content, None, None, Some(&context), None);
                self.scorer.apply_type_multiplier(memory_type, base)
            }
        };

        let mut memory = Memory::new(request.persona_id, request.content);
        memory.memory_type = memory_type;
        memory.importance = importance;
        memory.emotional_valence = request.emotional_valence.unwrap_or(0.0).clamp(-1.0, 1.0);
        memory.related_personas = request.related_personas;
        memory.visibility = visibility;
        memory.metadata = metadata;

        self.persist(&memory).await?;
        debug!(persona = %memory.persona_id, importance, "memory stored");
        Ok(memory)
    }

    /// Store a fully scored memory built by the conversation engine.
    pub async fn store_scored(&self, memory: Memory) -> Result<Memory> {
        self.persist(&memory).await?;
        Ok(memory)
    }

    /// Importance for a turn, with speaker/listener/relationship context.
    pub fn score_turn(
        &self,
        content: &str,
        speaker: &Persona,
        relationship: Option<&Relationship>,
        context: &ScoringContext,
        turn: Option<&persona_core::ConversationTurn>,
    ) -> f64 {
        self.scorer
            .calculate(content, Some(speaker), relationship, Some(context), turn)
    }

    async fn persist(&self, memory: &Memory) -> Result<()> {
        // Vector first; a structured-index failure after this leaves a
        // vector-only record that the next retry with the same id overwrites.
        self.vector.store(memory).await?;
        self.store
            .upsert_memory_index(&MemoryIndexRow::from_memory(memory))
            .await?;
        Ok(())
    }

    /// Semantic retrieval within a persona's own memory. Access counters on
    /// the returned set are bumped in both stores.
    pub async fn search(
        &self,
        persona_id: &str,
        query: &str,
        k: usize,
        min_importance: f64,
        memory_type: Option<MemoryType>,
    ) -> Result<Vec<Memory>> {
        let hits = match self
            .vector
            .search(persona_id, query, k, min_importance, memory_type)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(persona = persona_id, %err, "memory search failed; returning empty");
                return Ok(Vec::new());
            }
        };

        let mut results = Vec::with_capacity(hits.len());
        for ScoredMemory { mut memory, .. } in hits {
            memory.record_access();
            let _ = self
                .vector
                .update_access(&memory.id, memory.accessed_count, Utc::now())
                .await;
            let _ = self
                .store
                .touch_memory_index(&memory.id, memory.accessed_count, Utc::now())
                .await;
            results.push(memory);
        }

        Ok(results)
    }

    /// Retrieval across other personas' shared/public memories. Never
    /// returns a private memory: visibility filtering happens in the index
    /// query itself, one query per requested level.
    pub async fn search_cross_persona(
        &self,
        requester_id: &str,
        query: &str,
        k: usize,
        min_importance: f64,
        include_shared: bool,
        include_public: bool,
    ) -> Result<Vec<ScoredMemory>> {
        let mut levels = Vec::new();
        if include_shared {
            levels.push(Visibility::Shared);
        }
        if include_public {
            levels.push(Visibility::Public);
        }

        let mut all = Vec::new();
        for persona_id in self.vector.collections().await? {
            if persona_id == requester_id {
                continue;
            }

            for level in &levels {
                match self
                    .vector
                    .search_visibility(&persona_id, query, k, min_importance, *level)
                    .await
                {
                    Ok(mut hits) => all.append(&mut hits),
                    Err(err) => {
                        warn!(persona = %persona_id, %err, "cross-persona query failed; skipping");
                    }
                }
            }
        }

        all.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(k);
        Ok(all)
    }

    pub async fn stats(&self, persona_id: &str) -> Result<MemoryStats> {
        let memories = self.vector.list(persona_id).await.unwrap_or_else(|err| {
            warn!(persona = persona_id, %err, "stats listing failed; treating as empty");
            Vec::new()
        });

        let total = memories.len() as i64;
        let avg_importance = if memories.is_empty() {
            0.0
        } else {
            memories.iter().map(|m| m.importance).sum::<f64>() / memories.len() as f64
        };

        let mut memory_types = serde_json::Map::new();
        for memory in &memories {
            let entry = memory_types
                .entry(memory.memory_type.as_str().to_string())
                .or_insert(serde_json::json!(0));
            if let Some(count) = entry.as_i64() {
                *entry = serde_json::json!(count + 1);
            }
        }

        let today = Utc::now().date_naive();
        let created_today = memories
            .iter()
            .filter(|m| m.created_at.date_naive() == today)
            .count() as i64;
        let high_importance_count =
            memories.iter().filter(|m| m.importance >= 0.7).count() as i64;

        Ok(MemoryStats {
            total_memories: total,
            avg_importance,
            memory_types,
            high_importance_count,
            created_today,
        })
    }

    /// Shared-memory overview across every collection.
    pub async fn shared_stats(&self) -> Result<serde_json::Value> {
        let mut shared_total = 0usize;
        let mut public_total = 0usize;
        let mut cross_references = 0usize;
        let mut by_persona = serde_json::Map::new();

        let collections = self.vector.collections().await?;
        let total_personas = collections.len();
        for persona_id in collections {
            let memories = self.vector.list(&persona_id).await.unwrap_or_default();
            let shared = memories
                .iter()
                .filter(|m| m.visibility == Visibility::Shared)
                .count();
            let public = memories
                .iter()
                .filter(|m| m.visibility == Visibility::Public)
                .count();
            let refs = memories
                .iter()
                .filter(|m| !m.related_personas.is_empty())
                .count();

            shared_total += shared;
            public_total += public;
            cross_references += refs;
            by_persona.insert(
                persona_id,
                serde_json::json!({
                    "shared": shared,
                    "public": public,
                    "cross_references": refs,
                }),
            );
        }

        Ok(serde_json::json!({
            "total_personas": total_personas,
            "shared_memories": shared_total,
            "public_memories": public_total,
            "cross_references": cross_references,
            "by_persona": by_persona,
        }))
    }

    /// Evict lowest-priority memories until the collection fits the cap.
    pub async fn prune(&self, persona_id: &str, cap: usize) -> Result<pruning::PruneMetrics> {
        pruning::evict_lowest(&self.store, self.vector.as_ref(), persona_id, cap).await
    }

    pub async fn delete_persona_memories(&self, persona_id: &str) -> Result<u64> {
        let removed = self.vector.delete_collection(persona_id).await?;
        self.store.delete_memory_index_for_persona(persona_id).await?;
        Ok(removed)
    }

    pub async fn count(&self, persona_id: &str) -> Result<i64> {
        self.vector.count(persona_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::vector::SqliteVectorIndex;

    async fn manager() -> MemoryManager {
        let store = SqliteStore::connect_in_memory().await.expect("store opens");
        let vector = SqliteVectorIndex::open_in_memory(Arc::new(HashEmbedder::default()))
            .await
            .expect("index opens");
        MemoryManager::new(store, Arc::new(vector))
    }

    fn request(persona: &str, content: &str) -> StoreMemoryRequest {
        StoreMemoryRequest {
            persona_id: persona.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stored_memory_is_returned_by_broad_search() -> Result<()> {
        let manager = manager().await;
        let stored = manager
            .store(request("p1", "we found the hidden artifact in the ruins"))
            .await?;

        let results = manager
            .search("p1", "hidden artifact ruins", 100, 0.0, None)
            .await?;
        assert!(results.iter().any(|m| m.id == stored.id));
        Ok(())
    }

    #[tokio::test]
    async fn missing_importance_is_auto_scored() -> Result<()> {
        let manager = manager().await;
        let memory = manager
            .store(request("p1", "I made a solemn promise never to reveal this secret!"))
            .await?;
        assert!((0.1..=1.0).contains(&memory.importance));
        assert!(memory.importance > 0.3);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_enum_values_are_rejected() {
        let manager = manager().await;

        let mut bad_type = request("p1", "content");
        bad_type.memory_type = Some("gossip".to_string());
        assert!(matches!(
            manager.store(bad_type).await,
            Err(Error::InputInvalid(_))
        ));

        let mut bad_visibility = request("p1", "content");
        bad_visibility.visibility = Some("everyone".to_string());
        assert!(matches!(
            manager.store(bad_visibility).await,
            Err(Error::InputInvalid(_))
        ));
    }

    #[tokio::test]
    async fn search_updates_access_counters() -> Result<()> {
        let manager = manager().await;
        manager.store(request("p1", "memorable event at the market")).await?;

        manager.search("p1", "market event", 10, 0.0, None).await?;
        let listed = manager.vector().list("p1").await?;
        assert_eq!(listed[0].accessed_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn cross_persona_search_never_leaks_private() -> Result<()> {
        let manager = manager().await;

        let mut m1 = request("alice", "private diary entry about the festival");
        m1.visibility = Some("private".to_string());
        m1.importance = Some(0.9);
        let private = manager.store(m1).await?;

        let mut m2 = request("alice", "shared note about the festival");
        m2.visibility = Some("shared".to_string());
        m2.importance = Some(0.9);
        let shared = manager.store(m2).await?;

        let mut m3 = request("alice", "public announcement about the festival");
        m3.visibility = Some("public".to_string());
        m3.importance = Some(0.9);
        let public = manager.store(m3).await?;

        let results = manager
            .search_cross_persona("bob", "festival", 10, 0.0, true, true)
            .await?;

        let ids: Vec<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
        assert!(ids.contains(&shared.id.as_str()));
        assert!(ids.contains(&public.id.as_str()));
        assert!(!ids.contains(&private.id.as_str()));
        for hit in &results {
            assert_ne!(hit.memory.visibility, Visibility::Private);
        }
        Ok(())
    }

    #[tokio::test]
    async fn cross_persona_search_respects_level_toggles() -> Result<()> {
        let manager = manager().await;

        let mut shared = request("alice", "shared festival plan");
        shared.visibility = Some("shared".to_string());
        manager.store(shared).await?;

        let mut public = request("alice", "public festival plan");
        public.visibility = Some("public".to_string());
        manager.store(public).await?;

        let only_public = manager
            .search_cross_persona("bob", "festival plan", 10, 0.0, false, true)
            .await?;
        assert_eq!(only_public.len(), 1);
        assert_eq!(only_public[0].memory.visibility, Visibility::Public);
        Ok(())
    }

    #[tokio::test]
    async fn stats_count_types_and_importance() -> Result<()> {
        let manager = manager().await;

        let mut goal = request("p1", "become the guild master");
        goal.memory_type = Some("goal".to_string());
        goal.importance = Some(0.9);
        manager.store(goal).await?;

        let mut routine = request("p1", "swept the shop floor");
        routine.memory_type = Some("routine".to_string());
        routine.importance = Some(0.2);
        manager.store(routine).await?;

        let stats = manager.stats("p1").await?;
        assert_eq!(stats.total_memories, 2);
        assert_eq!(stats.memory_types["goal"], 1);
        assert_eq!(stats.created_today, 2);
        assert_eq!(stats.high_importance_count, 1);
        assert!((stats.avg_importance - 0.55).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn delete_persona_memories_clears_both_stores() -> Result<()> {
        let manager = manager().await;
        manager.store(request("p1", "one")).await?;
        manager.store(request("p1", "two")).await?;

        assert_eq!(manager.delete_persona_memories("p1").await?, 2);
        assert_eq!(manager.count("p1").await?, 0);
        Ok(())
    }
}
