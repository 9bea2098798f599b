//! Eviction of low-value memories under per-persona caps.
//!
//! Retention priority is `importance + 0.01 * accessed_count`; ties are
//! broken by older `last_accessed` first, so stale records go before ones
//! that were read recently.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;

use persona_core::{Memory, Result};
use persona_store::SqliteStore;

use crate::vector::VectorIndex;

#[derive(Debug, Clone, Default)]
pub struct PruneMetrics {
    pub persona_id: String,
    pub total_memories_before: usize,
    pub total_memories_after: usize,
    pub memories_pruned: usize,
    pub average_importance_pruned: f64,
    pub average_importance_kept: f64,
    pub processing_time_seconds: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalPruneMetrics {
    pub personas_processed: usize,
    pub total_memories_before: usize,
    pub total_memories_after: usize,
    pub memories_pruned: usize,
    pub processing_time_seconds: f64,
    pub errors_encountered: usize,
}

/// Sort key: (priority, last_accessed). Memories that were never accessed
/// sort before ones with the same priority that were.
fn eviction_order(memory: &Memory) -> (f64, Option<DateTime<Utc>>) {
    (memory.retention_priority(), memory.last_accessed)
}

/// Shared eviction core used by both the memory manager's `prune` and the
/// pruning system.
pub(crate) async fn evict_lowest(
    store: &SqliteStore,
    vector: &dyn VectorIndex,
    persona_id: &str,
    cap: usize,
) -> Result<PruneMetrics> {
    let started = Instant::now();
    let mut memories = vector.list(persona_id).await?;
    let before = memories.len();

    let mut metrics = PruneMetrics {
        persona_id: persona_id.to_string(),
        total_memories_before: before,
        total_memories_after: before,
        ..Default::default()
    };

    if before <= cap {
        metrics.processing_time_seconds = started.elapsed().as_secs_f64();
        return Ok(metrics);
    }

    memories.sort_by(|a, b| {
        eviction_order(a)
            .partial_cmp(&eviction_order(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let to_remove = before - cap;
    let (evicted, kept) = memories.split_at(to_remove);

    for memory in evicted {
        vector.delete(&memory.id).await?;
        store.delete_memory_index(&memory.id).await?;
    }

    metrics.total_memories_after = kept.len();
    metrics.memories_pruned = evicted.len();
    metrics.average_importance_pruned = mean_importance(evicted);
    metrics.average_importance_kept = mean_importance(kept);
    metrics.processing_time_seconds = started.elapsed().as_secs_f64();

    info!(
        persona = persona_id,
        pruned = metrics.memories_pruned,
        remaining = metrics.total_memories_after,
        "memory pruning complete"
    );
    Ok(metrics)
}

fn mean_importance(memories: &[Memory]) -> f64 {
    if memories.is_empty() {
        return 0.0;
    }
    memories.iter().map(|m| m.importance).sum::<f64>() / memories.len() as f64
}

pub struct PruningSystem {
    store: SqliteStore,
    vector: Arc<dyn VectorIndex>,
    max_per_persona: usize,
    runs: std::sync::atomic::AtomicU64,
    total_pruned: std::sync::atomic::AtomicU64,
}

impl PruningSystem {
    pub fn new(store: SqliteStore, vector: Arc<dyn VectorIndex>, max_per_persona: usize) -> Self {
        Self {
            store,
            vector,
            max_per_persona,
            runs: std::sync::atomic::AtomicU64::new(0),
            total_pruned: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub async fn should_prune(&self, persona_id: &str) -> Result<bool> {
        Ok(self.vector.count(persona_id).await? as usize > self.max_per_persona)
    }

    /// Prune one persona. `strategy` exists for forward compatibility; only
    /// "importance_based" is implemented.
    pub async fn prune_persona(
        &self,
        persona_id: &str,
        cap: Option<usize>,
        _strategy: &str,
    ) -> Result<PruneMetrics> {
        let cap = cap.unwrap_or(self.max_per_persona);
        let metrics = evict_lowest(&self.store, self.vector.as_ref(), persona_id, cap).await?;

        self.runs.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.total_pruned.fetch_add(
            metrics.memories_pruned as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
        Ok(metrics)
    }

    pub async fn prune_all(&self) -> Result<GlobalPruneMetrics> {
        let started = Instant::now();
        let mut global = GlobalPruneMetrics::default();

        for persona_id in self.vector.collections().await? {
            match self
                .prune_persona(&persona_id, None, "importance_based")
                .await
            {
                Ok(metrics) => {
                    global.personas_processed += 1;
                    global.total_memories_before += metrics.total_memories_before;
                    global.total_memories_after += metrics.total_memories_after;
                    global.memories_pruned += metrics.memories_pruned;
                }
                Err(err) => {
                    tracing::warn!(persona = %persona_id, %err, "pruning failed for persona");
                    global.errors_encountered += 1;
                }
            }
        }

        global.processing_time_seconds = started.elapsed().as_secs_f64();
        Ok(global)
    }

    /// Report eviction candidates without deleting anything.
    pub async fn recommendations(&self, persona_id: &str) -> Result<serde_json::Value> {
        let mut memories = self.vector.list(persona_id).await?;
        let count = memories.len();

        if count <= self.max_per_persona {
            return Ok(serde_json::json!({
                "needs_pruning": false,
                "current_count": count,
                "cap": self.max_per_persona,
                "candidates": [],
            }));
        }

        memories.sort_by(|a, b| {
            eviction_order(a)
                .partial_cmp(&eviction_order(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let candidates: Vec<serde_json::Value> = memories
            .iter()
            .take(count - self.max_per_persona)
            .map(|m| {
                serde_json::json!({
                    "memory_id": m.id,
                    "importance": m.importance,
                    "accessed_count": m.accessed_count,
                    "priority": m.retention_priority(),
                })
            })
            .collect();

        Ok(serde_json::json!({
            "needs_pruning": true,
            "current_count": count,
            "cap": self.max_per_persona,
            "candidates": candidates,
        }))
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "prune_runs": self.runs.load(std::sync::atomic::Ordering::Relaxed),
            "total_memories_pruned": self.total_pruned.load(std::sync::atomic::Ordering::Relaxed),
            "max_memories_per_persona": self.max_per_persona,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::vector::SqliteVectorIndex;
    use persona_core::Memory;

    async fn fixtures() -> (SqliteStore, Arc<dyn VectorIndex>) {
        let store = SqliteStore::connect_in_memory().await.expect("store opens");
        let vector: Arc<dyn VectorIndex> = Arc::new(
            SqliteVectorIndex::open_in_memory(Arc::new(HashEmbedder::default()))
                .await
                .expect("index opens"),
        );
        (store, vector)
    }

    async fn seed(vector: &Arc<dyn VectorIndex>, persona: &str, importance: f64, accesses: i64) -> Memory {
        let mut memory = Memory::new(persona, format!("memory at {importance}"));
        memory.importance = importance;
        memory.accessed_count = accesses;
        vector.store(&memory).await.expect("stores");
        memory
    }

    #[tokio::test]
    async fn keeps_highest_priority_memories() -> Result<()> {
        let (store, vector) = fixtures().await;

        seed(&vector, "p1", 0.2, 0).await;
        seed(&vector, "p1", 0.8, 0).await;
        seed(&vector, "p1", 0.5, 0).await;
        let accessed = seed(&vector, "p1", 0.2, 40).await; // priority 0.6 via accesses

        let metrics = evict_lowest(&store, vector.as_ref(), "p1", 2).await?;
        assert_eq!(metrics.memories_pruned, 2);
        assert_eq!(metrics.total_memories_after, 2);

        let kept = vector.list("p1").await?;
        let kept_ids: Vec<&str> = kept.iter().map(|m| m.id.as_str()).collect();
        assert!(kept_ids.contains(&accessed.id.as_str()));
        assert!(metrics.average_importance_kept >= metrics.average_importance_pruned);
        Ok(())
    }

    #[tokio::test]
    async fn retained_min_priority_exceeds_evicted_max() -> Result<()> {
        let (store, vector) = fixtures().await;

        for i in 0..12 {
            seed(&vector, "p1", 0.1 + (i as f64) * 0.05, 0).await;
        }

        evict_lowest(&store, vector.as_ref(), "p1", 5).await?;
        let kept = vector.list("p1").await?;
        assert_eq!(kept.len(), 5);

        let min_kept = kept
            .iter()
            .map(|m| m.retention_priority())
            .fold(f64::INFINITY, f64::min);
        // Everything kept has priority at least as high as anything evicted.
        assert!(min_kept >= 0.1 + 6.0 * 0.05 - 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn noop_when_under_cap() -> Result<()> {
        let (store, vector) = fixtures().await;
        seed(&vector, "p1", 0.5, 0).await;

        let metrics = evict_lowest(&store, vector.as_ref(), "p1", 10).await?;
        assert_eq!(metrics.memories_pruned, 0);
        assert_eq!(metrics.total_memories_after, 1);
        Ok(())
    }

    #[tokio::test]
    async fn recommendations_do_not_delete() -> Result<()> {
        let (store, vector) = fixtures().await;
        let system = PruningSystem::new(store, vector.clone(), 2);

        for _ in 0..4 {
            seed(&vector, "p1", 0.3, 0).await;
        }

        let recs = system.recommendations("p1").await?;
        assert_eq!(recs["needs_pruning"], true);
        assert_eq!(recs["candidates"].as_array().map(Vec::len), Some(2));
        assert_eq!(vector.count("p1").await?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn prune_all_covers_every_collection() -> Result<()> {
        let (store, vector) = fixtures().await;
        let system = PruningSystem::new(store, vector.clone(), 1);

        seed(&vector, "p1", 0.2, 0).await;
        seed(&vector, "p1", 0.8, 0).await;
        seed(&vector, "p2", 0.2, 0).await;
        seed(&vector, "p2", 0.8, 0).await;

        let global = system.prune_all().await?;
        assert_eq!(global.personas_processed, 2);
        assert_eq!(global.memories_pruned, 2);
        assert_eq!(vector.count("p1").await?, 1);
        assert_eq!(vector.count("p2").await?, 1);
        Ok(())
    }
}
