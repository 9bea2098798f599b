//! Background importance decay.
//!
//! Each cycle multiplies every memory's importance by
//! `exp(-k * elapsed_hours)`; memories that have been accessed at least once
//! decay at half rate. Collections that exceed the per-persona cap after a
//! cycle are pruned.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use persona_config::MemoryConfig;
use persona_core::Result;
use persona_store::SqliteStore;

use crate::pruning::evict_lowest;
use crate::vector::VectorIndex;

#[derive(Debug, Clone, Default)]
pub struct DecayStats {
    pub running: bool,
    pub cycles_completed: u64,
    pub memories_processed: u64,
    pub memories_decayed: u64,
    pub auto_prunes_triggered: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct DecayCycleMetrics {
    pub personas_processed: usize,
    pub memories_processed: usize,
    pub memories_decayed: usize,
    pub auto_prunes_triggered: usize,
    pub processing_time_seconds: f64,
}

pub struct DecaySystem {
    store: SqliteStore,
    vector: Arc<dyn VectorIndex>,
    config: MemoryConfig,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    stats: Mutex<DecayStats>,
}

impl DecaySystem {
    pub fn new(store: SqliteStore, vector: Arc<dyn VectorIndex>, config: MemoryConfig) -> Self {
        Self {
            store,
            vector,
            config,
            shutdown: Mutex::new(None),
            stats: Mutex::new(DecayStats::default()),
        }
    }

    /// Start the background loop. Returns false when it was already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut guard = self.shutdown.lock().await;
        if guard.is_some() {
            return false;
        }

        let (tx, mut rx) = watch::channel(false);
        *guard = Some(tx);
        self.stats.lock().await.running = true;

        let system = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.config.decay_interval_seconds.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = system.run_cycle().await {
                            warn!(%err, "background decay cycle failed");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            system.stats.lock().await.running = false;
            info!("background decay stopped");
        });

        info!(interval_secs = interval.as_secs(), "background decay started");
        true
    }

    /// Stop the background loop. Returns false when it was not running.
    pub async fn stop(&self) -> bool {
        let mut guard = self.shutdown.lock().await;
        match guard.take() {
            Some(tx) => {
                let _ = tx.send(true);
                self.stats.lock().await.running = false;
                true
            }
            None => false,
        }
    }

    pub async fn stats(&self) -> DecayStats {
        self.stats.lock().await.clone()
    }

    pub fn interval_seconds(&self) -> u64 {
        self.config.decay_interval_seconds
    }

    /// One full pass over every collection.
    pub async fn run_cycle(&self) -> Result<DecayCycleMetrics> {
        let started = Instant::now();
        let elapsed_hours = self.config.decay_interval_seconds as f64 / 3600.0;
        let mut metrics = DecayCycleMetrics::default();

        for persona_id in self.vector.collections().await? {
            let (processed, decayed) = self
                .decay_collection(&persona_id, self.config.decay_rate, elapsed_hours)
                .await?;
            metrics.personas_processed += 1;
            metrics.memories_processed += processed;
            metrics.memories_decayed += decayed;

            if self.config.pruning_enabled {
                let count = self.vector.count(&persona_id).await? as usize;
                if count > self.config.max_per_persona {
                    evict_lowest(
                        &self.store,
                        self.vector.as_ref(),
                        &persona_id,
                        self.config.max_per_persona,
                    )
                    .await?;
                    metrics.auto_prunes_triggered += 1;
                }
            }
        }

        metrics.processing_time_seconds = started.elapsed().as_secs_f64();

        let mut stats = self.stats.lock().await;
        stats.cycles_completed += 1;
        stats.memories_processed += metrics.memories_processed as u64;
        stats.memories_decayed += metrics.memories_decayed as u64;
        stats.auto_prunes_triggered += metrics.auto_prunes_triggered as u64;
        stats.last_cycle_at = Some(Utc::now());

        Ok(metrics)
    }

    /// Operator override: one-off decay of a single persona with an explicit
    /// linear factor (0.1 removes 10% of each memory's importance).
    pub async fn force_decay_persona(
        &self,
        persona_id: &str,
        factor: f64,
    ) -> Result<DecayCycleMetrics> {
        let started = Instant::now();
        let factor = factor.clamp(0.0, 1.0);
        let mut metrics = DecayCycleMetrics {
            personas_processed: 1,
            ..Default::default()
        };

        for memory in self.vector.list(persona_id).await? {
            metrics.memories_processed += 1;
            let next = (memory.importance * (1.0 - factor)).max(0.1);
            if next < memory.importance {
                self.vector.set_importance(&memory.id, next).await?;
                self.store.set_memory_importance(&memory.id, next).await?;
                metrics.memories_decayed += 1;
            }
        }

        metrics.processing_time_seconds = started.elapsed().as_secs_f64();
        Ok(metrics)
    }

    async fn decay_collection(
        &self,
        persona_id: &str,
        rate: f64,
        elapsed_hours: f64,
    ) -> Result<(usize, usize)> {
        let mut processed = 0;
        let mut decayed = 0;

        for memory in self.vector.list(persona_id).await? {
            processed += 1;

            // Accessed memories earn slower decay.
            let exponent = if memory.accessed_count > 0 {
                -rate * elapsed_hours * 0.5
            } else {
                -rate * elapsed_hours
            };
            let next = (memory.importance * exponent.exp()).max(0.1);

            if next < memory.importance {
                self.vector.set_importance(&memory.id, next).await?;
                self.store.set_memory_importance(&memory.id, next).await?;
                decayed += 1;
            }
        }

        Ok((processed, decayed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::vector::SqliteVectorIndex;
    use persona_core::Memory;

    async fn system(config: MemoryConfig) -> (Arc<DecaySystem>, Arc<dyn VectorIndex>) {
        let store = SqliteStore::connect_in_memory().await.expect("store opens");
        let vector: Arc<dyn VectorIndex> = Arc::new(
            SqliteVectorIndex::open_in_memory(Arc::new(HashEmbedder::default()))
                .await
                .expect("index opens"),
        );
        (
            Arc::new(DecaySystem::new(store, vector.clone(), config)),
            vector,
        )
    }

    async fn seed(vector: &Arc<dyn VectorIndex>, persona: &str, importance: f64, accesses: i64) -> Memory {
        let mut memory = Memory::new(persona, "decaying memory");
        memory.importance = importance;
        memory.accessed_count = accesses;
        vector.store(&memory).await.expect("stores");
        memory
    }

    #[tokio::test]
    async fn cycle_reduces_importance_exponentially() -> Result<()> {
        let config = MemoryConfig {
            decay_interval_seconds: 3600,
            decay_rate: 0.5,
            pruning_enabled: false,
            ..Default::default()
        };
        let (system, vector) = system(config).await;
        seed(&vector, "p1", 0.8, 0).await;

        let metrics = system.run_cycle().await?;
        assert_eq!(metrics.memories_decayed, 1);

        let after = vector.list("p1").await?[0].importance;
        let expected = 0.8 * (-0.5f64).exp();
        assert!((after - expected).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn accessed_memories_are_protected() -> Result<()> {
        let config = MemoryConfig {
            decay_interval_seconds: 3600,
            decay_rate: 0.5,
            pruning_enabled: false,
            ..Default::default()
        };
        let (system, vector) = system(config).await;
        let untouched = seed(&vector, "p1", 0.8, 0).await;
        let touched = seed(&vector, "p1", 0.8, 5).await;

        system.run_cycle().await?;

        let after = vector.list("p1").await?;
        let untouched_after = after.iter().find(|m| m.id == untouched.id).expect("listed");
        let touched_after = after.iter().find(|m| m.id == touched.id).expect("listed");
        assert!(touched_after.importance > untouched_after.importance);
        Ok(())
    }

    #[tokio::test]
    async fn importance_never_drops_below_floor() -> Result<()> {
        let config = MemoryConfig {
            decay_interval_seconds: 3600,
            decay_rate: 100.0,
            pruning_enabled: false,
            ..Default::default()
        };
        let (system, vector) = system(config).await;
        seed(&vector, "p1", 0.9, 0).await;

        system.run_cycle().await?;
        assert_eq!(vector.list("p1").await?[0].importance, 0.1);
        Ok(())
    }

    #[tokio::test]
    async fn over_cap_collections_are_pruned_after_decay() -> Result<()> {
        let config = MemoryConfig {
            decay_interval_seconds: 3600,
            decay_rate: 0.01,
            pruning_enabled: true,
            max_per_persona: 3,
            ..Default::default()
        };
        let (system, vector) = system(config).await;
        for i in 0..6 {
            seed(&vector, "p1", 0.2 + i as f64 * 0.1, 0).await;
        }

        let metrics = system.run_cycle().await?;
        assert_eq!(metrics.auto_prunes_triggered, 1);
        assert_eq!(vector.count("p1").await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn forced_decay_uses_linear_factor() -> Result<()> {
        let (system, vector) = system(MemoryConfig::default()).await;
        seed(&vector, "p1", 0.5, 0).await;

        let metrics = system.force_decay_persona("p1", 0.2).await?;
        assert_eq!(metrics.memories_decayed, 1);

        let after = vector.list("p1").await?[0].importance;
        assert!((after - 0.4).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn start_and_stop_toggle_running() {
        let (system, _vector) = system(MemoryConfig::default()).await;

        assert!(system.start().await);
        assert!(!system.start().await);
        assert!(system.stats().await.running);

        assert!(system.stop().await);
        assert!(!system.stop().await);
    }
}
