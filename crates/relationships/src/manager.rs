use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use persona_core::{
    EmotionalState, MemorableMoment, Relationship, RelationshipType, Result, canonical_pair,
};
use persona_store::{InteractionRecord, SqliteStore};

/// Read-through cache entries for relationship rows; the records are small so
/// this is purely to skip repeat lookups inside a conversation.
const CACHE_CAPACITY: usize = 256;

pub struct RelationshipManager {
    store: SqliteStore,
    cache: Mutex<LruCache<String, Relationship>>,
}

fn cache_key(a: &str, b: &str) -> String {
    let (first, second) = canonical_pair(a, b);
    format!("{first}|{second}")
}

impl RelationshipManager {
    pub fn new(store: SqliteStore) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Symmetric lookup through the cache.
    pub async fn get(&self, persona1_id: &str, persona2_id: &str) -> Result<Option<Relationship>> {
        let key = cache_key(persona1_id, persona2_id);
        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok(Some(cached.clone()));
        }

        let loaded = self.store.load_relationship(persona1_id, persona2_id).await?;
        if let Some(ref relationship) = loaded {
            self.cache.lock().put(key, relationship.clone());
        }
        Ok(loaded)
    }

    /// Symmetric lookup, creating and persisting a neutral Stranger record
    /// when the pair has never met.
    pub async fn get_or_create(&self, persona1_id: &str, persona2_id: &str) -> Result<Relationship> {
        if let Some(existing) = self.get(persona1_id, persona2_id).await? {
            return Ok(existing);
        }

        let relationship = Relationship::new_stranger(persona1_id, persona2_id);
        self.save(&relationship).await?;
        Ok(relationship)
    }

    pub async fn save(&self, relationship: &Relationship) -> Result<()> {
        self.store.save_relationship(relationship).await?;
        // Write-through: replace rather than invalidate so the next read hits.
        self.cache.lock().put(
            cache_key(&relationship.persona1_id, &relationship.persona2_id),
            relationship.clone(),
        );
        Ok(())
    }

    pub async fn list_for(&self, persona_id: &str) -> Result<Vec<Relationship>> {
        self.store.list_relationships_for(persona_id).await
    }

    /// Apply one interaction to the pair. Returns false (without touching any
    /// state) when either persona does not exist.
    pub async fn process_interaction(
        &self,
        persona1_id: &str,
        persona2_id: &str,
        quality: f64,
        duration_minutes: f64,
        context: &str,
    ) -> Result<bool> {
        let quality = quality.clamp(-1.0, 1.0);

        if !self.store.persona_exists(persona1_id).await?
            || !self.store.persona_exists(persona2_id).await?
        {
            warn!(
                persona1 = persona1_id,
                persona2 = persona2_id,
                "interaction between nonexistent personas ignored"
            );
            return Ok(false);
        }

        let mut relationship = self.get_or_create(persona1_id, persona2_id).await?;

        update_scores(&mut relationship, quality, duration_minutes);
        apply_context_modifier(&mut relationship, context);
        relationship.clamp_dimensions();

        relationship.interaction_count += 1;
        relationship.total_interaction_time += duration_minutes;
        relationship.last_interaction = Some(Utc::now());
        relationship.recent_interaction_quality = quality;
        relationship.relationship_type = derive_type(&relationship);

        if quality.abs() > 0.7 {
            relationship.memorable_moments.push(MemorableMoment {
                timestamp: Utc::now(),
                quality,
                context: context.to_string(),
                duration_minutes,
            });
        }
        if context == "conflict" && quality < 0.0 {
            relationship.conflict_history.push(MemorableMoment {
                timestamp: Utc::now(),
                quality,
                context: context.to_string(),
                duration_minutes,
            });
        }

        self.save(&relationship).await?;
        self.store
            .log_interaction(&InteractionRecord {
                persona1_id: relationship.persona1_id.clone(),
                persona2_id: relationship.persona2_id.clone(),
                interaction_quality: quality,
                duration_minutes,
                context: context.to_string(),
                timestamp: Utc::now(),
            })
            .await?;

        debug!(
            persona1 = %relationship.persona1_id,
            persona2 = %relationship.persona2_id,
            quality,
            relationship_type = relationship.relationship_type.as_str(),
            "interaction processed"
        );
        Ok(true)
    }

    // ── Emotional states ──────────────────────────────────────────────────────

    pub async fn emotional_state(&self, persona_id: &str) -> Result<EmotionalState> {
        self.store.emotional_state(persona_id).await
    }

    pub async fn update_emotional_state(&self, state: &EmotionalState) -> Result<()> {
        self.store.save_emotional_state(state).await
    }

    /// Post-turn emotional drift for one participant.
    pub async fn apply_interaction_effect(
        &self,
        persona_id: &str,
        quality: f64,
        duration_minutes: f64,
    ) -> Result<EmotionalState> {
        let mut state = self.store.emotional_state(persona_id).await?;
        state.apply_interaction_effect(quality, duration_minutes);
        self.store.save_emotional_state(&state).await?;
        Ok(state)
    }

    pub async fn stats(&self) -> Result<serde_json::Value> {
        self.store.relationship_stats().await
    }
}

/// Duration-weighted score updates. Trust only grows on positive quality,
/// respect moves only on significant interactions, intimacy needs a positive
/// extended exchange.
fn update_scores(relationship: &mut Relationship, quality: f64, duration_minutes: f64) {
    let weight = (duration_minutes / 30.0).min(1.0);

    relationship.affinity += quality * 0.05 * weight;

    if quality > 0.0 {
        relationship.trust += quality * 0.03 * weight;
    }
    if quality.abs() > 0.5 {
        relationship.respect += quality * 0.04 * weight;
    }
    if quality > 0.3 && duration_minutes > 10.0 {
        relationship.intimacy += 0.02 * weight;
    }
}

fn apply_context_modifier(relationship: &mut Relationship, context: &str) {
    match context {
        "conflict" => {
            relationship.trust -= 0.2;
            relationship.affinity -= 0.1;
        }
        "collaboration" => {
            relationship.trust += 0.1;
            relationship.respect += 0.1;
        }
        "casual" => {
            relationship.affinity += 0.1;
        }
        "deep_conversation" => {
            relationship.intimacy += 0.1;
            relationship.trust += 0.05;
        }
        "professional" => {
            relationship.respect += 0.1;
        }
        _ => {}
    }
}

/// Relationship type as a function of the dimension mean and interaction
/// count.
fn derive_type(relationship: &Relationship) -> RelationshipType {
    let avg = (relationship.affinity
        + relationship.trust
        + relationship.respect
        + relationship.intimacy)
        / 4.0;

    if relationship.interaction_count < 3 {
        RelationshipType::Stranger
    } else if avg < 0.3 {
        if relationship.affinity < 0.2 {
            RelationshipType::Enemy
        } else {
            RelationshipType::Rival
        }
    } else if avg < 0.5 {
        RelationshipType::Acquaintance
    } else if avg < 0.7 {
        RelationshipType::Friend
    } else if relationship.intimacy > 0.8 {
        RelationshipType::Romantic
    } else if relationship.respect > 0.8 && relationship.interaction_count > 10 {
        RelationshipType::Mentor
    } else {
        RelationshipType::CloseFriend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::Persona;

    async fn fixtures() -> (RelationshipManager, String, String) {
        let store = SqliteStore::connect_in_memory().await.expect("store opens");
        let alice = Persona::new("Alice", "first");
        let bob = Persona::new("Bob", "second");
        store.save_persona(&alice).await.expect("saves");
        store.save_persona(&bob).await.expect("saves");
        (RelationshipManager::new(store), alice.id, bob.id)
    }

    #[tokio::test]
    async fn get_or_create_returns_neutral_stranger() -> Result<()> {
        let (manager, alice, bob) = fixtures().await;

        let rel = manager.get_or_create(&alice, &bob).await?;
        assert_eq!(rel.relationship_type, RelationshipType::Stranger);
        assert_eq!(rel.affinity, 0.0);
        assert_eq!(rel.interaction_count, 0);

        // Second call must return the same record, not a new one.
        let again = manager.get_or_create(&bob, &alice).await?;
        assert_eq!(again.id, rel.id);
        Ok(())
    }

    #[tokio::test]
    async fn interaction_is_symmetric_in_argument_order() -> Result<()> {
        let (manager, alice, bob) = fixtures().await;

        manager
            .process_interaction(&alice, &bob, 0.8, 20.0, "collaboration")
            .await?;

        let forward = manager.get(&alice, &bob).await?.expect("exists");
        let reverse = manager.get(&bob, &alice).await?.expect("exists");
        assert_eq!(forward.id, reverse.id);
        assert_eq!(forward.trust, reverse.trust);
        assert_eq!(forward.interaction_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_persona_fails_without_state_change() -> Result<()> {
        let (manager, alice, _bob) = fixtures().await;

        let applied = manager
            .process_interaction(&alice, "ghost", 0.5, 5.0, "casual")
            .await?;
        assert!(!applied);
        assert!(manager.get(&alice, "ghost").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn trust_only_grows_on_positive_quality() -> Result<()> {
        let (manager, alice, bob) = fixtures().await;

        manager
            .process_interaction(&alice, &bob, -0.4, 30.0, "general")
            .await?;
        let rel = manager.get(&alice, &bob).await?.expect("exists");
        assert_eq!(rel.trust, 0.0);
        assert!(rel.affinity < 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn context_modifiers_apply() -> Result<()> {
        let (manager, alice, bob) = fixtures().await;

        manager
            .process_interaction(&alice, &bob, 0.1, 5.0, "conflict")
            .await?;
        let rel = manager.get(&alice, &bob).await?.expect("exists");
        assert!(rel.trust < 0.0);
        assert!(rel.affinity < 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn dimensions_stay_clamped() -> Result<()> {
        let (manager, alice, bob) = fixtures().await;

        for _ in 0..30 {
            manager
                .process_interaction(&alice, &bob, -1.0, 30.0, "conflict")
                .await?;
        }

        let rel = manager.get(&alice, &bob).await?.expect("exists");
        assert!(rel.trust >= -1.0);
        assert!(rel.affinity >= -1.0);
        assert!(rel.intimacy >= 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn memorable_moments_recorded_for_intense_interactions() -> Result<()> {
        let (manager, alice, bob) = fixtures().await;

        manager
            .process_interaction(&alice, &bob, 0.9, 15.0, "deep_conversation")
            .await?;
        manager
            .process_interaction(&alice, &bob, 0.1, 5.0, "casual")
            .await?;
        manager
            .process_interaction(&alice, &bob, -0.8, 10.0, "conflict")
            .await?;

        let rel = manager.get(&alice, &bob).await?.expect("exists");
        assert_eq!(rel.memorable_moments.len(), 2);
        assert_eq!(rel.conflict_history.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn type_derivation_progresses_with_interactions() -> Result<()> {
        let (manager, alice, bob) = fixtures().await;

        manager
            .process_interaction(&alice, &bob, 0.9, 30.0, "collaboration")
            .await?;
        let early = manager.get(&alice, &bob).await?.expect("exists");
        assert_eq!(early.relationship_type, RelationshipType::Stranger);

        for _ in 0..20 {
            manager
                .process_interaction(&alice, &bob, 0.9, 30.0, "deep_conversation")
                .await?;
        }
        let later = manager.get(&alice, &bob).await?.expect("exists");
        assert_ne!(later.relationship_type, RelationshipType::Stranger);
        assert!(later.interaction_count >= 21);
        Ok(())
    }

    #[tokio::test]
    async fn emotional_effects_drain_battery() -> Result<()> {
        let (manager, alice, _bob) = fixtures().await;

        let before = manager.emotional_state(&alice).await?;
        let after = manager.apply_interaction_effect(&alice, 0.8, 30.0).await?;
        assert!(after.social_battery < before.social_battery);
        assert!(after.mood >= before.mood);
        Ok(())
    }
}
