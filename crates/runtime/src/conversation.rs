//! Drives a turn: score, route to a response tier, persist, update state and
//! memory, and decide whether the conversation survives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};

use persona_config::PersonaConfig;
use persona_core::{
    Conversation, ConversationTurn, Error, Memory, MemoryType, Persona, Result, Visibility,
    unix_now,
};
use persona_llm::TieredGenerator;
use persona_memory::{MemoryManager, ScoringContext};
use persona_relationships::RelationshipManager;
use persona_store::SqliteStore;

use crate::scoring::ContinueScoreEngine;

pub struct ConversationEngine {
    store: SqliteStore,
    memory: Arc<MemoryManager>,
    relationships: Arc<RelationshipManager>,
    generator: Arc<TieredGenerator>,
    scoring: ContinueScoreEngine,
    persona_cfg: PersonaConfig,
    /// Active conversations. Each entry carries its own lock so turns within
    /// one conversation are totally ordered while different conversations
    /// proceed in parallel.
    active: Mutex<HashMap<String, Arc<Mutex<Conversation>>>>,
}

impl ConversationEngine {
    pub fn new(
        store: SqliteStore,
        memory: Arc<MemoryManager>,
        relationships: Arc<RelationshipManager>,
        generator: Arc<TieredGenerator>,
        scoring: ContinueScoreEngine,
        persona_cfg: PersonaConfig,
    ) -> Self {
        Self {
            store,
            memory,
            relationships,
            generator,
            scoring,
            persona_cfg,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn scoring(&self) -> &ContinueScoreEngine {
        &self.scoring
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Start a conversation between two personas. Both must currently be
    /// available.
    pub async fn initiate(
        &self,
        persona1_id: &str,
        persona2_id: &str,
        topic: &str,
        token_budget: i64,
    ) -> Result<Conversation> {
        let persona1 = self.load_persona(persona1_id).await?;
        let persona2 = self.load_persona(persona2_id).await?;

        for persona in [&persona1, &persona2] {
            if !persona.interaction_state.is_available() {
                return Err(Error::unavailable(format!(
                    "Persona {} is not available for interaction",
                    persona.name
                )));
            }
        }

        let conversation = Conversation::new(
            vec![persona1.id.clone(), persona2.id.clone()],
            topic,
            token_budget,
        );
        self.store.save_conversation(&conversation).await?;
        self.active.lock().await.insert(
            conversation.id.clone(),
            Arc::new(Mutex::new(conversation.clone())),
        );

        info!(
            conversation = %conversation.id,
            persona1 = %persona1.name,
            persona2 = %persona2.name,
            topic,
            "conversation started"
        );
        Ok(conversation)
    }

    /// Process one turn: score, generate, persist, fatigue, relationship,
    /// emotion, memory.
    pub async fn process_turn(
        &self,
        conversation_id: &str,
        speaker_id: &str,
        user_input: &str,
    ) -> Result<ConversationTurn> {
        let handle = self
            .conversation_handle(conversation_id)
            .await
            .ok_or_else(|| Error::not_found(format!("Conversation not found: {conversation_id}")))?;
        let mut context = handle.lock().await;
        if context.is_ended() {
            return Err(Error::not_found(format!(
                "Conversation not found: {conversation_id}"
            )));
        }

        let mut speaker = self.load_persona(speaker_id).await?;
        let other_id = context
            .participants
            .iter()
            .find(|participant| participant.as_str() != speaker_id)
            .cloned()
            .ok_or_else(|| Error::input("speaker is not a participant of this conversation"))?;
        let mut other = self.load_persona(&other_id).await?;

        let relationship = self.relationships.get_or_create(&speaker.id, &other.id).await?;
        let continue_score = self
            .scoring
            .score(&speaker, &other, &context, Some(&relationship));

        let started = Instant::now();
        let outcome = self
            .generator
            .generate_by_score(continue_score, user_input, &speaker, &context)
            .await;
        let processing_time = started.elapsed().as_secs_f64();
        let tokens_used = self
            .generator
            .estimate_tokens(&outcome.text, outcome.response_type);

        let turn = ConversationTurn {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: context.id.clone(),
            speaker_id: speaker.id.clone(),
            turn_number: context.turn_count + 1,
            content: outcome.text,
            response_type: outcome.response_type,
            continue_score,
            tokens_used,
            processing_time,
            created_at: chrono::Utc::now(),
        };

        context.add_turn(&speaker.id, continue_score);
        context.tokens_used += tokens_used;
        let turn_duration = (processing_time as i64).max(30);
        context.duration += turn_duration;
        context.token_budget -= tokens_used;

        // Speaker takes full fatigue for the turn, the listener half.
        speaker.interaction_state.apply_fatigue(turn_duration);
        other.interaction_state.apply_fatigue(turn_duration / 2);

        let positive = continue_score >= 60;
        let significance = (continue_score as f64 / 1000.0).min(0.1);
        let quality = if positive { significance } else { -significance };
        let duration_minutes = turn_duration as f64 / 60.0;
        self.relationships
            .process_interaction(&speaker.id, &other.id, quality, duration_minutes, "conversation")
            .await?;

        let emotional_valence = (continue_score - 50) as f64 / 50.0;
        self.relationships
            .apply_interaction_effect(&speaker.id, emotional_valence, duration_minutes)
            .await?;
        self.relationships
            .apply_interaction_effect(&other.id, emotional_valence, duration_minutes)
            .await?;

        self.store_turn_memories(&speaker, &other, &context, &turn, emotional_valence)
            .await?;

        self.store.save_turn(&turn).await?;
        self.store.save_conversation(&context).await?;
        self.store.save_persona(&speaker).await?;
        self.store.save_persona(&other).await?;

        if !context.should_continue() || continue_score < 40 {
            self.finalize(&mut context, "natural_conclusion").await?;
        }

        Ok(turn)
    }

    /// End a conversation and put both participants on cooldown.
    pub async fn end(&self, conversation_id: &str, reason: &str) -> Result<Conversation> {
        let handle = self
            .conversation_handle(conversation_id)
            .await
            .ok_or_else(|| Error::not_found(format!("Conversation not found: {conversation_id}")))?;
        let mut context = handle.lock().await;
        if !context.is_ended() {
            self.finalize(&mut context, reason).await?;
        }
        Ok(context.clone())
    }

    pub async fn status(&self, conversation_id: &str) -> Result<serde_json::Value> {
        let handle = self
            .conversation_handle(conversation_id)
            .await
            .ok_or_else(|| Error::not_found(format!("Conversation not found: {conversation_id}")))?;
        let context = handle.lock().await;

        Ok(serde_json::json!({
            "id": context.id,
            "participants": context.participants,
            "topic": context.topic,
            "turn_count": context.turn_count,
            "duration": context.duration,
            "continue_score": context.continue_score,
            "tokens_remaining": context.token_budget,
            "should_continue": context.should_continue(),
        }))
    }

    /// Background tick: regenerate interaction and emotional state for every
    /// persona from the wall clock.
    pub async fn regenerate_states(&self) -> Result<usize> {
        let personas = self.store.list_personas().await?;
        let mut updated = 0;

        for mut persona in personas {
            let now = chrono::Utc::now();
            let elapsed = (now - persona.interaction_state.last_updated).num_seconds();
            if elapsed <= 0 {
                continue;
            }

            persona.interaction_state.regenerate(elapsed);
            persona.interaction_state.last_updated = now;
            self.store.save_persona(&persona).await?;

            let mut emotional = self.store.emotional_state(&persona.id).await?;
            let hours = (now - emotional.last_updated).num_seconds() as f64 / 3600.0;
            if hours > 0.0 {
                emotional.regenerate_over_time(hours);
                emotional.last_updated = now;
                self.store.save_emotional_state(&emotional).await?;
            }

            updated += 1;
        }

        Ok(updated)
    }

    async fn conversation_handle(&self, conversation_id: &str) -> Option<Arc<Mutex<Conversation>>> {
        self.active.lock().await.get(conversation_id).cloned()
    }

    async fn load_persona(&self, persona_id: &str) -> Result<Persona> {
        self.store
            .load_persona(persona_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Persona not found: {persona_id}")))
    }

    /// Two memory records per turn, one from each point of view; the listener
    /// remembers at 80% of the speaker's importance.
    async fn store_turn_memories(
        &self,
        speaker: &Persona,
        other: &Persona,
        context: &Conversation,
        turn: &ConversationTurn,
        emotional_valence: f64,
    ) -> Result<()> {
        let relationship = self.relationships.get(&speaker.id, &other.id).await?;
        let scoring_context = ScoringContext {
            continue_score: Some(turn.continue_score),
            topic: Some(context.topic.clone()),
            turn_number: Some(turn.turn_number),
        };

        let speaker_content = format!("I said to {}: {}", other.name, turn.content);
        let listener_content = format!("{} said to me: {}", speaker.name, turn.content);

        let speaker_importance = self.memory.score_turn(
            &speaker_content,
            speaker,
            relationship.as_ref(),
            &scoring_context,
            Some(turn),
        );
        let listener_importance = (self.memory.score_turn(
            &listener_content,
            other,
            relationship.as_ref(),
            &scoring_context,
            Some(turn),
        ) * 0.8)
            .max(0.1);

        let mut metadata = serde_json::Map::new();
        metadata.insert("conversation_id".into(), serde_json::json!(context.id));
        metadata.insert("turn_number".into(), serde_json::json!(turn.turn_number));
        metadata.insert("topic".into(), serde_json::json!(context.topic));
        metadata.insert(
            "response_type".into(),
            serde_json::json!(turn.response_type.as_str()),
        );

        for (owner, related, content, importance) in [
            (&speaker.id, &other.id, speaker_content, speaker_importance),
            (&other.id, &speaker.id, listener_content, listener_importance),
        ] {
            let mut memory = Memory::new(owner.clone(), content);
            memory.memory_type = MemoryType::Conversation;
            memory.importance = importance;
            memory.emotional_valence = emotional_valence;
            memory.related_personas = vec![related.clone()];
            memory.visibility = Visibility::Private;
            memory.metadata = metadata.clone();

            if let Err(err) = self.memory.store_scored(memory).await {
                warn!(%err, "failed to store turn memory");
                return Err(err);
            }
        }

        Ok(())
    }

    /// Terminal transition: mark ended, apply cooldowns, persist, drop from
    /// the active map.
    async fn finalize(&self, context: &mut Conversation, reason: &str) -> Result<()> {
        context.end(reason);

        let mut participants = Vec::new();
        for persona_id in &context.participants {
            if let Some(persona) = self.store.load_persona(persona_id).await? {
                participants.push(persona);
            }
        }

        if !participants.is_empty() {
            let fatigue = participants[0].interaction_state.interaction_fatigue;
            let base = self.persona_cfg.base_cooldown_seconds;
            let mut cooldown = if context.continue_score > self.persona_cfg.high_continue_score {
                base * self.persona_cfg.satisfying_conversation_multiplier
            } else if context.continue_score < self.persona_cfg.low_continue_score {
                base * self.persona_cfg.unsatisfying_conversation_multiplier
            } else {
                base
            };
            cooldown *= 1.0 + fatigue as f64 / 100.0;

            let cooldown_until = unix_now() + cooldown;
            for persona in &mut participants {
                persona.interaction_state.cooldown_until = cooldown_until;
                self.store.save_persona(persona).await?;
            }
        }

        self.store.save_conversation(context).await?;
        self.active.lock().await.remove(&context.id);

        info!(conversation = %context.id, reason, "conversation ended");
        Ok(())
    }
}
