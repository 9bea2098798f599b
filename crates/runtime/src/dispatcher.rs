//! JSON-RPC method router. Each method parses its params into a typed
//! request struct, runs against the shared state, and produces exactly one
//! result or error frame; streaming methods (suffix `_stream`) are delegated
//! to the streaming module which frames its own events.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use persona_core::{
    Conversation, Error, Memory, MemoryType, Persona, Relationship, ResponseType, unix_now,
};
use persona_llm::GenerationConstraints;
use persona_memory::StoreMemoryRequest;

use crate::rpc::{
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, RpcRequest, error_frame,
    result_frame,
};
use crate::state::AppState;
use crate::streaming;

pub struct RpcFailure {
    pub code: i64,
    pub message: String,
}

impl From<Error> for RpcFailure {
    fn from(err: Error) -> Self {
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
        }
    }
}

type RpcResult = std::result::Result<Value, RpcFailure>;

pub struct Dispatcher {
    state: Arc<AppState>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Handle one inbound text frame; every outbound frame goes through
    /// `out` so streaming producers and plain responses share one ordered
    /// sink.
    pub async fn handle_message(&self, raw: &str, connection_id: &str, out: &mpsc::Sender<String>) {
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                let _ = out
                    .send(error_frame(None, PARSE_ERROR, &format!("Parse error: {err}")))
                    .await;
                return;
            }
        };

        let id = parsed.get("id").cloned();
        let request: RpcRequest = match serde_json::from_value(parsed) {
            Ok(request) => request,
            Err(err) => {
                let _ = out
                    .send(error_frame(
                        id.as_ref(),
                        INVALID_REQUEST,
                        &format!("Invalid request: {err}"),
                    ))
                    .await;
                return;
            }
        };

        debug!(method = %request.method, connection = connection_id, "dispatching");

        if request.method.ends_with("_stream") {
            streaming::handle_streaming_request(&self.state, &request, connection_id, out).await;
            return;
        }

        let frame = match self.dispatch(&request, connection_id).await {
            Ok(result) => result_frame(request.id.as_ref(), result),
            Err(failure) => error_frame(request.id.as_ref(), failure.code, &failure.message),
        };
        let _ = out.send(frame).await;
    }

    async fn dispatch(&self, request: &RpcRequest, connection_id: &str) -> RpcResult {
        let params = request.params.clone().unwrap_or_else(|| json!({}));

        match request.method.as_str() {
            "persona.switch" => self.persona_switch(parse(params)?, connection_id).await,
            "persona.chat" => self.persona_chat(parse(params)?, connection_id).await,
            "persona.list" => self.persona_list().await,
            "persona.create" => self.persona_create(parse(params)?).await,
            "persona.delete" => self.persona_delete(parse(params)?, connection_id).await,
            "persona.status" => self.persona_status(parse(params)?, connection_id).await,
            "persona.memory" => self.persona_memory(parse(params)?, connection_id).await,
            "persona.relationship" => {
                self.persona_relationship(parse(params)?, connection_id).await
            }

            "conversation.start" => self.conversation_start(parse(params)?).await,
            "conversation.end" => self.conversation_end(parse(params)?).await,
            "conversation.status" => self.conversation_status(parse(params)?).await,

            "memory.search" => self.memory_search(parse(params)?, connection_id).await,
            "memory.store" => self.memory_store(parse(params)?, connection_id).await,
            "memory.stats" => self.memory_stats(parse(params)?, connection_id).await,
            "memory.prune" => self.memory_prune(parse(params)?, connection_id).await,
            "memory.prune_all" => self.memory_prune_all().await,
            "memory.prune_recommendations" => {
                self.memory_prune_recommendations(parse(params)?, connection_id).await
            }
            "memory.prune_stats" => Ok(json!({ "pruning_statistics": self.state.pruning.stats() })),
            "memory.decay_start" => self.memory_decay_start().await,
            "memory.decay_stop" => self.memory_decay_stop().await,
            "memory.decay_stats" => self.memory_decay_stats().await,
            "memory.decay_force" => self.memory_decay_force(parse(params)?, connection_id).await,
            "memory.search_cross_persona" => {
                self.memory_search_cross_persona(parse(params)?, connection_id).await
            }
            "memory.shared_stats" => self.memory_shared_stats().await,

            "relationship.get" => self.relationship_get(parse(params)?).await,
            "relationship.list" => self.relationship_list(parse(params)?, connection_id).await,
            "relationship.compatibility" => self.relationship_compatibility(parse(params)?).await,
            "relationship.stats" => self.relationship_stats().await,
            "relationship.update" => self.relationship_update(parse(params)?).await,

            "emotional.get_state" => self.emotional_get_state(parse(params)?, connection_id).await,
            "emotional.update_state" => {
                self.emotional_update_state(parse(params)?, connection_id).await
            }

            "state.save" => self.state_save(connection_id).await,
            "state.load" => self.state_load(connection_id).await,

            "system.status" => self.system_status(connection_id).await,
            "system.models" => self.system_models().await,

            "visual.update" => self.visual_update(parse(params)?).await,

            "stream.cancel" => self.stream_cancel(parse(params)?).await,

            other => Err(RpcFailure {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {other}"),
            }),
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn current_persona_id(&self, connection_id: &str) -> Result<String, Error> {
        self.state
            .sessions
            .current_persona(connection_id)
            .ok_or_else(|| Error::input("No persona selected. Use persona.switch first"))
    }

    fn persona_or_current(
        &self,
        persona_id: Option<String>,
        connection_id: &str,
    ) -> Result<String, Error> {
        match persona_id {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => self.current_persona_id(connection_id),
        }
    }

    async fn load_persona(&self, persona_id: &str) -> Result<Persona, Error> {
        self.state
            .store
            .load_persona(persona_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Persona not found: {persona_id}")))
    }

    // ── Persona methods ───────────────────────────────────────────────────────

    async fn persona_switch(&self, params: PersonaIdParams, connection_id: &str) -> RpcResult {
        let persona_id = params
            .persona_id
            .ok_or_else(|| Error::input("persona_id is required"))?;

        // Id first, case-insensitive name second.
        let persona = match self.state.store.load_persona(&persona_id).await? {
            Some(persona) => persona,
            None => self
                .state
                .store
                .load_persona_by_name(&persona_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("Persona not found: {persona_id}")))?,
        };

        if !persona.interaction_state.is_available() {
            return Err(Error::unavailable(format!(
                "Persona {} is not available for interaction",
                persona.name
            ))
            .into());
        }

        self.state.sessions.set_current_persona(connection_id, &persona.id);

        Ok(json!({
            "persona_id": persona.id,
            "name": persona.name,
            "description": persona.description,
            "status": "active",
            "social_energy": persona.interaction_state.social_energy,
            "available_time": persona.interaction_state.available_time,
            "current_priority": persona.interaction_state.current_priority.as_str(),
        }))
    }

    async fn persona_chat(&self, params: ChatParams, connection_id: &str) -> RpcResult {
        let message = params
            .message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::input("message is required"))?;
        let token_budget = params.token_budget.unwrap_or(500);

        let persona_id = self.current_persona_id(connection_id)?;
        let mut persona = self.load_persona(&persona_id).await?;

        let session = self.state.sessions.conversation_session(&persona_id);
        let turn_count = session.as_ref().map(|s| s.turn_count).unwrap_or(0);
        let conversation_id = self
            .state
            .sessions
            .current_conversation_id(connection_id)
            .unwrap_or_else(|| "mcp_session".to_string());

        let mut context = Conversation::new(vec![persona_id.clone()], "general", token_budget);
        context.id = conversation_id;
        context.turn_count = turn_count;

        let constraints = GenerationConstraints {
            max_length: Some(((token_budget as f64 / 1.3) as u32).clamp(20, 300)),
            ..Default::default()
        };

        let started = Instant::now();
        let outcome = self
            .state
            .generator
            .client()
            .generate(&message, &persona, &context, &constraints)
            .await;
        let processing_time = started.elapsed().as_secs_f64();

        let response_type = if outcome.backend_error.is_some() {
            ResponseType::Template
        } else {
            ResponseType::FullLlm
        };
        let tokens_used = (outcome.text.split_whitespace().count() as f64 * 1.3) as i64;

        // Talking costs the persona at least a minute of social time.
        persona
            .interaction_state
            .apply_fatigue((processing_time as i64).max(60));
        self.state.store.save_persona(&persona).await?;
        self.state.sessions.increment_turn(&persona_id);

        let memory_content = format!("User said: {message}. I responded: {}", outcome.text);
        let mut metadata = serde_json::Map::new();
        metadata.insert("continue_score".into(), json!(50));
        metadata.insert("topic".into(), json!("user_conversation"));
        metadata.insert("response_type".into(), json!(response_type.as_str()));

        let stored = self
            .state
            .memory
            .store(StoreMemoryRequest {
                persona_id: persona_id.clone(),
                content: memory_content,
                metadata: Some(metadata),
                ..Default::default()
            })
            .await;
        if let Err(err) = stored {
            warn!(%err, "failed to store chat memory");
        }

        Ok(json!({
            "response": outcome.text,
            "response_type": response_type.as_str(),
            "continue_score": 50,
            "tokens_used": tokens_used,
            "processing_time": processing_time,
            "persona_state": {
                "social_energy": persona.interaction_state.social_energy,
                "available_time": persona.interaction_state.available_time,
                "interaction_fatigue": persona.interaction_state.interaction_fatigue,
            },
        }))
    }

    async fn persona_list(&self) -> RpcResult {
        let personas = self.state.store.list_personas().await?;

        let listed: Vec<Value> = personas
            .iter()
            .map(|persona| {
                json!({
                    "id": persona.id,
                    "name": persona.name,
                    "description": persona.description,
                    "available": persona.interaction_state.is_available(),
                    "social_energy": persona.interaction_state.social_energy,
                    "current_priority": persona.interaction_state.current_priority.as_str(),
                    "cooldown_remaining":
                        (persona.interaction_state.cooldown_until - unix_now()).max(0.0),
                })
            })
            .collect();

        let available = listed
            .iter()
            .filter(|p| p["available"].as_bool().unwrap_or(false))
            .count();

        Ok(json!({
            "personas": listed,
            "total_count": personas.len(),
            "available_count": available,
        }))
    }

    async fn persona_create(&self, params: CreatePersonaParams) -> RpcResult {
        let name = params
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| Error::input("name is required"))?;

        let mut persona = Persona::new(name, params.description.unwrap_or_default())
            .with_attributes(
                params.charisma.unwrap_or(10),
                params.intelligence.unwrap_or(10),
                params.social_rank.unwrap_or_else(|| "commoner".to_string()),
            );
        persona.personality_traits = params.personality_traits.unwrap_or_default();
        persona.topic_preferences = params.topic_preferences.unwrap_or_default();

        self.state.store.save_persona(&persona).await?;
        self.state.store.emotional_state(&persona.id).await?;

        Ok(json!({
            "persona_id": persona.id,
            "name": persona.name,
            "created": true,
        }))
    }

    async fn persona_delete(&self, params: PersonaIdParams, connection_id: &str) -> RpcResult {
        let persona_id = params
            .persona_id
            .ok_or_else(|| Error::input("persona_id is required"))?;
        let persona = self.load_persona(&persona_id).await?;

        if self.state.sessions.current_persona(connection_id).as_deref() == Some(&persona_id) {
            self.state.sessions.clear_current_persona(connection_id);
        }

        if let Err(err) = self.state.memory.delete_persona_memories(&persona_id).await {
            warn!(%err, persona = %persona_id, "failed to delete persona memories");
        }
        self.state.store.delete_persona(&persona_id).await?;

        Ok(json!({
            "persona_id": persona_id,
            "name": persona.name,
            "deleted": true,
            "message": format!(
                "Persona '{}' and all associated data deleted successfully",
                persona.name
            ),
        }))
    }

    async fn persona_status(&self, params: PersonaIdParams, connection_id: &str) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let persona = self.load_persona(&persona_id).await?;
        let memory_stats = self.state.memory.stats(&persona_id).await?;

        Ok(json!({
            "persona": {
                "id": persona.id,
                "name": persona.name,
                "description": persona.description,
                "personality_traits": persona.personality_traits,
                "topic_preferences": persona.topic_preferences,
                "charisma": persona.charisma,
                "intelligence": persona.intelligence,
                "social_rank": persona.social_rank,
            },
            "interaction_state": {
                "interest_level": persona.interaction_state.interest_level,
                "interaction_fatigue": persona.interaction_state.interaction_fatigue,
                "current_priority": persona.interaction_state.current_priority.as_str(),
                "available_time": persona.interaction_state.available_time,
                "social_energy": persona.interaction_state.social_energy,
                "cooldown_until": persona.interaction_state.cooldown_until,
                "is_available": persona.interaction_state.is_available(),
            },
            "memory_stats": memory_stats.to_json(),
        }))
    }

    async fn persona_memory(&self, params: PersonaMemoryParams, connection_id: &str) -> RpcResult {
        let persona_id = self.current_persona_id(connection_id)?;
        let query = params.query.unwrap_or_default();
        let limit = params.limit.unwrap_or(5);

        let memories = self
            .state
            .memory
            .search(&persona_id, &query, limit, 0.0, None)
            .await?;

        Ok(json!({
            "memories": memories
                .iter()
                .map(|memory| json!({
                    "content": memory.content,
                    "importance": memory.importance,
                    "memory_type": memory.memory_type.as_str(),
                    "created_at": memory.created_at.to_rfc3339(),
                }))
                .collect::<Vec<_>>(),
            "query": query,
            "total_found": memories.len(),
        }))
    }

    async fn persona_relationship(
        &self,
        params: PersonaRelationshipParams,
        connection_id: &str,
    ) -> RpcResult {
        let persona_id = self.current_persona_id(connection_id)?;

        match params.target_persona {
            Some(target) => {
                let relationship = self.state.relationships.get(&persona_id, &target).await?;
                Ok(json!({
                    "current_persona": persona_id,
                    "target_persona": target,
                    "relationship": relationship.as_ref().map(relationship_to_json),
                }))
            }
            None => {
                let relationships = self.state.relationships.list_for(&persona_id).await?;
                Ok(json!({
                    "current_persona": persona_id,
                    "relationships": relationships
                        .iter()
                        .map(relationship_to_json)
                        .collect::<Vec<_>>(),
                }))
            }
        }
    }

    // ── Conversation methods ──────────────────────────────────────────────────

    async fn conversation_start(&self, params: ConversationStartParams) -> RpcResult {
        let persona1_id = params
            .persona1_id
            .ok_or_else(|| Error::input("Both persona1_id and persona2_id are required"))?;
        let persona2_id = params
            .persona2_id
            .ok_or_else(|| Error::input("Both persona1_id and persona2_id are required"))?;

        let topic = params.topic.unwrap_or_else(|| "general".to_string());
        let token_budget = params.token_budget.unwrap_or(1000);

        let context = self
            .state
            .engine
            .initiate(&persona1_id, &persona2_id, &topic, token_budget)
            .await?;

        Ok(json!({
            "conversation_id": context.id,
            "participants": context.participants,
            "topic": context.topic,
            "started": true,
        }))
    }

    async fn conversation_end(&self, params: ConversationEndParams) -> RpcResult {
        let conversation_id = params
            .conversation_id
            .ok_or_else(|| Error::input("conversation_id is required"))?;
        let reason = params.reason.unwrap_or_else(|| "user_request".to_string());

        let context = self.state.engine.end(&conversation_id, &reason).await?;

        Ok(json!({
            "conversation_id": conversation_id,
            "ended": true,
            "reason": reason,
            "final_stats": {
                "duration": context.duration,
                "turns": context.turn_count,
                "tokens_used": context.tokens_used,
            },
        }))
    }

    async fn conversation_status(&self, params: ConversationEndParams) -> RpcResult {
        let conversation_id = params
            .conversation_id
            .ok_or_else(|| Error::input("conversation_id is required"))?;
        Ok(self.state.engine.status(&conversation_id).await?)
    }

    // ── Memory methods ────────────────────────────────────────────────────────

    async fn memory_search(&self, params: MemorySearchParams, connection_id: &str) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let query = params
            .query
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| Error::input("query is required"))?;

        let memory_type = params
            .memory_type
            .as_deref()
            .map(MemoryType::from_str)
            .transpose()
            .map_err(Error::InputInvalid)?;

        let memories = self
            .state
            .memory
            .search(
                &persona_id,
                &query,
                params.n_results.unwrap_or(5),
                params.min_importance.unwrap_or(0.0),
                memory_type,
            )
            .await?;

        Ok(json!({
            "memories": memories.iter().map(memory_to_json).collect::<Vec<_>>(),
            "query": query,
            "result_count": memories.len(),
        }))
    }

    async fn memory_store(&self, params: MemoryStoreParams, connection_id: &str) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let content = params
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::input("content is required"))?;

        let memory = self
            .state
            .memory
            .store(StoreMemoryRequest {
                persona_id,
                content,
                memory_type: params.memory_type,
                importance: params.importance,
                emotional_valence: params.emotional_valence,
                related_personas: params.related_personas.unwrap_or_default(),
                visibility: params.visibility,
                metadata: params.metadata,
            })
            .await?;

        Ok(json!({
            "memory_id": memory.id,
            "stored": true,
        }))
    }

    async fn memory_stats(&self, params: PersonaIdParams, connection_id: &str) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        Ok(self.state.memory.stats(&persona_id).await?.to_json())
    }

    async fn memory_prune(&self, params: MemoryPruneParams, connection_id: &str) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let force = params.force.unwrap_or(false);

        if !self.state.pruning.should_prune(&persona_id).await? && !force {
            let stats = self.state.memory.stats(&persona_id).await?;
            return Ok(json!({
                "status": "no_pruning_needed",
                "persona_id": persona_id,
                "current_memory_count": stats.total_memories,
                "message": "Memory collection is within acceptable limits",
            }));
        }

        let metrics = self
            .state
            .pruning
            .prune_persona(&persona_id, params.cap, "importance_based")
            .await?;

        Ok(json!({
            "status": "pruning_completed",
            "persona_id": persona_id,
            "memories_before": metrics.total_memories_before,
            "memories_after": metrics.total_memories_after,
            "memories_pruned": metrics.memories_pruned,
            "processing_time": metrics.processing_time_seconds,
            "average_importance_pruned": metrics.average_importance_pruned,
            "average_importance_kept": metrics.average_importance_kept,
        }))
    }

    async fn memory_prune_all(&self) -> RpcResult {
        let metrics = self.state.pruning.prune_all().await?;
        Ok(json!({
            "status": "global_pruning_completed",
            "personas_processed": metrics.personas_processed,
            "total_memories_before": metrics.total_memories_before,
            "total_memories_after": metrics.total_memories_after,
            "total_memories_pruned": metrics.memories_pruned,
            "processing_time": metrics.processing_time_seconds,
            "errors_encountered": metrics.errors_encountered,
        }))
    }

    async fn memory_prune_recommendations(
        &self,
        params: PersonaIdParams,
        connection_id: &str,
    ) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let recommendations = self.state.pruning.recommendations(&persona_id).await?;
        Ok(json!({
            "persona_id": persona_id,
            "recommendations": recommendations,
        }))
    }

    async fn memory_decay_start(&self) -> RpcResult {
        self.state.decay.start().await;
        Ok(json!({
            "status": "background_decay_started",
            "interval_seconds": self.state.decay.interval_seconds(),
            "decay_rate": self.state.config.memory.decay_rate,
            "auto_pruning": self.state.config.memory.pruning_enabled,
        }))
    }

    async fn memory_decay_stop(&self) -> RpcResult {
        self.state.decay.stop().await;
        Ok(json!({ "status": "background_decay_stopped" }))
    }

    async fn memory_decay_stats(&self) -> RpcResult {
        let stats = self.state.decay.stats().await;
        Ok(json!({
            "decay_statistics": {
                "running": stats.running,
                "cycles_completed": stats.cycles_completed,
                "memories_processed": stats.memories_processed,
                "memories_decayed": stats.memories_decayed,
                "auto_prunes_triggered": stats.auto_prunes_triggered,
                "last_cycle_at": stats.last_cycle_at.map(|ts| ts.to_rfc3339()),
                "interval_seconds": self.state.decay.interval_seconds(),
            },
        }))
    }

    async fn memory_decay_force(
        &self,
        params: DecayForceParams,
        connection_id: &str,
    ) -> RpcResult {
        let decay_factor = params.decay_factor.unwrap_or(0.1);
        let persona_id = params
            .persona_id
            .or_else(|| self.state.sessions.current_persona(connection_id));

        match persona_id {
            Some(persona_id) => {
                let metrics = self
                    .state
                    .decay
                    .force_decay_persona(&persona_id, decay_factor)
                    .await?;
                Ok(json!({
                    "status": "persona_decay_completed",
                    "persona_id": persona_id,
                    "decay_factor": decay_factor,
                    "memories_processed": metrics.memories_processed,
                    "memories_decayed": metrics.memories_decayed,
                }))
            }
            None => {
                let metrics = self.state.decay.run_cycle().await?;
                Ok(json!({
                    "status": "global_decay_cycle_completed",
                    "personas_processed": metrics.personas_processed,
                    "memories_decayed": metrics.memories_decayed,
                    "auto_prunes_triggered": metrics.auto_prunes_triggered,
                    "processing_time": metrics.processing_time_seconds,
                }))
            }
        }
    }

    async fn memory_search_cross_persona(
        &self,
        params: CrossPersonaSearchParams,
        connection_id: &str,
    ) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let query = params
            .query
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| Error::input("Query is required"))?;

        let n_results = params.n_results.unwrap_or(10).min(50);
        let min_importance = params.min_importance.unwrap_or(0.6);
        let include_shared = params.include_shared.unwrap_or(true);
        let include_public = params.include_public.unwrap_or(true);

        let hits = self
            .state
            .memory
            .search_cross_persona(
                &persona_id,
                &query,
                n_results,
                min_importance,
                include_shared,
                include_public,
            )
            .await?;

        Ok(json!({
            "requesting_persona": persona_id,
            "query": query,
            "memories": hits
                .iter()
                .map(|hit| json!({
                    "memory_id": hit.memory.id,
                    "content": hit.memory.content,
                    "similarity": hit.similarity,
                    "importance": hit.memory.importance,
                    "memory_type": hit.memory.memory_type.as_str(),
                    "created_at": hit.memory.created_at.to_rfc3339(),
                    "visibility": hit.memory.visibility.as_str(),
                    "source": "cross_persona",
                    "source_persona": hit.memory.persona_id,
                }))
                .collect::<Vec<_>>(),
            "total_results": hits.len(),
            "search_params": {
                "min_importance": min_importance,
                "include_shared": include_shared,
                "include_public": include_public,
            },
        }))
    }

    async fn memory_shared_stats(&self) -> RpcResult {
        Ok(json!({
            "shared_memory_statistics": self.state.memory.shared_stats().await?,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    // ── Relationship methods ──────────────────────────────────────────────────

    async fn relationship_get(&self, params: PairParams) -> RpcResult {
        let (persona1_id, persona2_id) = params.required()?;
        let relationship = self.state.relationships.get(&persona1_id, &persona2_id).await?;

        match relationship {
            Some(relationship) => Ok(json!({
                "relationship": relationship_to_json(&relationship),
                "exists": true,
            })),
            None => Ok(json!({
                "relationship": null,
                "exists": false,
                "message": format!(
                    "No relationship found between {persona1_id} and {persona2_id}"
                ),
            })),
        }
    }

    async fn relationship_list(&self, params: PersonaIdParams, connection_id: &str) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let relationships = self.state.relationships.list_for(&persona_id).await?;

        Ok(json!({
            "persona_id": persona_id,
            "relationships": relationships
                .iter()
                .map(|relationship| {
                    let mut entry = relationship_to_json(relationship);
                    if let Some(map) = entry.as_object_mut() {
                        map.insert(
                            "other_persona_id".into(),
                            json!(relationship.other_of(&persona_id)),
                        );
                    }
                    entry
                })
                .collect::<Vec<_>>(),
            "total_relationships": relationships.len(),
        }))
    }

    async fn relationship_compatibility(&self, params: PairParams) -> RpcResult {
        let (persona1_id, persona2_id) = params.required()?;
        let persona1 = self.load_persona(&persona1_id).await?;
        let persona2 = self.load_persona(&persona2_id).await?;

        let relationship = self.state.relationships.get(&persona1_id, &persona2_id).await?;
        let analysis = self.state.compatibility.overall_compatibility(
            &persona1,
            &persona2,
            relationship.as_ref(),
        );
        let suggestions = self
            .state
            .compatibility
            .suggest_interaction_approach(&persona1, &persona2, &analysis);

        Ok(json!({
            "persona1": { "id": persona1.id, "name": persona1.name },
            "persona2": { "id": persona2.id, "name": persona2.name },
            "compatibility_analysis": analysis.to_json(),
            "interaction_suggestions": suggestions.to_json(),
            "existing_relationship": relationship.is_some(),
        }))
    }

    async fn relationship_stats(&self) -> RpcResult {
        Ok(json!({
            "relationship_statistics": self.state.relationships.stats().await?,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    async fn relationship_update(&self, params: RelationshipUpdateParams) -> RpcResult {
        let persona1_id = params
            .persona1_id
            .ok_or_else(|| Error::input("Both persona1_id and persona2_id are required"))?;
        let persona2_id = params
            .persona2_id
            .ok_or_else(|| Error::input("Both persona1_id and persona2_id are required"))?;

        let quality = params.interaction_quality.unwrap_or(0.0);
        if !(-1.0..=1.0).contains(&quality) {
            return Err(Error::input(
                "interaction_quality must be a number between -1.0 and 1.0",
            )
            .into());
        }
        let duration_minutes = params.duration_minutes.unwrap_or(5.0);
        let context = params.context.unwrap_or_else(|| "conversation".to_string());

        let success = self
            .state
            .relationships
            .process_interaction(&persona1_id, &persona2_id, quality, duration_minutes, &context)
            .await?;

        if !success {
            return Ok(json!({
                "success": false,
                "message": "Failed to update relationship",
                "error": "Processing failed",
            }));
        }

        let updated = self.state.relationships.get(&persona1_id, &persona2_id).await?;
        Ok(json!({
            "success": true,
            "message": "Relationship updated successfully",
            "interaction_processed": {
                "quality": quality,
                "duration_minutes": duration_minutes,
                "context": context,
            },
            "updated_relationship": updated.as_ref().map(relationship_to_json),
        }))
    }

    // ── Emotional methods ─────────────────────────────────────────────────────

    async fn emotional_get_state(&self, params: PersonaIdParams, connection_id: &str) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let state = self.state.relationships.emotional_state(&persona_id).await?;

        Ok(json!({
            "persona_id": persona_id,
            "emotional_state": {
                "mood": state.mood,
                "energy_level": state.energy_level,
                "stress_level": state.stress_level,
                "curiosity": state.curiosity,
                "social_battery": state.social_battery,
                "last_updated": state.last_updated.to_rfc3339(),
            },
        }))
    }

    async fn emotional_update_state(
        &self,
        params: EmotionalUpdateParams,
        connection_id: &str,
    ) -> RpcResult {
        let persona_id = self.persona_or_current(params.persona_id, connection_id)?;
        let mut state = self.state.relationships.emotional_state(&persona_id).await?;

        if let Some(mood) = params.mood {
            state.mood = mood.clamp(-1.0, 1.0);
        }
        if let Some(energy_level) = params.energy_level {
            state.energy_level = energy_level.clamp(0.0, 1.0);
        }
        if let Some(stress_level) = params.stress_level {
            state.stress_level = stress_level.clamp(0.0, 1.0);
        }
        if let Some(curiosity) = params.curiosity {
            state.curiosity = curiosity.clamp(0.0, 1.0);
        }
        if let Some(social_battery) = params.social_battery {
            state.social_battery = social_battery.clamp(0.0, 1.0);
        }
        state.last_updated = Utc::now();

        self.state.relationships.update_emotional_state(&state).await?;

        Ok(json!({
            "success": true,
            "message": "Emotional state updated successfully",
            "updated_state": {
                "mood": state.mood,
                "energy_level": state.energy_level,
                "stress_level": state.stress_level,
                "curiosity": state.curiosity,
                "social_battery": state.social_battery,
                "last_updated": state.last_updated.to_rfc3339(),
            },
        }))
    }

    // ── State / system methods ────────────────────────────────────────────────

    async fn state_save(&self, connection_id: &str) -> RpcResult {
        Ok(json!({
            "state_saved": true,
            "state": {
                "current_persona_id": self.state.sessions.current_persona(connection_id),
                "current_conversation_id": self.state.sessions.current_conversation_id(connection_id),
                "active_conversations": self.state.engine.active_count().await,
                "timestamp": Utc::now().to_rfc3339(),
            },
        }))
    }

    async fn state_load(&self, connection_id: &str) -> RpcResult {
        Ok(json!({
            "state_loaded": true,
            "current_persona_id": self.state.sessions.current_persona(connection_id),
            "current_conversation_id": self.state.sessions.current_conversation_id(connection_id),
        }))
    }

    async fn system_status(&self, connection_id: &str) -> RpcResult {
        let llm_available = self.state.generator.client().is_available().await;
        let personas = self.state.store.list_personas().await.unwrap_or_default();
        let available = personas
            .iter()
            .filter(|p| p.interaction_state.is_available())
            .count();

        Ok(json!({
            "system_status": "operational",
            "llm_available": llm_available,
            "total_personas": personas.len(),
            "available_personas": available,
            "active_conversations": self.state.engine.active_count().await,
            "current_persona": self.state.sessions.current_persona(connection_id),
            "current_conversation": self.state.sessions.current_conversation_id(connection_id),
            "uptime_seconds": self.state.started_at.elapsed().as_secs(),
            "sessions": self.state.sessions.status(),
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    async fn system_models(&self) -> RpcResult {
        let models = self.state.generator.client().list_models().await;
        Ok(json!({
            "available_models": models,
            "current_model": self.state.generator.client().default_model(),
            "provider": "ollama",
        }))
    }

    async fn visual_update(&self, params: VisualUpdateParams) -> RpcResult {
        Ok(json!({
            "visual_updated": true,
            "update_type": params.update_type.unwrap_or_else(|| "general".to_string()),
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    async fn stream_cancel(&self, params: StreamCancelParams) -> RpcResult {
        let stream_id = params
            .stream_id
            .ok_or_else(|| Error::input("stream_id is required"))?;

        if !self.state.sessions.cancel_streaming_session(&stream_id) {
            return Err(Error::not_found(format!("Stream not found: {stream_id}")).into());
        }
        Ok(json!({ "stream_id": stream_id, "cancelled": true }))
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(params).map_err(|err| RpcFailure {
        code: INVALID_PARAMS,
        message: format!("Invalid params: {err}"),
    })
}

fn memory_to_json(memory: &Memory) -> Value {
    json!({
        "id": memory.id,
        "content": memory.content,
        "memory_type": memory.memory_type.as_str(),
        "importance": memory.importance,
        "emotional_valence": memory.emotional_valence,
        "related_personas": memory.related_personas,
        "visibility": memory.visibility.as_str(),
        "created_at": memory.created_at.to_rfc3339(),
        "accessed_count": memory.accessed_count,
    })
}

fn relationship_to_json(relationship: &Relationship) -> Value {
    json!({
        "persona1_id": relationship.persona1_id,
        "persona2_id": relationship.persona2_id,
        "affinity": relationship.affinity,
        "trust": relationship.trust,
        "respect": relationship.respect,
        "intimacy": relationship.intimacy,
        "relationship_type": relationship.relationship_type.as_str(),
        "interaction_count": relationship.interaction_count,
        "total_interaction_time": relationship.total_interaction_time,
        "compatibility_score": relationship.compatibility_score(),
        "relationship_strength": relationship.strength(),
        "last_interaction": relationship.last_interaction.map(|ts| ts.to_rfc3339()),
        "first_meeting": relationship.first_meeting.to_rfc3339(),
    })
}

// ── Typed param records ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct PersonaIdParams {
    #[serde(default)]
    persona_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatParams {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    token_budget: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct CreatePersonaParams {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    personality_traits: Option<HashMap<String, Value>>,
    #[serde(default)]
    topic_preferences: Option<HashMap<String, i64>>,
    #[serde(default)]
    charisma: Option<i64>,
    #[serde(default)]
    intelligence: Option<i64>,
    #[serde(default)]
    social_rank: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PersonaMemoryParams {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PersonaRelationshipParams {
    #[serde(default)]
    target_persona: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationStartParams {
    #[serde(default)]
    persona1_id: Option<String>,
    #[serde(default)]
    persona2_id: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    token_budget: Option<i64>,
    /// Accepted for wire compatibility; duration limits are enforced by the
    /// participants' own time budgets.
    #[serde(default)]
    #[allow(dead_code)]
    max_duration: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationEndParams {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MemorySearchParams {
    #[serde(default)]
    persona_id: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    n_results: Option<usize>,
    #[serde(default)]
    memory_type: Option<String>,
    #[serde(default)]
    min_importance: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStoreParams {
    #[serde(default)]
    persona_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    memory_type: Option<String>,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default)]
    emotional_valence: Option<f64>,
    #[serde(default)]
    related_personas: Option<Vec<String>>,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryPruneParams {
    #[serde(default)]
    persona_id: Option<String>,
    #[serde(default)]
    force: Option<bool>,
    #[serde(default)]
    cap: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DecayForceParams {
    #[serde(default)]
    persona_id: Option<String>,
    #[serde(default)]
    decay_factor: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrossPersonaSearchParams {
    #[serde(default)]
    persona_id: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    n_results: Option<usize>,
    #[serde(default)]
    min_importance: Option<f64>,
    #[serde(default)]
    include_shared: Option<bool>,
    #[serde(default)]
    include_public: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct PairParams {
    #[serde(default)]
    persona1_id: Option<String>,
    #[serde(default)]
    persona2_id: Option<String>,
}

impl PairParams {
    fn required(self) -> Result<(String, String), Error> {
        match (self.persona1_id, self.persona2_id) {
            (Some(first), Some(second)) => Ok((first, second)),
            _ => Err(Error::input("Both persona1_id and persona2_id are required")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RelationshipUpdateParams {
    #[serde(default)]
    persona1_id: Option<String>,
    #[serde(default)]
    persona2_id: Option<String>,
    #[serde(default)]
    interaction_quality: Option<f64>,
    #[serde(default)]
    duration_minutes: Option<f64>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EmotionalUpdateParams {
    #[serde(default)]
    persona_id: Option<String>,
    #[serde(default)]
    mood: Option<f64>,
    #[serde(default)]
    energy_level: Option<f64>,
    #[serde(default)]
    stress_level: Option<f64>,
    #[serde(default)]
    curiosity: Option<f64>,
    #[serde(default)]
    social_battery: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct VisualUpdateParams {
    #[serde(default, rename = "type")]
    update_type: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamCancelParams {
    #[serde(default)]
    stream_id: Option<String>,
}
