//! Shared runtime state: every component wired together once at startup.

use std::sync::Arc;
use std::time::Instant;

use persona_config::AppConfig;
use persona_core::Result;
use persona_llm::{OllamaClient, TieredGenerator};
use persona_memory::{
    DecaySystem, Embedder, HashEmbedder, MemoryManager, OllamaEmbedder, PruningSystem,
    SqliteVectorIndex,
};
use persona_relationships::{CompatibilityEngine, RelationshipManager};
use persona_store::SqliteStore;

use crate::conversation::ConversationEngine;
use crate::scoring::ContinueScoreEngine;
use crate::session::SessionManager;

pub struct AppState {
    pub config: AppConfig,
    pub store: SqliteStore,
    pub memory: Arc<MemoryManager>,
    pub relationships: Arc<RelationshipManager>,
    pub compatibility: CompatibilityEngine,
    pub engine: Arc<ConversationEngine>,
    pub sessions: Arc<SessionManager>,
    pub decay: Arc<DecaySystem>,
    pub pruning: Arc<PruningSystem>,
    pub generator: Arc<TieredGenerator>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the full component graph against on-disk stores.
    pub async fn initialize(config: AppConfig) -> Result<Arc<Self>> {
        let store = SqliteStore::connect(&config.database).await?;

        let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(
            &config.llm.base_url,
            &config.llm.default_model,
        ));
        let vector = Arc::new(SqliteVectorIndex::open(&config.database.vector_path, embedder).await?);

        Ok(Self::assemble(config, store, vector))
    }

    /// In-memory variant with the deterministic embedder, for tests and the
    /// simulation driver's dry runs.
    pub async fn initialize_in_memory(config: AppConfig) -> Result<Arc<Self>> {
        let store = SqliteStore::connect_in_memory().await?;
        let vector =
            Arc::new(SqliteVectorIndex::open_in_memory(Arc::new(HashEmbedder::default())).await?);
        Ok(Self::assemble(config, store, vector))
    }

    fn assemble(config: AppConfig, store: SqliteStore, vector: Arc<SqliteVectorIndex>) -> Arc<Self> {
        let vector: Arc<dyn persona_memory::VectorIndex> = vector;
        let memory = Arc::new(MemoryManager::new(store.clone(), vector.clone()));
        let relationships = Arc::new(RelationshipManager::new(store.clone()));
        let generator = Arc::new(TieredGenerator::new(
            OllamaClient::new(&config.llm),
            config.llm.max_concurrent_requests,
        ));
        let scoring =
            ContinueScoreEngine::new(config.conversation.clone(), config.persona.clone());
        let engine = Arc::new(ConversationEngine::new(
            store.clone(),
            memory.clone(),
            relationships.clone(),
            generator.clone(),
            scoring,
            config.persona.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(config.session.session_timeout_hours));
        let decay = Arc::new(DecaySystem::new(
            store.clone(),
            vector.clone(),
            config.memory.clone(),
        ));
        let pruning = Arc::new(PruningSystem::new(
            store.clone(),
            vector,
            config.memory.max_per_persona,
        ));

        Arc::new(Self {
            config,
            store,
            memory,
            relationships,
            compatibility: CompatibilityEngine::new(),
            engine,
            sessions,
            decay,
            pruning,
            generator,
            started_at: Instant::now(),
        })
    }
}
