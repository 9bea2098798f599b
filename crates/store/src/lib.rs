//! Durable relational state: personas, relationships, emotional states,
//! conversations, turns, interaction history, and the memory index.

mod conversations;
mod memory_index;
mod personas;
mod relationships;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use persona_config::DatabaseConfig;
use persona_core::{Error, Result};

pub use memory_index::MemoryIndexRow;
pub use relationships::InteractionRecord;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the structured store described by the
    /// database config and run the idempotent migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.sqlite_path)
            .create_if_missing(true)
            .journal_mode(if config.enable_wal {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            });

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .connect_with(options)
            .await
            .map_err(store_err)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory store for tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(store_err)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS personas (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                personality_traits TEXT NOT NULL DEFAULT '{}',
                topic_preferences TEXT NOT NULL DEFAULT '{}',
                charisma INTEGER NOT NULL DEFAULT 10,
                intelligence INTEGER NOT NULL DEFAULT 10,
                social_rank TEXT NOT NULL DEFAULT 'commoner',
                created_at TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS persona_interaction_states (
                persona_id TEXT PRIMARY KEY REFERENCES personas(id),
                interest_level INTEGER NOT NULL DEFAULT 50,
                interaction_fatigue INTEGER NOT NULL DEFAULT 0,
                current_priority TEXT NOT NULL DEFAULT 'none',
                available_time INTEGER NOT NULL DEFAULT 300,
                social_energy INTEGER NOT NULL DEFAULT 100,
                cooldown_until REAL NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS relationships (
                persona1_id TEXT NOT NULL,
                persona2_id TEXT NOT NULL,
                affinity REAL NOT NULL DEFAULT 0,
                trust REAL NOT NULL DEFAULT 0,
                respect REAL NOT NULL DEFAULT 0,
                intimacy REAL NOT NULL DEFAULT 0,
                relationship_type TEXT NOT NULL DEFAULT 'stranger',
                interaction_count INTEGER NOT NULL DEFAULT 0,
                total_interaction_time REAL NOT NULL DEFAULT 0,
                first_meeting TEXT NOT NULL,
                last_interaction TEXT,
                memorable_moments TEXT NOT NULL DEFAULT '[]',
                conflict_history TEXT NOT NULL DEFAULT '[]',
                recent_interaction_quality REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                id TEXT NOT NULL,
                PRIMARY KEY (persona1_id, persona2_id)
            );",
            "CREATE TABLE IF NOT EXISTS emotional_states (
                persona_id TEXT PRIMARY KEY REFERENCES personas(id),
                mood REAL NOT NULL DEFAULT 0.5,
                energy_level REAL NOT NULL DEFAULT 0.7,
                stress_level REAL NOT NULL DEFAULT 0.3,
                curiosity REAL NOT NULL DEFAULT 0.6,
                social_battery REAL NOT NULL DEFAULT 0.8,
                last_updated TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS interaction_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                persona1_id TEXT NOT NULL,
                persona2_id TEXT NOT NULL,
                interaction_quality REAL NOT NULL,
                duration_minutes REAL NOT NULL,
                context TEXT NOT NULL,
                emotional_impact TEXT NOT NULL DEFAULT '{}',
                memory_references TEXT NOT NULL DEFAULT '[]',
                timestamp TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participants TEXT NOT NULL,
                current_speaker TEXT,
                topic TEXT NOT NULL DEFAULT 'general',
                topic_drift_count INTEGER NOT NULL DEFAULT 0,
                duration INTEGER NOT NULL DEFAULT 0,
                token_budget INTEGER NOT NULL DEFAULT 1000,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                continue_score INTEGER NOT NULL DEFAULT 50,
                score_history TEXT NOT NULL DEFAULT '[]',
                turn_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                exit_reason TEXT
            );",
            "CREATE TABLE IF NOT EXISTS conversation_turns (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                speaker_id TEXT NOT NULL,
                turn_number INTEGER NOT NULL,
                content TEXT NOT NULL,
                response_type TEXT NOT NULL DEFAULT 'full_llm',
                continue_score INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                processing_time REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                persona_id TEXT NOT NULL,
                memory_type TEXT NOT NULL DEFAULT 'conversation',
                importance REAL NOT NULL DEFAULT 0.5,
                emotional_valence REAL NOT NULL DEFAULT 0,
                related_personas TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                accessed_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT
            );",
            "CREATE INDEX IF NOT EXISTS idx_relationships_pair
                ON relationships (persona1_id, persona2_id);",
            "CREATE INDEX IF NOT EXISTS idx_emotional_states_persona
                ON emotional_states (persona_id);",
            "CREATE INDEX IF NOT EXISTS idx_interaction_history_pair
                ON interaction_history (persona1_id, persona2_id, timestamp);",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }

        Ok(())
    }
}

pub(crate) fn store_err(err: impl std::fmt::Display) -> Error {
    Error::Store(err.to_string())
}

pub(crate) fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_rfc3339_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_rfc3339)
}
