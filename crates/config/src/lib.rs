use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Port reserved for the HTTP admin facade. The core never binds it but
    /// validation rejects a clash with the MCP port.
    pub admin_port: u16,
    pub log_level: String,
    pub debug_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            admin_port: 8081,
            log_level: "info".to_string(),
            debug_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the Ollama API. Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    pub default_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub stream: bool,
    /// Upper bound on in-flight backend requests; callers queue beyond it.
    pub max_concurrent_requests: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            default_model: "llama3.1:8b".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            timeout_seconds: 30,
            stream: true,
            max_concurrent_requests: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_per_persona: usize,
    pub importance_threshold: f64,
    pub decay_enabled: bool,
    pub decay_interval_seconds: u64,
    /// Exponential decay constant k in `importance * exp(-k * elapsed_hours)`.
    pub decay_rate: f64,
    pub pruning_enabled: bool,
    pub pruning_interval_seconds: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_per_persona: 1000,
            importance_threshold: 0.3,
            decay_enabled: true,
            decay_interval_seconds: 3600,
            decay_rate: 0.01,
            pruning_enabled: true,
            pruning_interval_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_context_messages: usize,
    pub context_summary_threshold: usize,
    pub session_timeout_hours: i64,
    pub tick_interval_seconds: u64,
    /// Streaming sessions in flight across all connections; new `_stream`
    /// requests are refused beyond this.
    pub max_streaming_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_context_messages: 20,
            context_summary_threshold: 30,
            session_timeout_hours: 1,
            tick_interval_seconds: 300,
            max_streaming_sessions: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub min_time_threshold: i64,
    pub low_token_budget: i64,
    pub low_social_energy: i64,
    pub base_cooldown_seconds: f64,
    pub high_continue_score: i64,
    pub low_continue_score: i64,
    pub satisfying_conversation_multiplier: f64,
    pub unsatisfying_conversation_multiplier: f64,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            min_time_threshold: 60,
            low_token_budget: 100,
            low_social_energy: 20,
            base_cooldown_seconds: 300.0,
            high_continue_score: 70,
            low_continue_score: 40,
            satisfying_conversation_multiplier: 0.6,
            unsatisfying_conversation_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_time_score: f64,
    pub max_topic_score: f64,
    pub max_social_score: f64,
    pub max_fatigue_penalty: i64,
    pub max_resource_score: f64,
    pub urgent_decay_rate: f64,
    pub important_decay_rate: f64,
    pub casual_decay_rate: f64,
    /// Social rank label -> level. Unknown ranks fall back to "commoner".
    pub status_hierarchy: HashMap<String, i64>,
    pub same_status_compatibility: f64,
    pub adjacent_status_compatibility: f64,
    pub distant_status_compatibility: f64,
    pub default_status_compatibility: f64,
    pub large_status_gap_threshold: i64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        let status_hierarchy = [
            ("noble", 4),
            ("merchant", 3),
            ("artisan", 2),
            ("commoner", 1),
            ("peasant", 0),
        ]
        .into_iter()
        .map(|(label, level)| (label.to_string(), level))
        .collect();

        Self {
            max_time_score: 30.0,
            max_topic_score: 25.0,
            max_social_score: 20.0,
            max_fatigue_penalty: 15,
            max_resource_score: 10.0,
            urgent_decay_rate: 60.0,
            important_decay_rate: 180.0,
            casual_decay_rate: 600.0,
            status_hierarchy,
            same_status_compatibility: 10.0,
            adjacent_status_compatibility: 8.0,
            distant_status_compatibility: 3.0,
            default_status_compatibility: 5.0,
            large_status_gap_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub sqlite_path: String,
    pub vector_path: String,
    pub pool_size: u32,
    pub enable_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/personas.db".to_string(),
            vector_path: "data/vector_memory.db".to_string(),
            pool_size: 10,
            enable_wal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub session: SessionConfig,
    pub persona: PersonaConfig,
    pub conversation: ConversationConfig,
    pub database: DatabaseConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Hard validation failures. Soft issues are logged as warnings and do not
    /// prevent startup.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be a positive integer".to_string());
        }
        if self.server.port == self.server.admin_port {
            errors.push("server.admin_port cannot be the same as server.port".to_string());
        }
        if self.database.sqlite_path.trim().is_empty() {
            errors.push("database.sqlite_path is not configured".to_string());
        }
        if self.llm.base_url.trim().is_empty() {
            tracing::warn!("llm.base_url is not configured; backend calls will use fallbacks");
        }

        errors
    }
}
