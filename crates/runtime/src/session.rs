//! Per-connection session state: current persona, conversation continuity,
//! and live streaming sessions. One mutex, O(1) operations, and no
//! cross-connection coordination anywhere.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub id: String,
    pub persona_id: String,
    pub turn_count: i64,
    pub last_activity: DateTime<Utc>,
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl ConversationSession {
    fn new(persona_id: &str) -> Self {
        Self {
            id: format!("conv_{}", &Uuid::new_v4().simple().to_string()[..12]),
            persona_id: persona_id.to_string(),
            turn_count: 0,
            last_activity: Utc::now(),
            context: serde_json::Map::new(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub id: String,
    pub request_id: String,
    pub persona_id: String,
    pub message: String,
    pub started_at: Instant,
    pub cancelled: bool,
}

impl StreamingSession {
    pub fn duration_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

#[derive(Default)]
struct SessionState {
    /// connection_id -> currently selected persona.
    current_personas: HashMap<String, String>,
    /// persona_id -> its conversation session.
    conversations: HashMap<String, ConversationSession>,
    /// stream_id -> streaming session.
    streams: HashMap<String, StreamingSession>,
    /// connection_id -> personas it has used, for cleanup bookkeeping.
    connection_personas: HashMap<String, HashSet<String>>,
}

pub struct SessionManager {
    state: Mutex<SessionState>,
    session_timeout_hours: i64,
}

impl SessionManager {
    pub fn new(session_timeout_hours: i64) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            session_timeout_hours: session_timeout_hours.max(1),
        }
    }

    /// Select the current persona for a connection, returning its
    /// conversation session id.
    pub fn set_current_persona(&self, connection_id: &str, persona_id: &str) -> String {
        let mut state = self.state.lock();
        state
            .current_personas
            .insert(connection_id.to_string(), persona_id.to_string());
        state
            .connection_personas
            .entry(connection_id.to_string())
            .or_default()
            .insert(persona_id.to_string());

        let session = state
            .conversations
            .entry(persona_id.to_string())
            .or_insert_with(|| ConversationSession::new(persona_id));
        session.touch();
        session.id.clone()
    }

    pub fn current_persona(&self, connection_id: &str) -> Option<String> {
        self.state.lock().current_personas.get(connection_id).cloned()
    }

    pub fn clear_current_persona(&self, connection_id: &str) {
        self.state.lock().current_personas.remove(connection_id);
    }

    pub fn current_conversation_id(&self, connection_id: &str) -> Option<String> {
        let state = self.state.lock();
        let persona_id = state.current_personas.get(connection_id)?;
        state.conversations.get(persona_id).map(|s| s.id.clone())
    }

    pub fn conversation_session(&self, persona_id: &str) -> Option<ConversationSession> {
        self.state.lock().conversations.get(persona_id).cloned()
    }

    pub fn increment_turn(&self, persona_id: &str) {
        if let Some(session) = self.state.lock().conversations.get_mut(persona_id) {
            session.turn_count += 1;
            session.touch();
        }
    }

    pub fn conversation_context(&self, persona_id: &str) -> serde_json::Map<String, serde_json::Value> {
        let state = self.state.lock();
        match state.conversations.get(persona_id) {
            Some(session) => {
                let mut context = session.context.clone();
                context.insert("id".into(), serde_json::json!(session.id));
                context.insert("turn_count".into(), serde_json::json!(session.turn_count));
                context.insert(
                    "last_activity".into(),
                    serde_json::json!(session.last_activity.to_rfc3339()),
                );
                context
            }
            None => serde_json::Map::new(),
        }
    }

    pub fn update_conversation_context(
        &self,
        persona_id: &str,
        updates: serde_json::Map<String, serde_json::Value>,
    ) {
        if let Some(session) = self.state.lock().conversations.get_mut(persona_id) {
            session.context.extend(updates);
            session.touch();
        }
    }

    // ── Streaming sessions ────────────────────────────────────────────────────

    pub fn create_streaming_session(
        &self,
        request_id: &str,
        persona_id: &str,
        message: &str,
    ) -> String {
        let stream_id = Uuid::new_v4().to_string();
        let session = StreamingSession {
            id: stream_id.clone(),
            request_id: request_id.to_string(),
            persona_id: persona_id.to_string(),
            message: message.to_string(),
            started_at: Instant::now(),
            cancelled: false,
        };

        self.state.lock().streams.insert(stream_id.clone(), session);
        debug!(stream = %stream_id, persona = persona_id, "streaming session created");
        stream_id
    }

    pub fn streaming_session(&self, stream_id: &str) -> Option<StreamingSession> {
        self.state.lock().streams.get(stream_id).cloned()
    }

    pub fn is_stream_cancelled(&self, stream_id: &str) -> bool {
        self.state
            .lock()
            .streams
            .get(stream_id)
            .map(|session| session.cancelled)
            // A missing session behaves like a cancelled one: stop producing.
            .unwrap_or(true)
    }

    pub fn cancel_streaming_session(&self, stream_id: &str) -> bool {
        match self.state.lock().streams.get_mut(stream_id) {
            Some(session) => {
                session.cancelled = true;
                info!(stream = %stream_id, "streaming session cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cleanup_streaming_session(&self, stream_id: &str) {
        self.state.lock().streams.remove(stream_id);
    }

    pub fn active_stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn active_streams(&self) -> serde_json::Map<String, serde_json::Value> {
        let state = self.state.lock();
        state
            .streams
            .iter()
            .map(|(stream_id, session)| {
                let mut message =
                    crate::streaming::safe_truncate(&session.message, 50).to_string();
                if message.len() < session.message.len() {
                    message.push_str("...");
                }
                (
                    stream_id.clone(),
                    serde_json::json!({
                        "persona_id": session.persona_id,
                        "message": message,
                        "duration": session.duration_seconds(),
                        "cancelled": session.cancelled,
                    }),
                )
            })
            .collect()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Drop all per-connection state. Conversation sessions survive (they are
    /// keyed by persona) until the sweep expires them.
    pub fn cleanup_connection(&self, connection_id: &str) {
        let mut state = self.state.lock();
        state.current_personas.remove(connection_id);
        state.connection_personas.remove(connection_id);
        info!(connection = connection_id, "connection session state cleaned up");
    }

    /// Purge conversation sessions idle past the timeout and streaming
    /// sessions older than an hour.
    pub fn sweep(&self) -> (usize, usize) {
        let mut state = self.state.lock();
        let cutoff = Utc::now() - Duration::hours(self.session_timeout_hours);

        let before_conversations = state.conversations.len();
        state.conversations.retain(|_, session| session.last_activity > cutoff);
        let swept_conversations = before_conversations - state.conversations.len();

        let before_streams = state.streams.len();
        state
            .streams
            .retain(|_, session| session.started_at.elapsed().as_secs() < 3600);
        let swept_streams = before_streams - state.streams.len();

        if swept_conversations > 0 || swept_streams > 0 {
            info!(
                conversations = swept_conversations,
                streams = swept_streams,
                "stale sessions swept"
            );
        }
        (swept_conversations, swept_streams)
    }

    pub fn status(&self) -> serde_json::Value {
        let state = self.state.lock();
        serde_json::json!({
            "active_connections": state.current_personas.len(),
            "active_conversations": state.conversations.len(),
            "active_streams": state.streams.len(),
        })
    }
}
