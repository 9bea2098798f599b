use sqlx::Row;

use persona_core::{Conversation, ConversationTurn, ResponseType, Result};

use crate::{SqliteStore, parse_rfc3339, parse_rfc3339_opt, store_err, to_rfc3339};

impl SqliteStore {
    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let participants = serde_json::to_string(&conversation.participants).map_err(store_err)?;
        let score_history = serde_json::to_string(&conversation.score_history).map_err(store_err)?;

        sqlx::query(
            "INSERT INTO conversations
                (id, participants, current_speaker, topic, topic_drift_count, duration,
                 token_budget, tokens_used, continue_score, score_history, turn_count,
                 started_at, ended_at, exit_reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                current_speaker = excluded.current_speaker,
                topic = excluded.topic,
                topic_drift_count = excluded.topic_drift_count,
                duration = excluded.duration,
                token_budget = excluded.token_budget,
                tokens_used = excluded.tokens_used,
                continue_score = excluded.continue_score,
                score_history = excluded.score_history,
                turn_count = excluded.turn_count,
                ended_at = excluded.ended_at,
                exit_reason = excluded.exit_reason",
        )
        .bind(&conversation.id)
        .bind(participants)
        .bind(&conversation.current_speaker)
        .bind(&conversation.topic)
        .bind(conversation.topic_drift_count)
        .bind(conversation.duration)
        .bind(conversation.token_budget)
        .bind(conversation.tokens_used)
        .bind(conversation.continue_score)
        .bind(score_history)
        .bind(conversation.turn_count)
        .bind(to_rfc3339(conversation.started_at))
        .bind(conversation.ended_at.map(to_rfc3339))
        .bind(&conversation.exit_reason)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn load_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(row.map(|row| Conversation {
            id: row.get("id"),
            participants: serde_json::from_str(&row.get::<String, _>("participants"))
                .unwrap_or_default(),
            current_speaker: row.get("current_speaker"),
            topic: row.get("topic"),
            topic_drift_count: row.get("topic_drift_count"),
            duration: row.get("duration"),
            token_budget: row.get("token_budget"),
            tokens_used: row.get("tokens_used"),
            continue_score: row.get("continue_score"),
            score_history: serde_json::from_str(&row.get::<String, _>("score_history"))
                .unwrap_or_default(),
            turn_count: row.get("turn_count"),
            started_at: parse_rfc3339(&row.get::<String, _>("started_at")),
            ended_at: parse_rfc3339_opt(row.get::<Option<String>, _>("ended_at")),
            exit_reason: row.get("exit_reason"),
        }))
    }

    pub async fn save_turn(&self, turn: &ConversationTurn) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_turns
                (id, conversation_id, speaker_id, turn_number, content, response_type,
                 continue_score, tokens_used, processing_time, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&turn.id)
        .bind(&turn.conversation_id)
        .bind(&turn.speaker_id)
        .bind(turn.turn_number)
        .bind(&turn.content)
        .bind(turn.response_type.as_str())
        .bind(turn.continue_score)
        .bind(turn.tokens_used)
        .bind(turn.processing_time)
        .bind(to_rfc3339(turn.created_at))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn list_turns(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            "SELECT * FROM conversation_turns
             WHERE conversation_id = ? ORDER BY turn_number",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|row| ConversationTurn {
                id: row.get("id"),
                conversation_id: row.get("conversation_id"),
                speaker_id: row.get("speaker_id"),
                turn_number: row.get("turn_number"),
                content: row.get("content"),
                response_type: row
                    .get::<String, _>("response_type")
                    .parse::<ResponseType>()
                    .unwrap_or_default(),
                continue_score: row.get("continue_score"),
                tokens_used: row.get("tokens_used"),
                processing_time: row.get("processing_time"),
                created_at: parse_rfc3339(&row.get::<String, _>("created_at")),
            })
            .collect())
    }
}
