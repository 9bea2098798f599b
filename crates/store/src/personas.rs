use std::collections::HashMap;

use sqlx::Row;

use persona_core::{EmotionalState, InteractionState, Persona, Priority, Result};

use crate::{SqliteStore, parse_rfc3339, store_err, to_rfc3339};

impl SqliteStore {
    /// Upsert the persona record and its interaction state.
    pub async fn save_persona(&self, persona: &Persona) -> Result<()> {
        let traits = serde_json::to_string(&persona.personality_traits).map_err(store_err)?;
        let preferences = serde_json::to_string(&persona.topic_preferences).map_err(store_err)?;

        sqlx::query(
            "INSERT INTO personas
                (id, name, description, personality_traits, topic_preferences,
                 charisma, intelligence, social_rank, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                personality_traits = excluded.personality_traits,
                topic_preferences = excluded.topic_preferences,
                charisma = excluded.charisma,
                intelligence = excluded.intelligence,
                social_rank = excluded.social_rank",
        )
        .bind(&persona.id)
        .bind(&persona.name)
        .bind(&persona.description)
        .bind(traits)
        .bind(preferences)
        .bind(persona.charisma)
        .bind(persona.intelligence)
        .bind(&persona.social_rank)
        .bind(to_rfc3339(persona.created_at))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        let state = &persona.interaction_state;
        sqlx::query(
            "INSERT INTO persona_interaction_states
                (persona_id, interest_level, interaction_fatigue, current_priority,
                 available_time, social_energy, cooldown_until, last_updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(persona_id) DO UPDATE SET
                interest_level = excluded.interest_level,
                interaction_fatigue = excluded.interaction_fatigue,
                current_priority = excluded.current_priority,
                available_time = excluded.available_time,
                social_energy = excluded.social_energy,
                cooldown_until = excluded.cooldown_until,
                last_updated = excluded.last_updated",
        )
        .bind(&persona.id)
        .bind(state.interest_level)
        .bind(state.interaction_fatigue)
        .bind(state.current_priority.as_str())
        .bind(state.available_time)
        .bind(state.social_energy)
        .bind(state.cooldown_until)
        .bind(to_rfc3339(state.last_updated))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn load_persona(&self, persona_id: &str) -> Result<Option<Persona>> {
        let row = sqlx::query(
            "SELECT p.id, p.name, p.description, p.personality_traits, p.topic_preferences,
                    p.charisma, p.intelligence, p.social_rank, p.created_at,
                    s.interest_level, s.interaction_fatigue, s.current_priority,
                    s.available_time, s.social_energy, s.cooldown_until, s.last_updated
             FROM personas p
             LEFT JOIN persona_interaction_states s ON s.persona_id = p.id
             WHERE p.id = ?",
        )
        .bind(persona_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(row_to_persona))
    }

    /// Case-insensitive name lookup, used by `persona.switch` when the given
    /// identifier is not an id.
    pub async fn load_persona_by_name(&self, name: &str) -> Result<Option<Persona>> {
        let row = sqlx::query(
            "SELECT p.id, p.name, p.description, p.personality_traits, p.topic_preferences,
                    p.charisma, p.intelligence, p.social_rank, p.created_at,
                    s.interest_level, s.interaction_fatigue, s.current_priority,
                    s.available_time, s.social_energy, s.cooldown_until, s.last_updated
             FROM personas p
             LEFT JOIN persona_interaction_states s ON s.persona_id = p.id
             WHERE LOWER(p.name) = LOWER(?)",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(row_to_persona))
    }

    pub async fn list_personas(&self) -> Result<Vec<Persona>> {
        let rows = sqlx::query(
            "SELECT p.id, p.name, p.description, p.personality_traits, p.topic_preferences,
                    p.charisma, p.intelligence, p.social_rank, p.created_at,
                    s.interest_level, s.interaction_fatigue, s.current_priority,
                    s.available_time, s.social_energy, s.cooldown_until, s.last_updated
             FROM personas p
             LEFT JOIN persona_interaction_states s ON s.persona_id = p.id
             ORDER BY p.created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows.into_iter().map(row_to_persona).collect())
    }

    /// Hard delete of the persona and everything keyed on it.
    pub async fn delete_persona(&self, persona_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM personas WHERE id = ?")
            .bind(persona_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?
            .rows_affected();

        if deleted == 0 {
            return Ok(false);
        }

        for statement in [
            "DELETE FROM persona_interaction_states WHERE persona_id = ?",
            "DELETE FROM emotional_states WHERE persona_id = ?",
            "DELETE FROM memories WHERE persona_id = ?",
        ] {
            sqlx::query(statement)
                .bind(persona_id)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }

        sqlx::query("DELETE FROM relationships WHERE persona1_id = ? OR persona2_id = ?")
            .bind(persona_id)
            .bind(persona_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(true)
    }

    // ── Emotional states ──────────────────────────────────────────────────────

    /// Load the emotional state, creating and persisting the defaults when no
    /// record exists yet.
    pub async fn emotional_state(&self, persona_id: &str) -> Result<EmotionalState> {
        let row = sqlx::query(
            "SELECT persona_id, mood, energy_level, stress_level, curiosity,
                    social_battery, last_updated
             FROM emotional_states WHERE persona_id = ?",
        )
        .bind(persona_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        if let Some(row) = row {
            return Ok(EmotionalState {
                persona_id: row.get("persona_id"),
                mood: row.get("mood"),
                energy_level: row.get("energy_level"),
                stress_level: row.get("stress_level"),
                curiosity: row.get("curiosity"),
                social_battery: row.get("social_battery"),
                last_updated: parse_rfc3339(&row.get::<String, _>("last_updated")),
            });
        }

        let state = EmotionalState::default_for(persona_id);
        self.save_emotional_state(&state).await?;
        Ok(state)
    }

    pub async fn save_emotional_state(&self, state: &EmotionalState) -> Result<()> {
        sqlx::query(
            "INSERT INTO emotional_states
                (persona_id, mood, energy_level, stress_level, curiosity,
                 social_battery, last_updated, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(persona_id) DO UPDATE SET
                mood = excluded.mood,
                energy_level = excluded.energy_level,
                stress_level = excluded.stress_level,
                curiosity = excluded.curiosity,
                social_battery = excluded.social_battery,
                last_updated = excluded.last_updated",
        )
        .bind(&state.persona_id)
        .bind(state.mood)
        .bind(state.energy_level)
        .bind(state.stress_level)
        .bind(state.curiosity)
        .bind(state.social_battery)
        .bind(to_rfc3339(state.last_updated))
        .bind(to_rfc3339(chrono::Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn persona_exists(&self, persona_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM personas WHERE id = ?")
            .bind(persona_id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.get::<i64, _>("cnt") > 0)
    }
}

fn row_to_persona(row: sqlx::sqlite::SqliteRow) -> Persona {
    let id: String = row.get("id");

    let personality_traits: HashMap<String, serde_json::Value> =
        serde_json::from_str(&row.get::<String, _>("personality_traits")).unwrap_or_default();
    let topic_preferences: HashMap<String, i64> =
        serde_json::from_str(&row.get::<String, _>("topic_preferences")).unwrap_or_default();

    // Interaction state columns come from a LEFT JOIN; a persona written by a
    // partial migration gets a fresh default state.
    let interaction_state = match row.try_get::<i64, _>("interest_level") {
        Ok(interest_level) => InteractionState {
            persona_id: id.clone(),
            interest_level,
            interaction_fatigue: row.get("interaction_fatigue"),
            current_priority: row
                .get::<String, _>("current_priority")
                .parse::<Priority>()
                .unwrap_or_default(),
            available_time: row.get("available_time"),
            social_energy: row.get("social_energy"),
            cooldown_until: row.get("cooldown_until"),
            last_updated: parse_rfc3339(&row.get::<String, _>("last_updated")),
        },
        Err(_) => InteractionState::new(id.clone()),
    };

    Persona {
        id,
        name: row.get("name"),
        description: row.get("description"),
        personality_traits,
        topic_preferences,
        charisma: row.get("charisma"),
        intelligence: row.get("intelligence"),
        social_rank: row.get("social_rank"),
        created_at: parse_rfc3339(&row.get::<String, _>("created_at")),
        interaction_state,
    }
}
