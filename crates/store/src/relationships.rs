use chrono::{DateTime, Utc};
use sqlx::Row;

use persona_core::{
    MemorableMoment, Relationship, RelationshipType, Result, canonical_pair,
};

use crate::{SqliteStore, parse_rfc3339, parse_rfc3339_opt, store_err, to_rfc3339};

/// One row of the interaction log.
#[derive(Debug, Clone)]
pub struct InteractionRecord {
    pub persona1_id: String,
    pub persona2_id: String,
    pub interaction_quality: f64,
    pub duration_minutes: f64,
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

impl SqliteStore {
    /// Upsert keyed on the canonical pair, so `save(a,b)` and `save(b,a)`
    /// write the same row.
    pub async fn save_relationship(&self, relationship: &Relationship) -> Result<()> {
        let (first, second) =
            canonical_pair(&relationship.persona1_id, &relationship.persona2_id);
        let moments = serde_json::to_string(&relationship.memorable_moments).map_err(store_err)?;
        let conflicts = serde_json::to_string(&relationship.conflict_history).map_err(store_err)?;

        sqlx::query(
            "INSERT INTO relationships
                (persona1_id, persona2_id, affinity, trust, respect, intimacy,
                 relationship_type, interaction_count, total_interaction_time,
                 first_meeting, last_interaction, memorable_moments, conflict_history,
                 recent_interaction_quality, created_at, updated_at, id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(persona1_id, persona2_id) DO UPDATE SET
                affinity = excluded.affinity,
                trust = excluded.trust,
                respect = excluded.respect,
                intimacy = excluded.intimacy,
                relationship_type = excluded.relationship_type,
                interaction_count = excluded.interaction_count,
                total_interaction_time = excluded.total_interaction_time,
                last_interaction = excluded.last_interaction,
                memorable_moments = excluded.memorable_moments,
                conflict_history = excluded.conflict_history,
                recent_interaction_quality = excluded.recent_interaction_quality,
                updated_at = excluded.updated_at",
        )
        .bind(first)
        .bind(second)
        .bind(relationship.affinity)
        .bind(relationship.trust)
        .bind(relationship.respect)
        .bind(relationship.intimacy)
        .bind(relationship.relationship_type.as_str())
        .bind(relationship.interaction_count)
        .bind(relationship.total_interaction_time)
        .bind(to_rfc3339(relationship.first_meeting))
        .bind(relationship.last_interaction.map(to_rfc3339))
        .bind(moments)
        .bind(conflicts)
        .bind(relationship.recent_interaction_quality)
        .bind(to_rfc3339(Utc::now()))
        .bind(to_rfc3339(Utc::now()))
        .bind(&relationship.id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn load_relationship(
        &self,
        persona1_id: &str,
        persona2_id: &str,
    ) -> Result<Option<Relationship>> {
        let (first, second) = canonical_pair(persona1_id, persona2_id);

        let row = sqlx::query(
            "SELECT * FROM relationships WHERE persona1_id = ? AND persona2_id = ?",
        )
        .bind(first)
        .bind(second)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(row_to_relationship))
    }

    pub async fn list_relationships_for(&self, persona_id: &str) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(
            "SELECT * FROM relationships WHERE persona1_id = ? OR persona2_id = ?",
        )
        .bind(persona_id)
        .bind(persona_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows.into_iter().map(row_to_relationship).collect())
    }

    pub async fn log_interaction(&self, record: &InteractionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO interaction_history
                (persona1_id, persona2_id, interaction_quality, duration_minutes,
                 context, emotional_impact, memory_references, timestamp)
             VALUES (?, ?, ?, ?, ?, '{}', '[]', ?)",
        )
        .bind(&record.persona1_id)
        .bind(&record.persona2_id)
        .bind(record.interaction_quality)
        .bind(record.duration_minutes)
        .bind(&record.context)
        .bind(to_rfc3339(record.timestamp))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    /// Aggregate view for `relationship.stats`.
    pub async fn relationship_stats(&self) -> Result<serde_json::Value> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM relationships")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?
            .get("cnt");

        let type_rows = sqlx::query(
            "SELECT relationship_type, COUNT(*) AS cnt
             FROM relationships GROUP BY relationship_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        let mut by_type = serde_json::Map::new();
        for row in type_rows {
            by_type.insert(
                row.get::<String, _>("relationship_type"),
                serde_json::json!(row.get::<i64, _>("cnt")),
            );
        }

        let avg_compat: Option<f64> = sqlx::query(
            "SELECT AVG((affinity + trust + respect + intimacy) / 4.0) AS avg_compat
             FROM relationships",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?
        .get("avg_compat");

        let interactions: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM interaction_history")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?
            .get("cnt");

        let active_rows = sqlx::query(
            "SELECT persona1_id, COUNT(*) AS cnt
             FROM interaction_history
             GROUP BY persona1_id ORDER BY cnt DESC LIMIT 5",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        let most_active: Vec<serde_json::Value> = active_rows
            .into_iter()
            .map(|row| {
                serde_json::json!({
                    "persona_id": row.get::<String, _>("persona1_id"),
                    "interactions": row.get::<i64, _>("cnt"),
                })
            })
            .collect();

        Ok(serde_json::json!({
            "total_relationships": total,
            "relationship_types": by_type,
            "average_compatibility": avg_compat.unwrap_or(0.0),
            "total_interactions": interactions,
            "most_active_personas": most_active,
        }))
    }
}

fn row_to_relationship(row: sqlx::sqlite::SqliteRow) -> Relationship {
    let memorable_moments: Vec<MemorableMoment> =
        serde_json::from_str(&row.get::<String, _>("memorable_moments")).unwrap_or_default();
    let conflict_history: Vec<MemorableMoment> =
        serde_json::from_str(&row.get::<String, _>("conflict_history")).unwrap_or_default();

    Relationship {
        id: row.get("id"),
        persona1_id: row.get("persona1_id"),
        persona2_id: row.get("persona2_id"),
        affinity: row.get("affinity"),
        trust: row.get("trust"),
        respect: row.get("respect"),
        intimacy: row.get("intimacy"),
        relationship_type: row
            .get::<String, _>("relationship_type")
            .parse::<RelationshipType>()
            .unwrap_or_default(),
        interaction_count: row.get("interaction_count"),
        total_interaction_time: row.get("total_interaction_time"),
        first_meeting: parse_rfc3339(&row.get::<String, _>("first_meeting")),
        last_interaction: parse_rfc3339_opt(row.get::<Option<String>, _>("last_interaction")),
        memorable_moments,
        conflict_history,
        recent_interaction_quality: row.get("recent_interaction_quality"),
    }
}
