//! The per-turn engagement score: six weighted components summed and clamped
//! to [0, 100]. Pure with respect to its inputs; all weights and limits come
//! from the conversation/persona config sections.

use persona_config::{ConversationConfig, PersonaConfig};
use persona_core::{Conversation, Persona, Priority, Relationship};

#[derive(Debug, Clone)]
pub struct ContinueScoreEngine {
    conversation: ConversationConfig,
    persona: PersonaConfig,
}

impl ContinueScoreEngine {
    pub fn new(conversation: ConversationConfig, persona: PersonaConfig) -> Self {
        Self {
            conversation,
            persona,
        }
    }

    /// The 0-100 continue score for `speaker` talking to `other` in the
    /// given conversation.
    pub fn score(
        &self,
        speaker: &Persona,
        other: &Persona,
        context: &Conversation,
        relationship: Option<&Relationship>,
    ) -> i64 {
        let time_score = self.time_pressure(speaker, context);
        let topic_score = self.topic_alignment(speaker, other, context);
        let social_score = self.social_compatibility(speaker, other);
        let fatigue_penalty = self.fatigue_penalty(speaker);
        let history_modifier = relationship_modifier(relationship);
        let resource_score = self.resource_score(speaker, context);

        let total = time_score + topic_score + social_score - fatigue_penalty
            + history_modifier
            + resource_score;

        (total as i64).clamp(0, 100)
    }

    /// Starts at the max and decays with conversation duration; the decay
    /// rate depends on the speaker's current priority.
    fn time_pressure(&self, speaker: &Persona, context: &Conversation) -> f64 {
        let decay_rate = match speaker.interaction_state.current_priority {
            Priority::Urgent => self.conversation.urgent_decay_rate,
            Priority::Casual | Priority::Social => self.conversation.casual_decay_rate,
            _ => self.conversation.important_decay_rate,
        };

        (self.conversation.max_time_score - context.duration as f64 / decay_rate).max(0.0)
    }

    /// Mutual interest beats one-sided enthusiasm; drifting topics cost 40%.
    fn topic_alignment(&self, speaker: &Persona, other: &Persona, context: &Conversation) -> f64 {
        let p1 = *speaker.topic_preferences.get(&context.topic).unwrap_or(&50) as f64;
        let p2 = *other.topic_preferences.get(&context.topic).unwrap_or(&50) as f64;

        let avg = (p1 + p2) / 2.0;
        let min = p1.min(p2);
        let mut pull = avg * 0.7 + min * 0.3;

        if context.topic_drift_count > 2 {
            pull *= 0.6;
        }

        (pull * self.conversation.max_topic_score / 100.0).min(self.conversation.max_topic_score)
    }

    fn social_compatibility(&self, speaker: &Persona, other: &Persona) -> f64 {
        let charisma = speaker.charisma.min(other.charisma) as f64 * 0.8;
        let status = self.status_compatibility(speaker, other);

        ((charisma + status) / 2.0).min(self.conversation.max_social_score)
    }

    fn status_compatibility(&self, speaker: &Persona, other: &Persona) -> f64 {
        let hierarchy = &self.conversation.status_hierarchy;
        let default_level = *hierarchy.get("commoner").unwrap_or(&2);
        let level1 = *hierarchy.get(&speaker.social_rank).unwrap_or(&default_level);
        let level2 = *hierarchy.get(&other.social_rank).unwrap_or(&default_level);

        let diff = (level1 - level2).abs();
        if diff == 0 {
            self.conversation.same_status_compatibility
        } else if diff == 1 {
            self.conversation.adjacent_status_compatibility
        } else if diff >= self.conversation.large_status_gap_threshold {
            self.conversation.distant_status_compatibility
        } else {
            self.conversation.default_status_compatibility
        }
    }

    fn fatigue_penalty(&self, speaker: &Persona) -> f64 {
        (speaker.interaction_state.interaction_fatigue / 2)
            .min(self.conversation.max_fatigue_penalty) as f64
    }

    /// Product of thresholded time / token / energy factors.
    fn resource_score(&self, speaker: &Persona, context: &Conversation) -> f64 {
        let mut score = self.conversation.max_resource_score;
        let state = &speaker.interaction_state;

        if state.available_time < self.persona.min_time_threshold {
            score *= state.available_time as f64 / self.persona.min_time_threshold as f64;
        }
        if context.token_budget < self.persona.low_token_budget {
            score *= (context.token_budget.max(0)) as f64 / self.persona.low_token_budget as f64;
        }
        if state.social_energy < self.persona.low_social_energy {
            score *= state.social_energy as f64 / self.persona.low_social_energy as f64;
        }

        score
    }
}

/// Linear rescale of the relationship compatibility score; no history means a
/// neutral modifier.
fn relationship_modifier(relationship: Option<&Relationship>) -> f64 {
    match relationship {
        Some(relationship) => relationship.compatibility_score() * 12.5 - 2.5,
        None => 0.0,
    }
}
