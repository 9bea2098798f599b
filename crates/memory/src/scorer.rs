//! Deterministic memory importance scoring.
//!
//! Six additive components over a 0.3 base, each bounded to [0, 1] before
//! weighting; the result is clamped to [0.1, 1.0]. A post-hoc multiplier by
//! memory type re-clamps into the same range.

use regex::Regex;

use persona_core::{ConversationTurn, MemoryType, Persona, Relationship};

/// High/medium/low intensity emotion terms with their raw scores.
const EMOTION_KEYWORDS: &[(&str, f64)] = &[
    // High intensity
    ("love", 0.9),
    ("hate", 0.9),
    ("furious", 0.95),
    ("ecstatic", 0.9),
    ("devastated", 0.9),
    ("thrilled", 0.85),
    ("terrified", 0.9),
    ("overjoyed", 0.85),
    ("enraged", 0.9),
    ("heartbroken", 0.9),
    // Medium intensity
    ("happy", 0.6),
    ("sad", 0.6),
    ("angry", 0.7),
    ("excited", 0.7),
    ("worried", 0.6),
    ("surprised", 0.65),
    ("disappointed", 0.6),
    ("anxious", 0.7),
    ("proud", 0.7),
    ("embarrassed", 0.65),
    // Low intensity
    ("content", 0.4),
    ("curious", 0.4),
    ("tired", 0.3),
    ("bored", 0.2),
    ("interested", 0.5),
    ("confused", 0.4),
    ("amused", 0.4),
];

const SIGNIFICANCE_PATTERNS: &[(&str, f64)] = &[
    (r"\b(emergency|urgent|crisis|death|born|married|divorced)\b", 0.9),
    (r"\b(secret|confession|betrayal|revelation|discovered)\b", 0.85),
    (r"\b(first time|never again|last chance|forever)\b", 0.8),
    (r"\b(important|significant|critical|serious|major)\b", 0.7),
    (r"\b(promise|swear|vow|commitment|decision)\b", 0.7),
    (r"\b(fight|argument|conflict|disagreement)\b", 0.65),
    (r"\b(interesting|unusual|strange|weird|funny)\b", 0.5),
    (r"\b(plan|idea|suggestion|proposal)\b", 0.5),
    (r"\b(remember|forget|recall|remind)\b", 0.45),
    (r"\b(magic|spell|enchant|wizard|dragon|artifact)\b", 0.6),
    (r"\b(business|trade|profit|loss|money)\b", 0.55),
    (r"\b(family|friend|enemy|ally|relationship)\b", 0.6),
];

/// Scoring context passed in from the conversation engine or assembled from
/// stored metadata.
#[derive(Debug, Clone, Default)]
pub struct ScoringContext {
    pub continue_score: Option<i64>,
    pub topic: Option<String>,
    pub turn_number: Option<i64>,
}

impl ScoringContext {
    pub fn from_metadata(metadata: &serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            continue_score: metadata.get("continue_score").and_then(|v| v.as_i64()),
            topic: metadata
                .get("topic")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            turn_number: metadata.get("turn_number").and_then(|v| v.as_i64()),
        }
    }
}

pub struct ImportanceScorer {
    significance: Vec<(Regex, f64)>,
    info_seeking: Regex,
    opinion: Regex,
}

impl ImportanceScorer {
    pub fn new() -> Self {
        let significance = SIGNIFICANCE_PATTERNS
            .iter()
            .filter_map(|(pattern, score)| Regex::new(pattern).ok().map(|re| (re, *score)))
            .collect();

        Self {
            significance,
            info_seeking: Regex::new(r"\b(tell me|explain|describe|how|why|what|when|where)\b")
                .expect("static pattern compiles"),
            opinion: Regex::new(r"\b(agree|disagree|think|feel|believe|opinion)\b")
                .expect("static pattern compiles"),
        }
    }

    /// Composite importance in [0.1, 1.0].
    pub fn calculate(
        &self,
        content: &str,
        speaker: Option<&Persona>,
        relationship: Option<&Relationship>,
        context: Option<&ScoringContext>,
        turn: Option<&ConversationTurn>,
    ) -> f64 {
        let mut importance = 0.3;

        importance += self.emotional_score(content) * 0.25;
        importance += self.context_score(content, context) * 0.2;
        if let Some(speaker) = speaker {
            importance += self.interest_alignment(content, speaker) * 0.15;
        }
        importance += self.engagement_signals(content, turn) * 0.1;
        importance += relationship_factor(relationship) * 0.1;
        importance += 0.05; // Recency bonus: every freshly formed memory gets it in full.

        importance.clamp(0.1, 1.0)
    }

    /// Type multiplier applied after the base score, re-clamped.
    pub fn apply_type_multiplier(&self, memory_type: MemoryType, base_importance: f64) -> f64 {
        let multiplier = match memory_type {
            MemoryType::Conversation => 1.0,
            MemoryType::Observation => 0.8,
            MemoryType::Reflection => 1.2,
            MemoryType::Relationship => 1.3,
            MemoryType::Goal => 1.4,
            MemoryType::Secret => 1.5,
            MemoryType::Trauma => 1.6,
            MemoryType::Achievement => 1.3,
            MemoryType::Learning => 1.1,
            MemoryType::Routine => 0.6,
        };

        (base_importance * multiplier).clamp(0.1, 1.0)
    }

    fn emotional_score(&self, content: &str) -> f64 {
        let lower = content.to_lowercase();
        let mut score: f64 = 0.0;

        for (keyword, keyword_score) in EMOTION_KEYWORDS {
            if lower.contains(keyword) {
                score = score.max(*keyword_score);
            }
        }

        let exclamations = content.matches('!').count();
        if exclamations >= 3 {
            score = score.max(0.8);
        } else if exclamations >= 2 {
            score = score.max(0.6);
        } else if exclamations >= 1 {
            score = score.max(0.4);
        }

        let caps_ratio =
            content.chars().filter(|c| c.is_uppercase()).count() as f64 / content.len().max(1) as f64;
        if caps_ratio > 0.3 {
            score = score.max(0.7);
        } else if caps_ratio > 0.1 {
            score = score.max(0.4);
        }

        score
    }

    fn context_score(&self, content: &str, context: Option<&ScoringContext>) -> f64 {
        let lower = content.to_lowercase();
        let mut score: f64 = 0.0;

        for (pattern, pattern_score) in &self.significance {
            if pattern.is_match(&lower) {
                score = score.max(*pattern_score);
            }
        }

        if let Some(ctx) = context {
            match ctx.continue_score {
                Some(cs) if cs >= 80 => score = score.max(0.7),
                Some(cs) if cs >= 60 => score = score.max(0.5),
                _ => {}
            }

            if let Some(topic) = ctx.topic.as_deref() {
                let topic = topic.to_lowercase();
                if ["crisis", "emergency", "important", "secret"].contains(&topic.as_str()) {
                    score = score.max(0.8);
                } else if ["personal", "relationship", "family"].contains(&topic.as_str()) {
                    score = score.max(0.6);
                }
            }
        }

        score
    }

    fn interest_alignment(&self, content: &str, speaker: &Persona) -> f64 {
        let lower = content.to_lowercase();
        let mut alignment: f64 = 0.0;

        for (topic, preference) in &speaker.topic_preferences {
            if lower.contains(&topic.to_lowercase()) {
                alignment = alignment.max((*preference as f64 / 100.0).min(1.0));
            }
        }

        if alignment == 0.0 {
            alignment = if speaker.personality_traits.is_empty() {
                0.5
            } else if speaker.personality_traits.contains_key("curious") {
                0.6
            } else if speaker.personality_traits.contains_key("social") {
                0.5
            } else {
                0.4
            };
        }

        alignment
    }

    fn engagement_signals(&self, content: &str, turn: Option<&ConversationTurn>) -> f64 {
        let lower = content.to_lowercase();
        let mut score = 0.0;

        score += content.matches('?').count() as f64 * 0.1;
        score += content.matches('!').count() as f64 * 0.05;
        score += self.info_seeking.find_iter(&lower).count() as f64 * 0.15;
        score += self.opinion.find_iter(&lower).count() as f64 * 0.1;

        let word_count = content.split_whitespace().count();
        if word_count >= 50 {
            score += 0.3;
        } else if word_count >= 20 {
            score += 0.2;
        } else if word_count >= 10 {
            score += 0.1;
        }

        if let Some(turn) = turn {
            if turn.continue_score >= 70 {
                score += 0.2;
            } else if turn.continue_score >= 50 {
                score += 0.1;
            }
        }

        score.min(1.0)
    }
}

impl Default for ImportanceScorer {
    fn default() -> Self {
        Self::new()
    }
}

fn relationship_factor(relationship: Option<&Relationship>) -> f64 {
    let Some(relationship) = relationship else {
        return 0.3;
    };

    let affinity = relationship.affinity.clamp(0.0, 1.0);
    let trust = relationship.trust.clamp(0.0, 1.0);
    let strength = (affinity + trust) / 2.0;

    // Both extremes matter: strong bonds and strong antipathy are memorable.
    if strength >= 0.8 || strength <= 0.2 {
        0.9
    } else if strength >= 0.6 || strength <= 0.4 {
        0.7
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::Persona;

    fn scorer() -> ImportanceScorer {
        ImportanceScorer::new()
    }

    #[test]
    fn output_is_deterministic_and_bounded() {
        let scorer = scorer();
        let first = scorer.calculate("We discovered a secret passage!", None, None, None, None);
        let second = scorer.calculate("We discovered a secret passage!", None, None, None, None);
        assert_eq!(first, second);
        assert!((0.1..=1.0).contains(&first));
    }

    #[test]
    fn emotional_content_raises_importance() {
        let scorer = scorer();
        let plain = scorer.calculate("the weather is fine today", None, None, None, None);
        let emotional = scorer.calculate("I am absolutely devastated!!!", None, None, None, None);
        assert!(emotional > plain);
    }

    #[test]
    fn caps_ratio_counts_as_intensity() {
        let scorer = scorer();
        let shouted = scorer.calculate("HELP ME RIGHT NOW", None, None, None, None);
        let quiet = scorer.calculate("help me right now", None, None, None, None);
        assert!(shouted > quiet);
    }

    #[test]
    fn significance_patterns_match() {
        let scorer = scorer();
        let secret = scorer.calculate("I must tell you a secret", None, None, None, None);
        let mundane = scorer.calculate("I ate lunch", None, None, None, None);
        assert!(secret > mundane);
    }

    #[test]
    fn topic_preference_alignment_applies() {
        let scorer = scorer();
        let mut persona = Persona::new("Mage", "Loves magic");
        persona.topic_preferences.insert("magic".to_string(), 95);

        let aligned = scorer.calculate("that magic trick was neat", Some(&persona), None, None, None);
        let unaligned = scorer.calculate("that card trick was neat", Some(&persona), None, None, None);
        assert!(aligned > unaligned);
    }

    #[test]
    fn high_continue_score_context_boosts() {
        let scorer = scorer();
        let ctx = ScoringContext {
            continue_score: Some(85),
            topic: None,
            turn_number: None,
        };
        let boosted = scorer.calculate("nothing remarkable", None, None, Some(&ctx), None);
        let flat = scorer.calculate("nothing remarkable", None, None, None, None);
        assert!(boosted > flat);
    }

    #[test]
    fn relationship_extremes_score_high() {
        let mut rel = Relationship::new_stranger("a", "b");
        rel.affinity = 0.9;
        rel.trust = 0.9;
        assert_eq!(relationship_factor(Some(&rel)), 0.9);

        rel.affinity = 0.5;
        rel.trust = 0.5;
        assert_eq!(relationship_factor(Some(&rel)), 0.5);

        assert_eq!(relationship_factor(None), 0.3);
    }

    #[test]
    fn type_multiplier_table() {
        let scorer = scorer();
        assert_eq!(scorer.apply_type_multiplier(MemoryType::Conversation, 0.5), 0.5);
        assert!((scorer.apply_type_multiplier(MemoryType::Trauma, 0.5) - 0.8).abs() < 1e-9);
        assert!((scorer.apply_type_multiplier(MemoryType::Routine, 0.5) - 0.3).abs() < 1e-9);
        // Re-clamped at the top end.
        assert_eq!(scorer.apply_type_multiplier(MemoryType::Secret, 0.9), 1.0);
        // And at the bottom.
        assert_eq!(scorer.apply_type_multiplier(MemoryType::Routine, 0.12), 0.1);
    }

    #[test]
    fn length_steps_increase_engagement() {
        let scorer = scorer();
        let short = scorer.calculate("ok", None, None, None, None);
        let medium = scorer.calculate(
            "this reply has somewhat more than ten words in it overall",
            None,
            None,
            None,
            None,
        );
        assert!(medium > short);
    }
}
