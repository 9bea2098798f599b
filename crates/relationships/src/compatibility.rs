//! Trait/preference/rank-based compatibility analysis between two personas,
//! plus interaction-approach suggestions derived from it.

use std::collections::HashSet;

use persona_core::{Persona, Relationship};

/// Big-five-style trait weights. Neuroticism counts against compatibility.
const TRAIT_WEIGHTS: &[(&str, f64)] = &[
    ("openness", 0.2),
    ("conscientiousness", 0.15),
    ("extraversion", 0.25),
    ("agreeableness", 0.25),
    ("neuroticism", -0.15),
];

#[derive(Debug, Clone)]
pub struct CompatibilityAnalysis {
    pub overall: f64,
    pub personality: f64,
    pub social: f64,
    pub interests: f64,
    pub history: f64,
    pub prediction: &'static str,
}

impl CompatibilityAnalysis {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "overall": round3(self.overall),
            "personality": round3(self.personality),
            "social": round3(self.social),
            "interests": round3(self.interests),
            "history": round3(self.history),
            "prediction": self.prediction,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InteractionSuggestions {
    pub interaction_style: &'static str,
    pub recommended_topics: Vec<String>,
    pub potential_challenges: Vec<&'static str>,
    pub relationship_potential: &'static str,
    pub interaction_frequency: &'static str,
}

impl InteractionSuggestions {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "interaction_style": self.interaction_style,
            "recommended_topics": self.recommended_topics,
            "potential_challenges": self.potential_challenges,
            "relationship_potential": self.relationship_potential,
            "interaction_frequency": self.interaction_frequency,
        })
    }
}

#[derive(Debug, Default)]
pub struct CompatibilityEngine;

impl CompatibilityEngine {
    pub fn new() -> Self {
        Self
    }

    /// Similarity-based trait compatibility; extraversion tolerates mild
    /// complementarity, neuroticism penalizes high absolute levels.
    pub fn personality_compatibility(&self, persona1: &Persona, persona2: &Persona) -> f64 {
        if persona1.personality_traits.is_empty() || persona2.personality_traits.is_empty() {
            return 0.5;
        }

        let mut total_score = 0.0;
        let mut total_weight = 0.0;

        for (trait_name, weight) in TRAIT_WEIGHTS {
            let (Some(v1), Some(v2)) = (
                trait_value(persona1, trait_name),
                trait_value(persona2, trait_name),
            ) else {
                continue;
            };

            let compatibility = match *trait_name {
                "neuroticism" => 1.0 - (v1 - v2).abs() - v1.max(v2) * 0.3,
                "extraversion" => {
                    let diff = (v1 - v2).abs();
                    if diff < 0.5 { 1.0 - diff * 0.7 } else { 1.0 - diff }
                }
                _ => 1.0 - (v1 - v2).abs(),
            }
            .clamp(0.0, 1.0);

            total_score += compatibility * weight.abs();
            total_weight += weight.abs();
        }

        if total_weight > 0.0 {
            (total_score / total_weight).clamp(0.0, 1.0)
        } else {
            0.5
        }
    }

    /// Charisma, intelligence-gap, and social-rank factors.
    pub fn social_compatibility(&self, persona1: &Persona, persona2: &Persona) -> f64 {
        let charisma_factor = ((persona1.charisma + persona2.charisma) as f64 / 40.0).min(1.0);

        let intel_diff = (persona1.intelligence - persona2.intelligence).abs();
        let intel_factor = if intel_diff <= 3 {
            1.0
        } else if intel_diff <= 6 {
            0.8
        } else {
            0.5
        };

        let rank_factor = rank_compatibility(&persona1.social_rank, &persona2.social_rank);

        (charisma_factor * 0.4 + intel_factor * 0.4 + rank_factor * 0.2).clamp(0.0, 1.0)
    }

    /// Weighted similarity of shared topic preferences with a bonus for
    /// breadth of overlap.
    pub fn interest_compatibility(&self, persona1: &Persona, persona2: &Persona) -> f64 {
        let interests1 = &persona1.topic_preferences;
        let interests2 = &persona2.topic_preferences;

        if interests1.is_empty() || interests2.is_empty() {
            return 0.5;
        }

        let common: HashSet<&String> = interests1
            .keys()
            .filter(|topic| interests2.contains_key(*topic))
            .collect();
        if common.is_empty() {
            return 0.3;
        }

        let mut total_similarity = 0.0;
        let mut total_weight = 0.0;
        for topic in &common {
            let interest1 = interests1[*topic] as f64;
            let interest2 = interests2[*topic] as f64;

            if interest1 > 20.0 && interest2 > 20.0 {
                let similarity = 1.0 - (interest1 - interest2).abs() / 100.0;
                let weight = (interest1 + interest2) / 200.0;
                total_similarity += similarity * weight;
                total_weight += weight;
            }
        }

        let mut compatibility = if total_weight > 0.0 {
            total_similarity / total_weight
        } else {
            0.3
        };

        let shared_ratio = common.len() as f64 / interests1.len().max(interests2.len()) as f64;
        compatibility += shared_ratio * 0.2;

        compatibility.clamp(0.0, 1.0)
    }

    pub fn overall_compatibility(
        &self,
        persona1: &Persona,
        persona2: &Persona,
        relationship: Option<&Relationship>,
    ) -> CompatibilityAnalysis {
        let personality = self.personality_compatibility(persona1, persona2);
        let social = self.social_compatibility(persona1, persona2);
        let interests = self.interest_compatibility(persona1, persona2);
        let history = relationship
            .map(|rel| ((rel.strength() + 1.0) / 2.0).clamp(0.0, 1.0))
            .unwrap_or(0.5);

        let overall = personality * 0.35 + social * 0.25 + interests * 0.25 + history * 0.15;

        CompatibilityAnalysis {
            overall,
            personality,
            social,
            interests,
            history,
            prediction: prediction_label(overall),
        }
    }

    pub fn suggest_interaction_approach(
        &self,
        persona1: &Persona,
        persona2: &Persona,
        analysis: &CompatibilityAnalysis,
    ) -> InteractionSuggestions {
        let (interaction_style, relationship_potential, interaction_frequency) =
            if analysis.overall > 0.8 {
                ("collaborative_enthusiastic", "excellent_friends", "frequent")
            } else if analysis.overall > 0.6 {
                ("friendly_engaging", "good_friends", "regular")
            } else if analysis.overall > 0.4 {
                ("respectful_cautious", "cordial_acquaintances", "occasional")
            } else {
                ("formal_distant", "professional_only", "minimal")
            };

        InteractionSuggestions {
            interaction_style,
            recommended_topics: shared_topics(persona1, persona2),
            potential_challenges: challenges(persona1, persona2, analysis),
            relationship_potential,
            interaction_frequency,
        }
    }
}

fn trait_value(persona: &Persona, trait_name: &str) -> Option<f64> {
    persona.personality_traits.get(trait_name).and_then(|v| v.as_f64())
}

fn rank_compatibility(rank1: &str, rank2: &str) -> f64 {
    let level = |rank: &str| -> i32 {
        match rank {
            "noble" => 4,
            "merchant" => 3,
            "artisan" => 2,
            "commoner" => 1,
            "peasant" => 0,
            _ => 1,
        }
    };

    match (level(rank1) - level(rank2)).abs() {
        0 => 1.0,
        1 => 0.8,
        2 => 0.6,
        _ => 0.3,
    }
}

/// Topics both personas care about (> 30 each), strongest first, top five.
fn shared_topics(persona1: &Persona, persona2: &Persona) -> Vec<String> {
    let mut topics: Vec<(String, i64)> = persona1
        .topic_preferences
        .iter()
        .filter_map(|(topic, &interest1)| {
            let &interest2 = persona2.topic_preferences.get(topic)?;
            if interest1 > 30 && interest2 > 30 {
                Some((topic.clone(), interest1 + interest2))
            } else {
                None
            }
        })
        .collect();

    topics.sort_by(|a, b| b.1.cmp(&a.1));
    topics.into_iter().take(5).map(|(topic, _)| topic).collect()
}

fn challenges(
    persona1: &Persona,
    persona2: &Persona,
    analysis: &CompatibilityAnalysis,
) -> Vec<&'static str> {
    let mut challenges = Vec::new();

    if analysis.personality < 0.4 {
        challenges.push("personality_clash");
    }
    if analysis.social < 0.4 {
        challenges.push("social_mismatch");
    }
    if analysis.interests < 0.3 {
        challenges.push("few_shared_interests");
    }

    let neuroticism1 = trait_value(persona1, "neuroticism").unwrap_or(0.5);
    let neuroticism2 = trait_value(persona2, "neuroticism").unwrap_or(0.5);
    if neuroticism1 > 0.7 || neuroticism2 > 0.7 {
        challenges.push("high_stress_potential");
    }

    let extraversion1 = trait_value(persona1, "extraversion").unwrap_or(0.5);
    let extraversion2 = trait_value(persona2, "extraversion").unwrap_or(0.5);
    if (extraversion1 - extraversion2).abs() > 0.6 {
        challenges.push("energy_level_mismatch");
    }

    challenges
}

fn prediction_label(overall: f64) -> &'static str {
    if overall > 0.8 {
        "excellent"
    } else if overall > 0.65 {
        "very_good"
    } else if overall > 0.5 {
        "good"
    } else if overall > 0.35 {
        "challenging"
    } else {
        "difficult"
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona_with_traits(name: &str, traits: &[(&str, f64)]) -> Persona {
        let mut persona = Persona::new(name, "test persona");
        for (trait_name, value) in traits {
            persona
                .personality_traits
                .insert(trait_name.to_string(), serde_json::json!(value));
        }
        persona
    }

    #[test]
    fn identical_traits_score_high() {
        let engine = CompatibilityEngine::new();
        let traits = [("openness", 0.8), ("agreeableness", 0.7), ("neuroticism", 0.2)];
        let a = persona_with_traits("A", &traits);
        let b = persona_with_traits("B", &traits);

        assert!(engine.personality_compatibility(&a, &b) > 0.7);
    }

    #[test]
    fn missing_traits_default_to_neutral() {
        let engine = CompatibilityEngine::new();
        let a = Persona::new("A", "no traits");
        let b = persona_with_traits("B", &[("openness", 0.9)]);
        assert_eq!(engine.personality_compatibility(&a, &b), 0.5);
    }

    #[test]
    fn high_neuroticism_hurts_compatibility() {
        let engine = CompatibilityEngine::new();
        let calm = persona_with_traits("A", &[("neuroticism", 0.1)]);
        let calm2 = persona_with_traits("B", &[("neuroticism", 0.1)]);
        let anxious = persona_with_traits("C", &[("neuroticism", 0.9)]);
        let anxious2 = persona_with_traits("D", &[("neuroticism", 0.9)]);

        assert!(
            engine.personality_compatibility(&calm, &calm2)
                > engine.personality_compatibility(&anxious, &anxious2)
        );
    }

    #[test]
    fn rank_gap_reduces_social_compatibility() {
        let engine = CompatibilityEngine::new();
        let noble = Persona::new("N", "x").with_attributes(12, 12, "noble");
        let noble2 = Persona::new("N2", "x").with_attributes(12, 12, "noble");
        let peasant = Persona::new("P", "x").with_attributes(12, 12, "peasant");

        assert!(
            engine.social_compatibility(&noble, &noble2)
                > engine.social_compatibility(&noble, &peasant)
        );
    }

    #[test]
    fn intelligence_gap_bands() {
        let engine = CompatibilityEngine::new();
        let smart = Persona::new("S", "x").with_attributes(10, 18, "commoner");
        let peer = Persona::new("P", "x").with_attributes(10, 17, "commoner");
        let distant = Persona::new("D", "x").with_attributes(10, 4, "commoner");

        assert!(
            engine.social_compatibility(&smart, &peer) > engine.social_compatibility(&smart, &distant)
        );
    }

    #[test]
    fn shared_interests_raise_compatibility() {
        let engine = CompatibilityEngine::new();
        let mut a = Persona::new("A", "x");
        let mut b = Persona::new("B", "x");
        a.topic_preferences.insert("music".into(), 80);
        b.topic_preferences.insert("music".into(), 75);

        let mut c = Persona::new("C", "x");
        c.topic_preferences.insert("accounting".into(), 80);

        assert!(
            engine.interest_compatibility(&a, &b) > engine.interest_compatibility(&a, &c)
        );
    }

    #[test]
    fn suggestions_track_overall_score() {
        let engine = CompatibilityEngine::new();
        let traits = [("openness", 0.8), ("extraversion", 0.7), ("agreeableness", 0.9)];
        let mut a = persona_with_traits("A", &traits);
        let mut b = persona_with_traits("B", &traits);
        a.topic_preferences.insert("magic".into(), 90);
        b.topic_preferences.insert("magic".into(), 85);

        let analysis = engine.overall_compatibility(&a, &b, None);
        let suggestions = engine.suggest_interaction_approach(&a, &b, &analysis);

        assert!(analysis.overall > 0.6);
        assert!(suggestions.recommended_topics.contains(&"magic".to_string()));
        assert_ne!(suggestions.interaction_style, "formal_distant");
    }

    #[test]
    fn challenges_flag_trait_conflicts() {
        let engine = CompatibilityEngine::new();
        let a = persona_with_traits("A", &[("extraversion", 0.9), ("neuroticism", 0.8)]);
        let b = persona_with_traits("B", &[("extraversion", 0.1), ("neuroticism", 0.2)]);

        let analysis = engine.overall_compatibility(&a, &b, None);
        let suggestions = engine.suggest_interaction_approach(&a, &b, &analysis);

        assert!(suggestions.potential_challenges.contains(&"high_stress_potential"));
        assert!(suggestions.potential_challenges.contains(&"energy_level_mismatch"));
    }

    #[test]
    fn prediction_labels_cover_range() {
        assert_eq!(prediction_label(0.9), "excellent");
        assert_eq!(prediction_label(0.7), "very_good");
        assert_eq!(prediction_label(0.55), "good");
        assert_eq!(prediction_label(0.4), "challenging");
        assert_eq!(prediction_label(0.2), "difficult");
    }
}
