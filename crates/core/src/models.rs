use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock seconds since the Unix epoch, sub-second precision.
/// `cooldown_until` is stored in this form so it survives the REAL column in
/// the persona interaction-state table unchanged.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    Important,
    Casual,
    Social,
    Academic,
    Business,
    #[default]
    None,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::Important => "important",
            Priority::Casual => "casual",
            Priority::Social => "social",
            Priority::Academic => "academic",
            Priority::Business => "business",
            Priority::None => "none",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Priority::Urgent),
            "important" => Ok(Priority::Important),
            "casual" => Ok(Priority::Casual),
            "social" => Ok(Priority::Social),
            "academic" => Ok(Priority::Academic),
            "business" => Ok(Priority::Business),
            "none" => Ok(Priority::None),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Dynamic per-persona counters, mutated on every turn and regenerated over
/// wall-clock time by the background tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionState {
    pub persona_id: String,
    pub interest_level: i64,
    pub interaction_fatigue: i64,
    pub current_priority: Priority,
    /// Seconds the persona is willing to spend.
    pub available_time: i64,
    pub social_energy: i64,
    /// Unix timestamp after which the persona can re-engage.
    pub cooldown_until: f64,
    pub last_updated: DateTime<Utc>,
}

impl InteractionState {
    pub fn new(persona_id: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            interest_level: 50,
            interaction_fatigue: 0,
            current_priority: Priority::None,
            available_time: 300,
            social_energy: 100,
            cooldown_until: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// Available iff off cooldown with more than 30s of time and more than 10
    /// points of social energy.
    pub fn is_available(&self) -> bool {
        unix_now() >= self.cooldown_until && self.available_time > 30 && self.social_energy > 10
    }

    /// Fatigue from a turn: 1 fatigue point per 30s, 1 energy point per
    /// minute, and the duration itself comes off the time budget.
    pub fn apply_fatigue(&mut self, duration_secs: i64) {
        self.interaction_fatigue += duration_secs / 30;
        self.social_energy = (self.social_energy - duration_secs / 60).max(0);
        self.available_time = (self.available_time - duration_secs).max(0);
    }

    /// Regeneration over idle time: 1 energy point per minute (cap 200) and
    /// 1 fatigue point shed per 5 minutes.
    pub fn regenerate(&mut self, seconds_elapsed: i64) {
        self.social_energy = (self.social_energy + seconds_elapsed / 60).min(200);
        self.interaction_fatigue = (self.interaction_fatigue - seconds_elapsed / 300).max(0);
    }
}

/// Stable persona identity. Background and traits are immutable after
/// creation; only the interaction state churns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub description: String,
    pub personality_traits: HashMap<String, serde_json::Value>,
    /// Topic -> interest score (0-100).
    pub topic_preferences: HashMap<String, i64>,
    pub charisma: i64,
    pub intelligence: i64,
    pub social_rank: String,
    pub created_at: DateTime<Utc>,
    pub interaction_state: InteractionState,
}

impl Persona {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            interaction_state: InteractionState::new(id.clone()),
            id,
            name: name.into(),
            description: description.into(),
            personality_traits: HashMap::new(),
            topic_preferences: HashMap::new(),
            charisma: 10,
            intelligence: 10,
            social_rank: "commoner".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_attributes(mut self, charisma: i64, intelligence: i64, social_rank: impl Into<String>) -> Self {
        self.charisma = charisma.clamp(1, 20);
        self.intelligence = intelligence.clamp(1, 20);
        self.social_rank = social_rank.into();
        self
    }
}

/// Per-persona emotional dimensions, drifted by interactions and time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionalState {
    pub persona_id: String,
    pub mood: f64,
    pub energy_level: f64,
    pub stress_level: f64,
    pub curiosity: f64,
    pub social_battery: f64,
    pub last_updated: DateTime<Utc>,
}

impl EmotionalState {
    pub fn default_for(persona_id: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            mood: 0.5,
            energy_level: 0.7,
            stress_level: 0.3,
            curiosity: 0.6,
            social_battery: 0.8,
            last_updated: Utc::now(),
        }
    }

    /// Positive interactions lift mood; all interactions drain the social
    /// battery at 30% per hour of conversation.
    pub fn apply_interaction_effect(&mut self, quality: f64, duration_minutes: f64) {
        let mood_change = quality * 0.1 * (duration_minutes / 10.0).min(1.0);
        self.mood = (self.mood + mood_change).clamp(-1.0, 1.0);

        let battery_drain = duration_minutes / 60.0 * 0.3;
        self.social_battery = (self.social_battery - battery_drain).max(0.0);
        self.last_updated = Utc::now();
    }

    /// Battery refills during alone time; mood drifts back toward neutral.
    pub fn regenerate_over_time(&mut self, hours_elapsed: f64) {
        self.social_battery = (self.social_battery + hours_elapsed * 0.5).min(1.0);

        let drift = hours_elapsed * 0.1;
        if self.mood > 0.0 {
            self.mood = (self.mood - drift).max(0.0);
        } else if self.mood < 0.0 {
            self.mood = (self.mood + drift).min(0.0);
        }
    }

    pub fn clamp_all(&mut self) {
        self.mood = self.mood.clamp(-1.0, 1.0);
        self.energy_level = self.energy_level.clamp(0.0, 1.0);
        self.stress_level = self.stress_level.clamp(0.0, 1.0);
        self.curiosity = self.curiosity.clamp(0.0, 1.0);
        self.social_battery = self.social_battery.clamp(0.0, 1.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    #[default]
    Stranger,
    Acquaintance,
    Friend,
    CloseFriend,
    Rival,
    Enemy,
    Mentor,
    Student,
    Romantic,
    Family,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Stranger => "stranger",
            RelationshipType::Acquaintance => "acquaintance",
            RelationshipType::Friend => "friend",
            RelationshipType::CloseFriend => "close_friend",
            RelationshipType::Rival => "rival",
            RelationshipType::Enemy => "enemy",
            RelationshipType::Mentor => "mentor",
            RelationshipType::Student => "student",
            RelationshipType::Romantic => "romantic",
            RelationshipType::Family => "family",
        }
    }
}

impl FromStr for RelationshipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stranger" => Ok(RelationshipType::Stranger),
            "acquaintance" => Ok(RelationshipType::Acquaintance),
            "friend" => Ok(RelationshipType::Friend),
            "close_friend" => Ok(RelationshipType::CloseFriend),
            "rival" => Ok(RelationshipType::Rival),
            "enemy" => Ok(RelationshipType::Enemy),
            "mentor" => Ok(RelationshipType::Mentor),
            "student" => Ok(RelationshipType::Student),
            "romantic" => Ok(RelationshipType::Romantic),
            "family" => Ok(RelationshipType::Family),
            other => Err(format!("unknown relationship type: {other}")),
        }
    }
}

/// A significant interaction recorded on the relationship itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorableMoment {
    pub timestamp: DateTime<Utc>,
    pub quality: f64,
    pub context: String,
    pub duration_minutes: f64,
}

/// Symmetric pairwise state. Exactly one record exists per unordered pair;
/// `persona1_id` always holds the lexicographically smaller id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub persona1_id: String,
    pub persona2_id: String,

    pub affinity: f64,
    pub trust: f64,
    pub respect: f64,
    pub intimacy: f64,

    pub relationship_type: RelationshipType,
    pub interaction_count: i64,
    /// Total minutes of interaction.
    pub total_interaction_time: f64,
    pub first_meeting: DateTime<Utc>,
    pub last_interaction: Option<DateTime<Utc>>,

    pub memorable_moments: Vec<MemorableMoment>,
    pub conflict_history: Vec<MemorableMoment>,
    pub recent_interaction_quality: f64,
}

/// Sort the two ids so lookups are symmetric by construction.
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

impl Relationship {
    pub fn new_stranger(persona1_id: &str, persona2_id: &str) -> Self {
        let (first, second) = canonical_pair(persona1_id, persona2_id);
        Self {
            id: Uuid::new_v4().to_string(),
            persona1_id: first.to_string(),
            persona2_id: second.to_string(),
            affinity: 0.0,
            trust: 0.0,
            respect: 0.0,
            intimacy: 0.0,
            relationship_type: RelationshipType::Stranger,
            interaction_count: 0,
            total_interaction_time: 0.0,
            first_meeting: Utc::now(),
            last_interaction: None,
            memorable_moments: Vec::new(),
            conflict_history: Vec::new(),
            recent_interaction_quality: 0.0,
        }
    }

    pub fn other_of(&self, persona_id: &str) -> &str {
        if self.persona1_id == persona_id {
            &self.persona2_id
        } else {
            &self.persona1_id
        }
    }

    /// Overall social compatibility in [0, 1]. Strong dimensions in either
    /// direction count; mutually positive pairs get a bonus.
    pub fn compatibility_score(&self) -> f64 {
        let mut score = self.affinity.abs() * 0.3
            + self.trust.abs() * 0.25
            + self.respect.abs() * 0.25
            + self.intimacy * 0.2;

        if self.affinity > 0.0 && self.trust > 0.0 {
            score *= 1.2;
        }

        score.min(1.0)
    }

    /// Signed relationship strength in [-1, 1]. Intimacy counts against the
    /// pair when affinity is negative.
    pub fn strength(&self) -> f64 {
        let intimacy_term = if self.affinity > 0.0 { self.intimacy } else { -self.intimacy };
        self.affinity * 0.4 + self.trust * 0.3 + self.respect * 0.2 + intimacy_term * 0.1
    }

    /// Modifier applied to interaction quality, clamped to +-0.5. Recent
    /// negative interactions have a cooling effect.
    pub fn interaction_modifier(&self) -> f64 {
        let mut modifier = self.strength() * 0.3;
        if self.recent_interaction_quality < -0.3 {
            modifier -= 0.2;
        }
        modifier.clamp(-0.5, 0.5)
    }

    pub fn clamp_dimensions(&mut self) {
        self.affinity = self.affinity.clamp(-1.0, 1.0);
        self.trust = self.trust.clamp(-1.0, 1.0);
        self.respect = self.respect.clamp(-1.0, 1.0);
        self.intimacy = self.intimacy.clamp(0.0, 1.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Public => "public",
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Visibility::Private),
            "shared" => Ok(Visibility::Shared),
            "public" => Ok(Visibility::Public),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    #[default]
    Conversation,
    Observation,
    Reflection,
    Relationship,
    Goal,
    Secret,
    Trauma,
    Achievement,
    Learning,
    Routine,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Conversation => "conversation",
            MemoryType::Observation => "observation",
            MemoryType::Reflection => "reflection",
            MemoryType::Relationship => "relationship",
            MemoryType::Goal => "goal",
            MemoryType::Secret => "secret",
            MemoryType::Trauma => "trauma",
            MemoryType::Achievement => "achievement",
            MemoryType::Learning => "learning",
            MemoryType::Routine => "routine",
        }
    }
}

impl FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(MemoryType::Conversation),
            "observation" => Ok(MemoryType::Observation),
            "reflection" => Ok(MemoryType::Reflection),
            "relationship" => Ok(MemoryType::Relationship),
            "goal" => Ok(MemoryType::Goal),
            "secret" => Ok(MemoryType::Secret),
            "trauma" => Ok(MemoryType::Trauma),
            "achievement" => Ok(MemoryType::Achievement),
            "learning" => Ok(MemoryType::Learning),
            "routine" => Ok(MemoryType::Routine),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

/// A single long-term memory. Content is immutable after write; decay mutates
/// importance, access updates counters, pruning deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub persona_id: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub emotional_valence: f64,
    pub related_personas: Vec<String>,
    pub visibility: Visibility,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub accessed_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl Memory {
    pub fn new(persona_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            persona_id: persona_id.into(),
            content: content.into(),
            memory_type: MemoryType::Conversation,
            importance: 0.5,
            emotional_valence: 0.0,
            related_personas: Vec::new(),
            visibility: Visibility::Private,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
            accessed_count: 0,
            last_accessed: None,
        }
    }

    pub fn record_access(&mut self) {
        self.accessed_count += 1;
        self.last_accessed = Some(Utc::now());
    }

    /// Retention priority used by pruning: importance plus a small credit per
    /// access.
    pub fn retention_priority(&self) -> f64 {
        self.importance + self.accessed_count as f64 * 0.01
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    FullLlm,
    Constrained,
    Template,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::FullLlm => "full_llm",
            ResponseType::Constrained => "constrained",
            ResponseType::Template => "template",
        }
    }
}

impl FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_llm" => Ok(ResponseType::FullLlm),
            "constrained" => Ok(ResponseType::Constrained),
            "template" => Ok(ResponseType::Template),
            other => Err(format!("unknown response type: {other}")),
        }
    }
}

/// Live conversation state. active -> ended is the only transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<String>,
    pub current_speaker: Option<String>,
    pub topic: String,
    pub topic_drift_count: i64,
    /// Seconds elapsed.
    pub duration: i64,
    pub token_budget: i64,
    pub tokens_used: i64,
    pub continue_score: i64,
    pub score_history: Vec<i64>,
    pub turn_count: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
}

impl Conversation {
    pub fn new(participants: Vec<String>, topic: impl Into<String>, token_budget: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participants,
            current_speaker: None,
            topic: topic.into(),
            topic_drift_count: 0,
            duration: 0,
            token_budget,
            tokens_used: 0,
            continue_score: 50,
            score_history: Vec::new(),
            turn_count: 0,
            started_at: Utc::now(),
            ended_at: None,
            exit_reason: None,
        }
    }

    pub fn add_turn(&mut self, speaker_id: &str, continue_score: i64) {
        self.current_speaker = Some(speaker_id.to_string());
        self.turn_count += 1;
        self.continue_score = continue_score;
        self.score_history.push(continue_score);
    }

    pub fn should_continue(&self) -> bool {
        self.continue_score >= 40 && self.token_budget > 50
    }

    pub fn end(&mut self, reason: impl Into<String>) {
        self.ended_at = Some(Utc::now());
        self.exit_reason = Some(reason.into());
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// One committed turn. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub conversation_id: String,
    pub speaker_id: String,
    pub turn_number: i64,
    pub content: String,
    pub response_type: ResponseType,
    pub continue_score: i64,
    pub tokens_used: i64,
    /// Seconds.
    pub processing_time: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_boundary_on_social_energy() {
        let mut state = InteractionState::new("p1");
        state.social_energy = 10;
        assert!(!state.is_available());

        state.social_energy = 11;
        assert!(state.is_available());
    }

    #[test]
    fn availability_requires_time_budget() {
        let mut state = InteractionState::new("p1");
        state.available_time = 30;
        assert!(!state.is_available());

        state.available_time = 31;
        assert!(state.is_available());
    }

    #[test]
    fn cooldown_blocks_availability() {
        let mut state = InteractionState::new("p1");
        state.cooldown_until = unix_now() + 120.0;
        assert!(!state.is_available());
    }

    #[test]
    fn fatigue_drains_energy_and_time() {
        let mut state = InteractionState::new("p1");
        state.apply_fatigue(120);
        assert_eq!(state.interaction_fatigue, 4);
        assert_eq!(state.social_energy, 98);
        assert_eq!(state.available_time, 180);
    }

    #[test]
    fn fatigue_never_goes_below_floor() {
        let mut state = InteractionState::new("p1");
        state.social_energy = 1;
        state.available_time = 10;
        state.apply_fatigue(600);
        assert_eq!(state.social_energy, 0);
        assert_eq!(state.available_time, 0);
    }

    #[test]
    fn regeneration_caps_energy_at_200() {
        let mut state = InteractionState::new("p1");
        state.social_energy = 195;
        state.interaction_fatigue = 3;
        state.regenerate(600);
        assert_eq!(state.social_energy, 200);
        assert_eq!(state.interaction_fatigue, 1);
    }

    #[test]
    fn persona_attribute_clamps() {
        let persona = Persona::new("Test", "desc").with_attributes(25, 0, "noble");
        assert_eq!(persona.charisma, 20);
        assert_eq!(persona.intelligence, 1);
    }

    #[test]
    fn emotional_effect_clamps_mood() {
        let mut state = EmotionalState::default_for("p1");
        state.mood = 0.95;
        state.apply_interaction_effect(1.0, 60.0);
        assert!(state.mood <= 1.0);
        assert!(state.social_battery < 0.8);
    }

    #[test]
    fn mood_drifts_toward_neutral() {
        let mut state = EmotionalState::default_for("p1");
        state.mood = 0.5;
        state.regenerate_over_time(2.0);
        assert!((state.mood - 0.3).abs() < 1e-9);

        state.mood = -0.05;
        state.regenerate_over_time(1.0);
        assert_eq!(state.mood, 0.0);
    }

    #[test]
    fn relationship_pair_is_canonical() {
        let a = Relationship::new_stranger("zeta", "alpha");
        assert_eq!(a.persona1_id, "alpha");
        assert_eq!(a.persona2_id, "zeta");

        let b = Relationship::new_stranger("alpha", "zeta");
        assert_eq!((b.persona1_id, b.persona2_id), (a.persona1_id, a.persona2_id));
    }

    #[test]
    fn strength_counts_intimacy_against_hostile_pairs() {
        let mut rel = Relationship::new_stranger("a", "b");
        rel.affinity = -0.5;
        rel.intimacy = 1.0;
        let strength = rel.strength();
        assert!(strength < -0.2);
    }

    #[test]
    fn compatibility_bonus_for_mutual_positive() {
        let mut rel = Relationship::new_stranger("a", "b");
        rel.affinity = 0.5;
        rel.trust = 0.5;
        rel.respect = 0.5;
        rel.intimacy = 0.5;
        let with_bonus = rel.compatibility_score();

        rel.trust = -0.5;
        let without_bonus = rel.compatibility_score();
        assert!(with_bonus > without_bonus);
    }

    #[test]
    fn interaction_modifier_is_clamped() {
        let mut rel = Relationship::new_stranger("a", "b");
        rel.affinity = -1.0;
        rel.trust = -1.0;
        rel.respect = -1.0;
        rel.recent_interaction_quality = -0.9;
        assert_eq!(rel.interaction_modifier(), -0.5);
    }

    #[test]
    fn should_continue_boundaries() {
        let mut conv = Conversation::new(vec!["a".into(), "b".into()], "general", 1000);
        conv.continue_score = 40;
        conv.token_budget = 51;
        assert!(conv.should_continue());

        conv.continue_score = 39;
        assert!(!conv.should_continue());

        conv.continue_score = 40;
        conv.token_budget = 50;
        assert!(!conv.should_continue());
    }

    #[test]
    fn add_turn_appends_score_history() {
        let mut conv = Conversation::new(vec!["a".into(), "b".into()], "general", 1000);
        conv.add_turn("a", 72);
        conv.add_turn("b", 65);
        assert_eq!(conv.turn_count, 2);
        assert_eq!(conv.score_history, vec![72, 65]);
        assert_eq!(conv.current_speaker.as_deref(), Some("b"));
    }

    #[test]
    fn memory_retention_priority_weights_access() {
        let mut memory = Memory::new("p1", "fact");
        memory.importance = 0.5;
        memory.record_access();
        memory.record_access();
        assert!((memory.retention_priority() - 0.52).abs() < 1e-9);
        assert_eq!(memory.accessed_count, 2);
        assert!(memory.last_accessed.is_some());
    }

    #[test]
    fn enum_labels_round_trip() {
        for ty in [
            MemoryType::Conversation,
            MemoryType::Secret,
            MemoryType::Routine,
        ] {
            assert_eq!(ty.as_str().parse::<MemoryType>().ok(), Some(ty));
        }
        assert!("gossip".parse::<MemoryType>().is_err());
        assert_eq!("shared".parse::<Visibility>().ok(), Some(Visibility::Shared));
        assert_eq!(
            "close_friend".parse::<RelationshipType>().ok(),
            Some(RelationshipType::CloseFriend)
        );
    }
}
