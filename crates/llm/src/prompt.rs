use persona_core::{Conversation, Persona};

/// Generation constraints derived from the response tier. `max_length` is in
/// words; the client converts to a token cap.
#[derive(Debug, Clone, Default)]
pub struct GenerationConstraints {
    pub creativity: Option<f64>,
    pub max_length: Option<u32>,
    pub style: Option<String>,
    pub prepare_exit: bool,
    pub avoid_topics: Vec<String>,
    pub model: Option<String>,
}

impl GenerationConstraints {
    pub fn is_concise(&self) -> bool {
        self.style.as_deref() == Some("concise")
    }
}

/// System preamble + state snapshot + guidance block + the user input.
pub fn build_persona_prompt(
    user_input: &str,
    persona: &Persona,
    context: &Conversation,
    constraints: &GenerationConstraints,
) -> String {
    let mut parts = vec![
        format!("You are {}. {}", persona.name, persona.description),
        String::new(),
        "Your personality traits:".to_string(),
    ];

    for (trait_name, value) in &persona.personality_traits {
        parts.push(format!("- {trait_name}: {value}"));
    }
    parts.push(String::new());

    let state = &persona.interaction_state;
    parts.extend([
        "Current situation:".to_string(),
        format!("- Energy level: {}/200", state.social_energy),
        format!("- Current priority: {}", state.current_priority.as_str()),
        format!("- Interest in conversation: {}/100", state.interest_level),
        format!("- Available time: {} seconds", state.available_time),
        String::new(),
    ]);

    if context.topic != "general" {
        parts.push(format!("Current topic: {}", context.topic));
    }
    if context.turn_count > 0 {
        parts.push(format!(
            "This is turn {} in the conversation.",
            context.turn_count + 1
        ));
    }

    let mut guidance = Vec::new();
    if let Some(max_length) = constraints.max_length {
        guidance.push(format!("- Keep response under {max_length} words"));
    }
    if let Some(style) = &constraints.style {
        guidance.push(format!("- Style: {style}"));
    }
    if constraints.prepare_exit {
        guidance.push("- Prepare to end the conversation politely".to_string());
    }
    if !constraints.avoid_topics.is_empty() {
        guidance.push(format!(
            "- Avoid discussing: {}",
            constraints.avoid_topics.join(", ")
        ));
    }
    if !guidance.is_empty() {
        parts.push(String::new());
        parts.push("Response guidelines:".to_string());
        parts.extend(guidance);
    }

    parts.extend([
        String::new(),
        format!("Respond to: {user_input}"),
        String::new(),
        format!("Response as {}:", persona.name),
    ]);

    parts.join("\n")
}
