//! Canned responses for backend failures and the template tier.
//!
//! Line selection is keyed on the conversation turn count instead of a RNG so
//! the same state always produces the same line.

use persona_core::{Conversation, Persona, Priority};

const GENERIC_FALLBACKS: &[&str] = &[
    "I'm having trouble finding the right words right now.",
    "Let me think about that for a moment.",
    "That's an interesting point to consider.",
    "I appreciate you bringing that up.",
];

const URGENT_TEMPLATES: &[&str] = &[
    "I really must go.",
    "I have urgent matters to attend to.",
    "Perhaps we can continue this later.",
];

const DRAINED_TEMPLATES: &[&str] = &[
    "I'm feeling a bit drained.",
    "I think I need a break from talking.",
    "It's been a long day for me.",
];

const FATIGUED_TEMPLATES: &[&str] = &[
    "Interesting... I should get going though.",
    "I'll let you get back to what you were doing.",
    "Nice chatting with you.",
];

const NEUTRAL_TEMPLATES: &[&str] = &["I see.", "That's good to know.", "Hmm, interesting."];

fn pick(lines: &[&str], seed: i64) -> String {
    lines[(seed.unsigned_abs() as usize) % lines.len()].to_string()
}

/// Substitute response when the backend call fails.
pub fn fallback_response(persona: &Persona, context: &Conversation) -> String {
    let state = &persona.interaction_state;
    if state.current_priority == Priority::Urgent {
        "I really need to focus on urgent matters right now.".to_string()
    } else if state.social_energy < 30 {
        "I'm feeling a bit drained from all this conversation.".to_string()
    } else {
        pick(GENERIC_FALLBACKS, context.turn_count)
    }
}

/// Template-tier line for very low continue scores. No backend call.
pub fn template_response(persona: &Persona, context: &Conversation) -> String {
    let state = &persona.interaction_state;
    let lines = if state.current_priority == Priority::Urgent {
        URGENT_TEMPLATES
    } else if state.social_energy < 30 {
        DRAINED_TEMPLATES
    } else if state.interaction_fatigue > 50 {
        FATIGUED_TEMPLATES
    } else {
        NEUTRAL_TEMPLATES
    };

    pick(lines, context.turn_count)
}
