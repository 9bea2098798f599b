//! Self-play chatroom loop: pair available personas, talk until the engine
//! ends the conversation, and report what happened. Exercises the whole
//! runtime without any external client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use persona_core::{Persona, Result};

use crate::state::AppState;

/// Hard cap per conversation so one chatty pair cannot monopolize a round.
const MAX_TURNS_PER_CONVERSATION: usize = 12;

#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub rounds: usize,
    pub conversations: usize,
    pub turns: usize,
    pub natural_conclusions: usize,
}

#[derive(Debug, Clone)]
pub struct ConversationOutcome {
    pub conversation_id: String,
    pub participants: (String, String),
    pub topic: String,
    pub turns: usize,
    pub final_score: i64,
    pub exit_reason: Option<String>,
}

/// Run the self-play loop for roughly `minutes` wall-clock minutes.
pub async fn run_simulation(state: Arc<AppState>, minutes: u64) -> Result<SimulationReport> {
    let deadline = Instant::now() + Duration::from_secs(minutes * 60);
    let mut report = SimulationReport::default();

    info!(minutes, "simulation starting");
    while Instant::now() < deadline {
        let outcomes = run_round(&state).await?;
        report.rounds += 1;

        if outcomes.is_empty() {
            // Everyone is on cooldown or drained; let regeneration catch up.
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }

        for outcome in outcomes {
            report.conversations += 1;
            report.turns += outcome.turns;
            if outcome.exit_reason.as_deref() == Some("natural_conclusion") {
                report.natural_conclusions += 1;
            }
            info!(
                conversation = %outcome.conversation_id,
                topic = %outcome.topic,
                turns = outcome.turns,
                final_score = outcome.final_score,
                exit_reason = outcome.exit_reason.as_deref().unwrap_or("still_active"),
                "simulated conversation finished"
            );
        }
    }

    info!(
        rounds = report.rounds,
        conversations = report.conversations,
        turns = report.turns,
        "simulation complete"
    );
    Ok(report)
}

/// One round: regenerate, pair currently available personas, and play each
/// pairing out.
pub async fn run_round(state: &Arc<AppState>) -> Result<Vec<ConversationOutcome>> {
    state.engine.regenerate_states().await?;

    let personas = state.store.list_personas().await?;
    let available: Vec<Persona> = personas
        .into_iter()
        .filter(|persona| persona.interaction_state.is_available())
        .collect();

    let mut outcomes = Vec::new();
    for pair in available.chunks(2) {
        let [first, second] = pair else { continue };
        let topic = best_shared_topic(first, second);

        let conversation = match state
            .engine
            .initiate(&first.id, &second.id, &topic, 1000)
            .await
        {
            Ok(conversation) => conversation,
            Err(err) => {
                warn!(%err, "simulation pairing rejected");
                continue;
            }
        };

        let outcome = play_out(state, &conversation.id, first, second, &topic).await?;
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

async fn play_out(
    state: &Arc<AppState>,
    conversation_id: &str,
    first: &Persona,
    second: &Persona,
    topic: &str,
) -> Result<ConversationOutcome> {
    let speakers = [first, second];
    let mut turns = 0;
    let mut final_score = 0;

    for turn_index in 0..MAX_TURNS_PER_CONVERSATION {
        let speaker = speakers[turn_index % 2];
        let listener = speakers[(turn_index + 1) % 2];
        let input = synthesized_line(topic, &listener.name, turn_index);

        match state
            .engine
            .process_turn(conversation_id, &speaker.id, &input)
            .await
        {
            Ok(turn) => {
                turns += 1;
                final_score = turn.continue_score;
            }
            // The engine removed the conversation (or rejected the turn);
            // the pairing is over either way.
            Err(_) => break,
        }

        if state.engine.status(conversation_id).await.is_err() {
            break;
        }
    }

    if state.engine.status(conversation_id).await.is_ok() {
        state.engine.end(conversation_id, "simulation_round_over").await?;
    }

    let stored = state.store.load_conversation(conversation_id).await?;
    Ok(ConversationOutcome {
        conversation_id: conversation_id.to_string(),
        participants: (first.id.clone(), second.id.clone()),
        topic: topic.to_string(),
        turns,
        final_score,
        exit_reason: stored.and_then(|conversation| conversation.exit_reason),
    })
}

/// The topic both personas like most, by combined preference; "general" when
/// they share nothing.
fn best_shared_topic(first: &Persona, second: &Persona) -> String {
    first
        .topic_preferences
        .iter()
        .filter_map(|(topic, &interest1)| {
            second
                .topic_preferences
                .get(topic)
                .map(|&interest2| (topic.clone(), interest1 + interest2))
        })
        .max_by_key(|(_, combined)| *combined)
        .map(|(topic, _)| topic)
        .unwrap_or_else(|| "general".to_string())
}

fn synthesized_line(topic: &str, listener: &str, turn_index: usize) -> String {
    let lines = [
        format!("What do you think about {topic}, {listener}?"),
        format!("I heard something interesting about {topic} recently."),
        format!("Tell me more about your experience with {topic}."),
        format!("Honestly, {topic} has been on my mind all week."),
    ];
    lines[turn_index % lines.len()].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_config::AppConfig;

    fn offline_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.llm.base_url = "http://127.0.0.1:9".to_string();
        config.llm.timeout_seconds = 1;
        config
    }

    #[test]
    fn shared_topic_picks_highest_combined_interest() {
        let mut first = Persona::new("A", "x");
        let mut second = Persona::new("B", "x");
        first.topic_preferences.insert("magic".into(), 90);
        first.topic_preferences.insert("trade".into(), 40);
        second.topic_preferences.insert("magic".into(), 30);
        second.topic_preferences.insert("trade".into(), 95);

        assert_eq!(best_shared_topic(&first, &second), "trade");
        assert_eq!(best_shared_topic(&first, &Persona::new("C", "x")), "general");
    }

    #[tokio::test]
    async fn round_pairs_available_personas_and_runs_turns() -> Result<()> {
        let state = AppState::initialize_in_memory(offline_config()).await?;

        let mut alice = Persona::new("Alice", "Curious").with_attributes(15, 12, "commoner");
        alice.topic_preferences.insert("magic".into(), 80);
        let mut bob = Persona::new("Bob", "Steady").with_attributes(14, 12, "commoner");
        bob.topic_preferences.insert("magic".into(), 75);
        state.store.save_persona(&alice).await?;
        state.store.save_persona(&bob).await?;

        let outcomes = run_round(&state).await?;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].turns >= 1);
        assert_eq!(outcomes[0].topic, "magic");
        // The conversation was driven to an end one way or another.
        assert!(outcomes[0].exit_reason.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn round_skips_unavailable_personas() -> Result<()> {
        let state = AppState::initialize_in_memory(offline_config()).await?;

        let mut alice = Persona::new("Alice", "Exhausted");
        alice.interaction_state.social_energy = 0;
        let bob = Persona::new("Bob", "Ready");
        state.store.save_persona(&alice).await?;
        state.store.save_persona(&bob).await?;

        let outcomes = run_round(&state).await?;
        assert!(outcomes.is_empty());
        Ok(())
    }
}
