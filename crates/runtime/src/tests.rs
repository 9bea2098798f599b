//! Dispatcher-level scenarios: the wire-visible behavior of the assembled
//! runtime, exercised offline (unreachable backend, deterministic embedder).

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use persona_config::AppConfig;
use persona_core::unix_now;

use crate::dispatcher::Dispatcher;
use crate::state::AppState;

fn offline_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.llm.base_url = "http://127.0.0.1:9".to_string();
    config.llm.timeout_seconds = 1;
    config
}

async fn harness() -> (Arc<AppState>, Dispatcher) {
    let state = AppState::initialize_in_memory(offline_config())
        .await
        .expect("state assembles");
    (state.clone(), Dispatcher::new(state))
}

/// Send one request and collect every frame it produced.
async fn call_frames(dispatcher: &Dispatcher, connection: &str, payload: Value) -> Vec<Value> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    dispatcher
        .handle_message(&payload.to_string(), connection, &tx)
        .await;
    drop(tx);

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(serde_json::from_str(&frame).expect("frames are valid json"));
    }
    frames
}

/// Send one request and return its single response frame.
async fn call(dispatcher: &Dispatcher, connection: &str, method: &str, params: Value) -> Value {
    let payload = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": "test",
    });
    let mut frames = call_frames(dispatcher, connection, payload).await;
    assert_eq!(frames.len(), 1, "{method} must produce exactly one frame");
    frames.remove(0)
}

async fn create_persona(dispatcher: &Dispatcher, name: &str, charisma: i64) -> String {
    let response = call(
        dispatcher,
        "setup",
        "persona.create",
        json!({ "name": name, "description": "test persona", "charisma": charisma }),
    )
    .await;
    response["result"]["persona_id"]
        .as_str()
        .expect("created persona id")
        .to_string()
}

// ── Protocol-level error mapping ──────────────────────────────────────────────

#[tokio::test]
async fn malformed_json_yields_parse_error() {
    let (_state, dispatcher) = harness().await;
    let (tx, mut rx) = mpsc::channel::<String>(4);
    dispatcher.handle_message("{not json", "ws1", &tx).await;
    drop(tx);

    let frame: Value = serde_json::from_str(&rx.recv().await.expect("frame")).expect("json");
    assert_eq!(frame["error"]["code"], -32700);
}

#[tokio::test]
async fn missing_method_yields_invalid_request() {
    let (_state, dispatcher) = harness().await;
    let frames = call_frames(&dispatcher, "ws1", json!({"jsonrpc": "2.0", "id": 1})).await;
    assert_eq!(frames[0]["error"]["code"], -32600);
    assert_eq!(frames[0]["id"], 1);
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let (_state, dispatcher) = harness().await;
    let response = call(&dispatcher, "ws1", "persona.fly", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
    assert!(
        response["error"]["message"]
            .as_str()
            .expect("message")
            .contains("persona.fly")
    );
}

#[tokio::test]
async fn mistyped_params_yield_invalid_params() {
    let (_state, dispatcher) = harness().await;
    let response = call(&dispatcher, "ws1", "persona.switch", json!({"persona_id": 5})).await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn handler_validation_maps_to_internal_with_message() {
    let (_state, dispatcher) = harness().await;
    let response = call(&dispatcher, "ws1", "persona.chat", json!({"message": "hi"})).await;
    assert_eq!(response["error"]["code"], -32603);
    assert_eq!(
        response["error"]["message"],
        "No persona selected. Use persona.switch first"
    );
}

// ── Scenario 1: switch and chat ───────────────────────────────────────────────

#[tokio::test]
async fn switch_and_chat() {
    let (state, dispatcher) = harness().await;
    let aria = create_persona(&dispatcher, "Aria", 18).await;

    // Seed the energy level the scenario expects.
    let mut persona = state.store.load_persona(&aria).await.unwrap().unwrap();
    persona.interaction_state.social_energy = 150;
    state.store.save_persona(&persona).await.unwrap();

    let switched = call(&dispatcher, "ws1", "persona.switch", json!({"persona_id": aria})).await;
    assert_eq!(switched["result"]["persona_id"], aria.as_str());
    assert_eq!(switched["result"]["status"], "active");

    let chatted = call(
        &dispatcher,
        "ws1",
        "persona.chat",
        json!({"message": "Hello", "token_budget": 100}),
    )
    .await;
    let result = &chatted["result"];

    assert!(!result["response"].as_str().expect("response").is_empty());
    let score = result["continue_score"].as_i64().expect("score");
    assert!((0..=100).contains(&score));
    assert!(result["tokens_used"].as_i64().expect("tokens") > 0);

    let after = state.store.load_persona(&aria).await.unwrap().unwrap();
    assert!(after.interaction_state.social_energy < 150);
}

#[tokio::test]
async fn switch_accepts_persona_name() {
    let (_state, dispatcher) = harness().await;
    create_persona(&dispatcher, "Finn", 12).await;

    let switched =
        call(&dispatcher, "ws1", "persona.switch", json!({"persona_id": "finn"})).await;
    assert_eq!(switched["result"]["status"], "active");
}

// ── Scenario 2: streaming ─────────────────────────────────────────────────────

#[tokio::test]
async fn chat_stream_frames_are_ordered_and_consistent() {
    let (_state, dispatcher) = harness().await;
    let aria = create_persona(&dispatcher, "Aria", 18).await;
    call(&dispatcher, "ws1", "persona.switch", json!({"persona_id": aria})).await;

    let frames = call_frames(
        &dispatcher,
        "ws1",
        json!({
            "jsonrpc": "2.0",
            "method": "persona.chat_stream",
            "params": {"message": "Tell me a short story"},
            "id": "s1",
        }),
    )
    .await;

    assert!(frames.len() >= 2);
    assert_eq!(frames[0]["result"]["event_type"], "stream_start");
    let stream_id = frames[0]["result"]["stream_id"].as_str().expect("stream id");

    let mut concatenated = String::new();
    for frame in &frames[1..] {
        if frame["result"]["event_type"] == "stream_chunk" {
            assert_eq!(frame["result"]["stream_id"], stream_id);
            concatenated.push_str(frame["result"]["chunk"].as_str().expect("chunk text"));
        }
    }
    assert!(!concatenated.is_empty());

    // Offline the backend is unreachable, so the fallback chunk is followed
    // by a stream_error frame rather than stream_complete.
    let last = frames.last().expect("frames");
    assert_eq!(last["result"]["event_type"], "stream_error");
    assert_eq!(last["error"]["code"], -32603);
}

#[tokio::test]
async fn stream_without_selected_persona_fails_cleanly() {
    let (_state, dispatcher) = harness().await;
    let frames = call_frames(
        &dispatcher,
        "ws-unselected",
        json!({
            "jsonrpc": "2.0",
            "method": "persona.chat_stream",
            "params": {"message": "hi"},
            "id": 1,
        }),
    )
    .await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["error"]["code"], -32603);
}

// ── Scenario 3: cross-persona visibility ──────────────────────────────────────

#[tokio::test]
async fn cross_persona_search_honors_visibility() {
    let (_state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 12).await;
    let bob = create_persona(&dispatcher, "Bob", 12).await;

    for (content, visibility) in [
        ("private festival diary", "private"),
        ("shared festival note", "shared"),
        ("public festival poster", "public"),
    ] {
        let stored = call(
            &dispatcher,
            "ws1",
            "memory.store",
            json!({
                "persona_id": alice,
                "content": content,
                "importance": 0.9,
                "visibility": visibility,
            }),
        )
        .await;
        assert_eq!(stored["result"]["stored"], true);
    }

    let searched = call(
        &dispatcher,
        "ws1",
        "memory.search_cross_persona",
        json!({
            "persona_id": bob,
            "query": "festival",
            "min_importance": 0.0,
            "include_shared": true,
            "include_public": true,
        }),
    )
    .await;

    let memories = searched["result"]["memories"].as_array().expect("memories");
    let contents: Vec<&str> = memories
        .iter()
        .map(|m| m["content"].as_str().expect("content"))
        .collect();

    assert!(contents.contains(&"shared festival note"));
    assert!(contents.contains(&"public festival poster"));
    assert!(!contents.contains(&"private festival diary"));
}

// ── Scenario 4: cooldown ──────────────────────────────────────────────────────

#[tokio::test]
async fn ended_conversation_puts_participants_on_cooldown() {
    let (state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 12).await;
    let bob = create_persona(&dispatcher, "Bob", 12).await;

    let started = call(
        &dispatcher,
        "ws1",
        "conversation.start",
        json!({"persona1_id": alice, "persona2_id": bob}),
    )
    .await;
    let conversation_id = started["result"]["conversation_id"]
        .as_str()
        .expect("conversation id");

    let ended = call(
        &dispatcher,
        "ws1",
        "conversation.end",
        json!({"conversation_id": conversation_id}),
    )
    .await;
    assert_eq!(ended["result"]["ended"], true);

    let persona = state.store.load_persona(&alice).await.unwrap().unwrap();
    assert!(persona.interaction_state.cooldown_until > unix_now());

    let switched =
        call(&dispatcher, "ws1", "persona.switch", json!({"persona_id": alice})).await;
    assert_eq!(switched["error"]["code"], -32603);
    assert!(
        switched["error"]["message"]
            .as_str()
            .expect("message")
            .contains("is not available for interaction")
    );
}

// ── Scenario 5: relationship symmetry ─────────────────────────────────────────

#[tokio::test]
async fn relationship_update_is_symmetric() {
    let (_state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 12).await;
    let bob = create_persona(&dispatcher, "Bob", 12).await;

    let updated = call(
        &dispatcher,
        "ws1",
        "relationship.update",
        json!({
            "persona1_id": alice,
            "persona2_id": bob,
            "interaction_quality": 0.8,
            "duration_minutes": 20.0,
            "context": "collaboration",
        }),
    )
    .await;
    assert_eq!(updated["result"]["success"], true);

    let forward = call(
        &dispatcher,
        "ws1",
        "relationship.get",
        json!({"persona1_id": alice, "persona2_id": bob}),
    )
    .await;
    let reverse = call(
        &dispatcher,
        "ws1",
        "relationship.get",
        json!({"persona1_id": bob, "persona2_id": alice}),
    )
    .await;

    assert_eq!(forward["result"]["exists"], true);
    assert_eq!(forward["result"]["relationship"], reverse["result"]["relationship"]);
    assert!(forward["result"]["relationship"]["trust"].as_f64().expect("trust") > 0.0);
}

#[tokio::test]
async fn out_of_range_quality_is_rejected() {
    let (_state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 12).await;
    let bob = create_persona(&dispatcher, "Bob", 12).await;

    let response = call(
        &dispatcher,
        "ws1",
        "relationship.update",
        json!({
            "persona1_id": alice,
            "persona2_id": bob,
            "interaction_quality": 1.5,
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32603);
    assert!(
        response["error"]["message"]
            .as_str()
            .expect("message")
            .contains("between -1.0 and 1.0")
    );
}

// ── Scenario 6: decay then prune ──────────────────────────────────────────────

#[tokio::test]
async fn decay_then_prune_respects_cap_and_priority() {
    let (state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 12).await;

    for index in 0..60 {
        call(
            &dispatcher,
            "ws1",
            "memory.store",
            json!({
                "persona_id": alice,
                "content": format!("memory number {index} about daily life"),
                "importance": 0.1 + (index as f64 % 10.0) * 0.08,
            }),
        )
        .await;
    }

    let decayed = call(
        &dispatcher,
        "ws1",
        "memory.decay_force",
        json!({"persona_id": alice, "decay_factor": 0.2}),
    )
    .await;
    assert_eq!(decayed["result"]["status"], "persona_decay_completed");

    let pruned = call(
        &dispatcher,
        "ws1",
        "memory.prune",
        json!({"persona_id": alice, "force": true, "cap": 40}),
    )
    .await;
    assert_eq!(pruned["result"]["status"], "pruning_completed");
    assert_eq!(pruned["result"]["memories_after"], 40);

    let remaining = state.memory.vector().list(&alice).await.unwrap();
    assert!(remaining.len() <= 40);

    let kept_min = remaining
        .iter()
        .map(|m| m.retention_priority())
        .fold(f64::INFINITY, f64::min);
    let pruned_max = pruned["result"]["average_importance_pruned"]
        .as_f64()
        .expect("pruned average");
    assert!(kept_min >= pruned_max - 1e-9);
}

// ── Assorted wire behaviors ───────────────────────────────────────────────────

#[tokio::test]
async fn persona_list_counts_availability() {
    let (state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 12).await;
    create_persona(&dispatcher, "Bob", 12).await;

    let mut persona = state.store.load_persona(&alice).await.unwrap().unwrap();
    persona.interaction_state.social_energy = 0;
    state.store.save_persona(&persona).await.unwrap();

    let listed = call(&dispatcher, "ws1", "persona.list", json!({})).await;
    assert_eq!(listed["result"]["total_count"], 2);
    assert_eq!(listed["result"]["available_count"], 1);
}

#[tokio::test]
async fn persona_delete_removes_everything() {
    let (state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 12).await;

    call(
        &dispatcher,
        "ws1",
        "memory.store",
        json!({"persona_id": alice, "content": "soon to vanish"}),
    )
    .await;

    let deleted =
        call(&dispatcher, "ws1", "persona.delete", json!({"persona_id": alice})).await;
    assert_eq!(deleted["result"]["deleted"], true);

    assert!(state.store.load_persona(&alice).await.unwrap().is_none());
    assert_eq!(state.memory.count(&alice).await.unwrap(), 0);

    let status = call(&dispatcher, "ws1", "persona.status", json!({"persona_id": alice})).await;
    assert_eq!(status["error"]["code"], -32603);
}

#[tokio::test]
async fn system_status_reports_counts() {
    let (_state, dispatcher) = harness().await;
    create_persona(&dispatcher, "Alice", 12).await;

    let status = call(&dispatcher, "ws1", "system.status", json!({})).await;
    assert_eq!(status["result"]["system_status"], "operational");
    assert_eq!(status["result"]["total_personas"], 1);
    assert_eq!(status["result"]["llm_available"], false);
}

#[tokio::test]
async fn decay_start_and_stop_round_trip() {
    let (_state, dispatcher) = harness().await;

    let started = call(&dispatcher, "ws1", "memory.decay_start", json!({})).await;
    assert_eq!(started["result"]["status"], "background_decay_started");

    let stats = call(&dispatcher, "ws1", "memory.decay_stats", json!({})).await;
    assert_eq!(stats["result"]["decay_statistics"]["running"], true);

    let stopped = call(&dispatcher, "ws1", "memory.decay_stop", json!({})).await;
    assert_eq!(stopped["result"]["status"], "background_decay_stopped");
}

#[tokio::test]
async fn emotional_state_update_clamps_values() {
    let (_state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 12).await;

    let updated = call(
        &dispatcher,
        "ws1",
        "emotional.update_state",
        json!({"persona_id": alice, "mood": 5.0, "stress_level": -3.0}),
    )
    .await;
    assert_eq!(updated["result"]["updated_state"]["mood"], 1.0);
    assert_eq!(updated["result"]["updated_state"]["stress_level"], 0.0);

    let fetched = call(
        &dispatcher,
        "ws1",
        "emotional.get_state",
        json!({"persona_id": alice}),
    )
    .await;
    assert_eq!(fetched["result"]["emotional_state"]["mood"], 1.0);
}

#[tokio::test]
async fn compatibility_reports_analysis_and_suggestions() {
    let (state, dispatcher) = harness().await;
    let alice = create_persona(&dispatcher, "Alice", 16).await;
    let bob = create_persona(&dispatcher, "Bob", 15).await;

    for persona_id in [&alice, &bob] {
        let mut persona = state.store.load_persona(persona_id).await.unwrap().unwrap();
        persona.topic_preferences.insert("music".into(), 80);
        state.store.save_persona(&persona).await.unwrap();
    }

    let response = call(
        &dispatcher,
        "ws1",
        "relationship.compatibility",
        json!({"persona1_id": alice, "persona2_id": bob}),
    )
    .await;

    let analysis = &response["result"]["compatibility_analysis"];
    assert!(analysis["overall"].as_f64().expect("overall") > 0.0);
    assert!(
        response["result"]["interaction_suggestions"]["recommended_topics"]
            .as_array()
            .expect("topics")
            .iter()
            .any(|topic| topic == "music")
    );
}

#[tokio::test]
async fn stream_cancel_of_unknown_stream_is_not_found() {
    let (_state, dispatcher) = harness().await;
    let response =
        call(&dispatcher, "ws1", "stream.cancel", json!({"stream_id": "missing"})).await;
    assert_eq!(response["error"]["code"], -32603);
    assert!(
        response["error"]["message"]
            .as_str()
            .expect("message")
            .contains("Stream not found")
    );
}
