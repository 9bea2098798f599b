//! Streaming method handlers: progressive chunked responses with cooperative
//! cancellation observed at chunk boundaries.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::warn;

use persona_core::Conversation;
use persona_llm::GenerationConstraints;
use persona_memory::StoreMemoryRequest;

use crate::rpc::{self, RpcRequest, stream_error_frame, stream_frame};
use crate::state::AppState;

/// Route a `_stream` method. Unknown streaming methods produce a regular
/// method-not-found error frame.
pub async fn handle_streaming_request(
    state: &Arc<AppState>,
    request: &RpcRequest,
    connection_id: &str,
    out: &mpsc::Sender<String>,
) {
    match request.method.as_str() {
        "persona.chat_stream" => chat_stream(state, request, connection_id, out).await,
        other => {
            let _ = out
                .send(rpc::error_frame(
                    request.id.as_ref(),
                    rpc::METHOD_NOT_FOUND,
                    &format!("Method not found: {other}"),
                ))
                .await;
        }
    }
}

async fn chat_stream(
    state: &Arc<AppState>,
    request: &RpcRequest,
    connection_id: &str,
    out: &mpsc::Sender<String>,
) {
    let id = request.id.clone();
    let params = request.params.clone().unwrap_or_else(|| json!({}));

    let message = params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let token_budget = params
        .get("token_budget")
        .and_then(Value::as_i64)
        .unwrap_or(500);

    // Validation failures before a stream exists are plain error frames.
    if message.trim().is_empty() {
        let _ = out
            .send(rpc::error_frame(
                id.as_ref(),
                rpc::INTERNAL_ERROR,
                "message is required",
            ))
            .await;
        return;
    }

    let Some(persona_id) = state.sessions.current_persona(connection_id) else {
        let _ = out
            .send(rpc::error_frame(
                id.as_ref(),
                rpc::INTERNAL_ERROR,
                "No persona selected. Use persona.switch first",
            ))
            .await;
        return;
    };

    let persona = match state.store.load_persona(&persona_id).await {
        Ok(Some(persona)) => persona,
        _ => {
            let _ = out
                .send(rpc::error_frame(
                    id.as_ref(),
                    rpc::INTERNAL_ERROR,
                    "Current persona not found",
                ))
                .await;
            return;
        }
    };

    // Backpressure: refuse new streams past the configured cap.
    if state.sessions.active_stream_count() >= state.config.session.max_streaming_sessions {
        let _ = out
            .send(rpc::error_frame(
                id.as_ref(),
                rpc::INTERNAL_ERROR,
                "Too many streaming sessions in flight",
            ))
            .await;
        return;
    }

    let request_id = id
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_else(|| "anonymous".to_string());
    let stream_id = state
        .sessions
        .create_streaming_session(&request_id, &persona_id, &message);

    let start_data = json!({
        "persona_id": persona.id.clone(),
        "persona_name": persona.name.clone(),
        "message": message.clone(),
        "token_budget": token_budget,
    });
    let _ = out
        .send(stream_frame(
            id.as_ref(),
            rpc::events::START,
            &stream_id,
            Some(start_data),
        ))
        .await;

    let session = state.sessions.conversation_session(&persona_id);
    let turn_count = session.as_ref().map(|s| s.turn_count).unwrap_or(0);
    let conversation_id = state
        .sessions
        .current_conversation_id(connection_id)
        .unwrap_or_else(|| "stream_session".to_string());

    let mut context = Conversation::new(vec![persona_id.clone()], "general", token_budget);
    context.id = conversation_id;
    context.turn_count = turn_count;

    let constraints = GenerationConstraints {
        max_length: Some(((token_budget as f64 / 1.3) as u32).clamp(20, 300)),
        ..Default::default()
    };

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(128);
    let generator = state.generator.clone();
    let producer_persona = persona.clone();
    let producer_context = context.clone();
    let producer_message = message.clone();
    let producer = tokio::spawn(async move {
        generator
            .client()
            .generate_stream(
                &producer_message,
                &producer_persona,
                &producer_context,
                &constraints,
                chunk_tx,
            )
            .await
    });

    let mut full_response = String::new();
    let mut chunk_count: u64 = 0;
    let mut cancelled = false;

    while let Some(chunk) = chunk_rx.recv().await {
        // Cancellation is observed between chunks; dropping the receiver
        // stops the producer at its next send.
        if state.sessions.is_stream_cancelled(&stream_id) {
            cancelled = true;
            break;
        }

        chunk_count += 1;
        full_response.push_str(&chunk);

        let chunk_data = json!({
            "chunk": chunk,
            "chunk_number": chunk_count,
            "total_length": full_response.len(),
        });
        let _ = out
            .send(stream_frame(
                id.as_ref(),
                rpc::events::CHUNK,
                &stream_id,
                Some(chunk_data),
            ))
            .await;
    }
    drop(chunk_rx);

    if cancelled {
        let _ = out
            .send(stream_frame(
                id.as_ref(),
                rpc::events::CANCELLED,
                &stream_id,
                Some(json!({ "reason": "Client cancelled" })),
            ))
            .await;
        let _ = producer.await;
        state.sessions.cleanup_streaming_session(&stream_id);
        return;
    }

    let outcome = match producer.await {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = out
                .send(stream_error_frame(
                    id.as_ref(),
                    &stream_id,
                    "Chat streaming failed",
                    Some(&err.to_string()),
                ))
                .await;
            state.sessions.cleanup_streaming_session(&stream_id);
            return;
        }
    };

    // A substituted fallback still streamed a chunk; report the backend
    // failure after it so clients never block.
    if let Some(backend_error) = outcome.backend_error.as_deref() {
        let _ = out
            .send(stream_error_frame(
                id.as_ref(),
                &stream_id,
                "Chat streaming failed",
                Some(backend_error),
            ))
            .await;
        state.sessions.cleanup_streaming_session(&stream_id);
        return;
    }

    let processing_time = state
        .sessions
        .streaming_session(&stream_id)
        .map(|session| session.duration_seconds())
        .unwrap_or(0.0);
    let tokens_used = (full_response.split_whitespace().count() as f64 * 1.3) as i64;

    let complete_data = json!({
        "full_response": full_response.clone(),
        "chunk_count": chunk_count,
        "processing_time": (processing_time * 1000.0).round() / 1000.0,
        "response_length": full_response.len(),
        "tokens_used": tokens_used,
        "persona_name": persona.name.clone(),
    });
    let _ = out
        .send(stream_frame(
            id.as_ref(),
            rpc::events::COMPLETE,
            &stream_id,
            Some(complete_data),
        ))
        .await;

    state.sessions.increment_turn(&persona_id);

    // Persist substantial exchanges as conversation memory in the background.
    if full_response.len() > 50 {
        let memory = state.memory.clone();
        let persona_id = persona_id.clone();
        let user_message = message.clone();
        let response = full_response.clone();
        tokio::spawn(async move {
            let mut preview = safe_truncate(&response, 100).to_string();
            if preview.len() < response.len() {
                preview.push_str("...");
            }

            let mut metadata = serde_json::Map::new();
            metadata.insert("streaming".into(), json!(true));
            metadata.insert("response_length".into(), json!(response.len()));

            let request = StoreMemoryRequest {
                persona_id,
                content: format!("Conversation with user: '{user_message}' -> '{preview}'"),
                importance: Some(0.6),
                metadata: Some(metadata),
                ..Default::default()
            };
            if let Err(err) = memory.store(request).await {
                warn!(%err, "failed to store streaming conversation memory");
            }
        });
    }

    state.sessions.cleanup_streaming_session(&stream_id);
}

/// `&text[..limit]` rounded down to a UTF-8 char boundary.
pub(crate) fn safe_truncate(text: &str, limit: usize) -> &str {
    if limit >= text.len() {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
