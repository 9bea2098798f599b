use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use persona_config::LlmConfig;
use persona_core::{Conversation, Persona};

use crate::fallback::fallback_response;
use crate::prompt::{GenerationConstraints, build_persona_prompt};

/// What a generation call produced. Backend failures never surface as
/// errors; a canned fallback response is substituted so the turn can still
/// commit, and the failure message is carried alongside for callers that
/// need to report it (streaming emits a `stream_error` frame from it).
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub text: String,
    pub backend_error: Option<String>,
}

impl GenerationOutcome {
    fn ok(text: String) -> Self {
        Self {
            text,
            backend_error: None,
        }
    }

    fn fallback(text: String, error: impl Into<String>) -> Self {
        Self {
            text,
            backend_error: Some(error.into()),
        }
    }
}

/// Non-streaming and streaming generation against the local Ollama backend.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    /// No whole-request deadline: streams run as long as chunks keep coming.
    streaming_client: reqwest::Client,
    base_url: String,
    default_model: String,
    default_temperature: f64,
    /// Deadline for non-streaming calls and the rolling per-chunk timeout for
    /// streams.
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_seconds.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let streaming_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            streaming_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_model: config.default_model.clone(),
            default_temperature: config.temperature,
            timeout,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(
            self.client.get(&url).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    pub async fn list_models(&self) -> Vec<String> {
        let url = format!("{}/api/tags", self.base_url);
        let Ok(response) = self.client.get(&url).send().await else {
            return Vec::new();
        };
        let Ok(body) = response.json::<serde_json::Value>().await else {
            return Vec::new();
        };

        body.get("models")
            .and_then(|models| models.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|model| model.get("name").and_then(|name| name.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One-shot generation. Any backend problem produces a fallback line.
    pub async fn generate(
        &self,
        user_input: &str,
        persona: &Persona,
        context: &Conversation,
        constraints: &GenerationConstraints,
    ) -> GenerationOutcome {
        let prompt = build_persona_prompt(user_input, persona, context, constraints);
        let model = constraints
            .model
            .as_deref()
            .unwrap_or(&self.default_model);
        let payload = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": self.generation_options(constraints),
        });

        let url = format!("{}/api/generate", self.base_url);
        match self.client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(body) => match body.get("response").and_then(|value| value.as_str()) {
                        Some(text) => GenerationOutcome::ok(text.trim().to_string()),
                        None => GenerationOutcome::fallback(
                            fallback_response(persona, context),
                            "backend response missing text",
                        ),
                    },
                    Err(err) => {
                        warn!(%err, "failed to decode generate response");
                        GenerationOutcome::fallback(
                            fallback_response(persona, context),
                            err.to_string(),
                        )
                    }
                }
            }
            Ok(response) => {
                let status = response.status();
                warn!(%status, "backend rejected generate request");
                GenerationOutcome::fallback(
                    fallback_response(persona, context),
                    format!("backend error ({status})"),
                )
            }
            Err(err) => {
                warn!(%err, "backend unreachable");
                GenerationOutcome::fallback(fallback_response(persona, context), err.to_string())
            }
        }
    }

    /// Streaming generation. Parsed response deltas are sent through `tx` as
    /// they arrive; malformed NDJSON lines are skipped. On any error exactly
    /// one fallback chunk is emitted and the stream terminates.
    pub async fn generate_stream(
        &self,
        user_input: &str,
        persona: &Persona,
        context: &Conversation,
        constraints: &GenerationConstraints,
        tx: mpsc::Sender<String>,
    ) -> GenerationOutcome {
        let prompt = build_persona_prompt(user_input, persona, context, constraints);
        let model = constraints
            .model
            .as_deref()
            .unwrap_or(&self.default_model);
        let payload = json!({
            "model": model,
            "prompt": prompt,
            "stream": true,
            "options": self.generation_options(constraints),
        });

        let url = format!("{}/api/generate", self.base_url);
        let mut response = match self.streaming_client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let status = response.status();
                warn!(%status, "backend rejected stream request");
                let fallback = fallback_response(persona, context);
                let _ = tx.send(fallback.clone()).await;
                return GenerationOutcome::fallback(fallback, format!("backend error ({status})"));
            }
            Err(err) => {
                warn!(%err, "backend unreachable for stream");
                let fallback = fallback_response(persona, context);
                let _ = tx.send(fallback.clone()).await;
                return GenerationOutcome::fallback(fallback, err.to_string());
            }
        };

        let mut full_response = String::new();
        let mut buffer = String::new();

        loop {
            // Rolling timeout: each chunk read gets the full window again.
            let chunk = match tokio::time::timeout(self.timeout, response.chunk()).await {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    warn!(%err, "stream read failed mid-response");
                    if full_response.is_empty() {
                        let fallback = fallback_response(persona, context);
                        let _ = tx.send(fallback.clone()).await;
                        return GenerationOutcome::fallback(fallback, err.to_string());
                    }
                    return GenerationOutcome::fallback(full_response, err.to_string());
                }
                Err(_) => {
                    warn!("stream read timed out");
                    if full_response.is_empty() {
                        let fallback = fallback_response(persona, context);
                        let _ = tx.send(fallback.clone()).await;
                        return GenerationOutcome::fallback(fallback, "stream read timed out");
                    }
                    return GenerationOutcome::fallback(full_response, "stream read timed out");
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // NDJSON framing: consume complete lines, keep the remainder.
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }

                let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&line) else {
                    debug!("skipping malformed stream line");
                    continue;
                };

                if let Some(delta) = parsed.get("response").and_then(|v| v.as_str()) {
                    if !delta.is_empty() {
                        full_response.push_str(delta);
                        if tx.send(delta.to_string()).await.is_err() {
                            // Receiver dropped: the consumer cancelled.
                            return GenerationOutcome::ok(full_response);
                        }
                    }
                }

                if parsed.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                    return GenerationOutcome::ok(full_response);
                }
            }
        }

        GenerationOutcome::ok(full_response)
    }

    /// Map constraints to Ollama generation options.
    fn generation_options(&self, constraints: &GenerationConstraints) -> serde_json::Value {
        let mut temperature = self.default_temperature;
        let mut num_predict: u32 = 150;

        if let Some(creativity) = constraints.creativity {
            temperature = creativity;
        }
        if let Some(max_length) = constraints.max_length {
            num_predict = ((max_length as f64 * 1.3) as u32).min(300);
        }
        if constraints.is_concise() {
            temperature = 0.5;
            num_predict = 50;
        }

        json!({
            "temperature": temperature,
            "top_p": 0.9,
            "top_k": 40,
            "num_predict": num_predict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_client() -> OllamaClient {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_seconds: 1,
            ..Default::default()
        };
        OllamaClient::new(&config)
    }

    fn fixtures() -> (Persona, Conversation) {
        let persona = Persona::new("Echo", "Repeats things");
        let conv = Conversation::new(vec![persona.id.clone()], "general", 500);
        (persona, conv)
    }

    #[test]
    fn options_map_creativity_and_length() {
        let client = unreachable_client();
        let constraints = GenerationConstraints {
            creativity: Some(0.8),
            max_length: Some(100),
            ..Default::default()
        };

        let options = client.generation_options(&constraints);
        assert_eq!(options["temperature"], 0.8);
        assert_eq!(options["num_predict"], 130);
    }

    #[test]
    fn concise_style_tightens_options() {
        let client = unreachable_client();
        let constraints = GenerationConstraints {
            creativity: Some(0.8),
            max_length: Some(100),
            style: Some("concise".to_string()),
            ..Default::default()
        };

        let options = client.generation_options(&constraints);
        assert_eq!(options["temperature"], 0.5);
        assert_eq!(options["num_predict"], 50);
    }

    #[test]
    fn token_cap_is_bounded() {
        let client = unreachable_client();
        let constraints = GenerationConstraints {
            max_length: Some(1000),
            ..Default::default()
        };
        assert_eq!(client.generation_options(&constraints)["num_predict"], 300);
    }

    #[tokio::test]
    async fn unreachable_backend_yields_fallback() {
        let client = unreachable_client();
        let (persona, conv) = fixtures();

        let outcome = client
            .generate("Hello", &persona, &conv, &GenerationConstraints::default())
            .await;
        assert!(!outcome.text.is_empty());
        assert!(outcome.backend_error.is_some());
    }

    #[tokio::test]
    async fn unreachable_stream_emits_single_fallback_chunk() {
        let client = unreachable_client();
        let (persona, conv) = fixtures();
        let (tx, mut rx) = mpsc::channel(8);

        let outcome = client
            .generate_stream("Hello", &persona, &conv, &GenerationConstraints::default(), tx)
            .await;

        let first = rx.recv().await.expect("one fallback chunk");
        assert_eq!(first, outcome.text);
        assert!(rx.recv().await.is_none());
        assert!(outcome.backend_error.is_some());
    }
}
