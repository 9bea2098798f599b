//! Continue-score response tiers and token accounting.
//!
//! | Score | Tier        | Constraints                              |
//! |-------|-------------|------------------------------------------|
//! | >=80  | full_llm    | creativity 0.8, max_length 100           |
//! | 60-79 | full_llm    | creativity 0.6, max_length 100           |
//! | 40-59 | constrained | max_length 50, concise, prepare_exit     |
//! | <40   | template    | canned line, no backend call             |

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};

use persona_core::{Conversation, Persona, ResponseType};

use crate::client::OllamaClient;
use crate::fallback::template_response;
use crate::prompt::GenerationConstraints;

/// Result of a tiered generation: the text, the tier the turn commits with,
/// and the backend failure (if any) behind a substituted fallback. A failed
/// backend call downgrades the committed tier to `template`.
#[derive(Debug, Clone)]
pub struct TierOutcome {
    pub text: String,
    pub response_type: ResponseType,
    pub backend_error: Option<String>,
}

pub struct TieredGenerator {
    client: OllamaClient,
    /// Bounded backend concurrency; callers queue when saturated.
    permits: Arc<Semaphore>,
}

fn constraints_for(score: i64) -> Option<(GenerationConstraints, ResponseType)> {
    if score >= 80 {
        Some((
            GenerationConstraints {
                creativity: Some(0.8),
                max_length: Some(100),
                ..Default::default()
            },
            ResponseType::FullLlm,
        ))
    } else if score >= 60 {
        Some((
            GenerationConstraints {
                creativity: Some(0.6),
                max_length: Some(100),
                ..Default::default()
            },
            ResponseType::FullLlm,
        ))
    } else if score >= 40 {
        Some((
            GenerationConstraints {
                creativity: Some(0.5),
                max_length: Some(50),
                style: Some("concise".to_string()),
                prepare_exit: true,
                ..Default::default()
            },
            ResponseType::Constrained,
        ))
    } else {
        None
    }
}

impl TieredGenerator {
    pub fn new(client: OllamaClient, max_concurrent: usize) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn client(&self) -> &OllamaClient {
        &self.client
    }

    /// Generate the turn response for a continue score.
    pub async fn generate_by_score(
        &self,
        score: i64,
        user_input: &str,
        persona: &Persona,
        context: &Conversation,
    ) -> TierOutcome {
        match constraints_for(score) {
            Some((constraints, response_type)) => {
                let _permit = self.permits.acquire().await;
                let outcome = self
                    .client
                    .generate(user_input, persona, context, &constraints)
                    .await;
                TierOutcome {
                    response_type: if outcome.backend_error.is_some() {
                        ResponseType::Template
                    } else {
                        response_type
                    },
                    text: outcome.text,
                    backend_error: outcome.backend_error,
                }
            }
            None => TierOutcome {
                text: template_response(persona, context),
                response_type: ResponseType::Template,
                backend_error: None,
            },
        }
    }

    /// Streaming variant; the template tier emits its single line as one
    /// chunk.
    pub async fn generate_stream_by_score(
        &self,
        score: i64,
        user_input: &str,
        persona: &Persona,
        context: &Conversation,
        tx: mpsc::Sender<String>,
    ) -> TierOutcome {
        match constraints_for(score) {
            Some((constraints, response_type)) => {
                let _permit = self.permits.acquire().await;
                let outcome = self
                    .client
                    .generate_stream(user_input, persona, context, &constraints, tx)
                    .await;
                TierOutcome {
                    response_type: if outcome.backend_error.is_some() {
                        ResponseType::Template
                    } else {
                        response_type
                    },
                    text: outcome.text,
                    backend_error: outcome.backend_error,
                }
            }
            None => {
                let line = template_response(persona, context);
                let _ = tx.send(line.clone()).await;
                TierOutcome {
                    text: line,
                    response_type: ResponseType::Template,
                    backend_error: None,
                }
            }
        }
    }

    /// Token cost estimate: `words * 1.3 * tier multiplier`.
    pub fn estimate_tokens(&self, response: &str, response_type: ResponseType) -> i64 {
        let base = response.split_whitespace().count() as f64 * 1.3;
        let multiplier = match response_type {
            ResponseType::FullLlm => 1.5,
            ResponseType::Constrained => 1.0,
            ResponseType::Template => 0.1,
        };
        (base * multiplier) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_config::LlmConfig;

    fn generator() -> TieredGenerator {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_seconds: 1,
            ..Default::default()
        };
        TieredGenerator::new(OllamaClient::new(&config), 2)
    }

    fn fixtures() -> (Persona, Conversation) {
        let persona = Persona::new("Tess", "Test subject");
        let conv = Conversation::new(vec![persona.id.clone()], "general", 500);
        (persona, conv)
    }

    #[test]
    fn tier_boundaries() {
        let (constraints, tier) = constraints_for(80).expect("full tier");
        assert_eq!(tier, ResponseType::FullLlm);
        assert_eq!(constraints.creativity, Some(0.8));

        let (constraints, tier) = constraints_for(79).expect("full tier");
        assert_eq!(tier, ResponseType::FullLlm);
        assert_eq!(constraints.creativity, Some(0.6));

        let (constraints, tier) = constraints_for(40).expect("constrained tier");
        assert_eq!(tier, ResponseType::Constrained);
        assert!(constraints.prepare_exit);
        assert_eq!(constraints.max_length, Some(50));

        assert!(constraints_for(39).is_none());
    }

    #[test]
    fn token_estimates_follow_multipliers() {
        let generator = generator();
        let response = "one two three four five six seven eight nine ten";

        let full = generator.estimate_tokens(response, ResponseType::FullLlm);
        let constrained = generator.estimate_tokens(response, ResponseType::Constrained);
        let template = generator.estimate_tokens(response, ResponseType::Template);

        assert_eq!(full, (10.0 * 1.3 * 1.5) as i64);
        assert_eq!(constrained, (10.0 * 1.3) as i64);
        assert_eq!(template, (10.0 * 1.3 * 0.1) as i64);
        assert!(full > constrained && constrained > template);
    }

    #[tokio::test]
    async fn template_tier_skips_backend() {
        let generator = generator();
        let (persona, conv) = fixtures();

        // Score below 40 must answer instantly even though the backend
        // address is unreachable.
        let outcome = generator
            .generate_by_score(10, "Hello", &persona, &conv)
            .await;
        assert_eq!(outcome.response_type, ResponseType::Template);
        assert!(outcome.backend_error.is_none());
        assert!(!outcome.text.is_empty());
    }

    #[tokio::test]
    async fn backend_failure_downgrades_to_template() {
        let generator = generator();
        let (persona, conv) = fixtures();

        let outcome = generator
            .generate_by_score(90, "Hello", &persona, &conv)
            .await;
        assert_eq!(outcome.response_type, ResponseType::Template);
        assert!(outcome.backend_error.is_some());
        assert!(!outcome.text.is_empty());
    }

    #[tokio::test]
    async fn template_stream_is_single_chunk() {
        let generator = generator();
        let (persona, conv) = fixtures();
        let (tx, mut rx) = mpsc::channel(4);

        let outcome = generator
            .generate_stream_by_score(5, "Hello", &persona, &conv, tx)
            .await;
        assert_eq!(outcome.response_type, ResponseType::Template);
        assert_eq!(rx.recv().await.as_deref(), Some(outcome.text.as_str()));
        assert!(rx.recv().await.is_none());
    }
}
