//! Gateway to the local Ollama backend: prompt assembly, constraint mapping,
//! streaming, fallbacks, and continue-score-tiered generation.

pub mod client;
pub mod fallback;
pub mod prompt;
pub mod tiers;

pub use client::{GenerationOutcome, OllamaClient};
pub use fallback::{fallback_response, template_response};
pub use prompt::{GenerationConstraints, build_persona_prompt};
pub use tiers::{TierOutcome, TieredGenerator};
