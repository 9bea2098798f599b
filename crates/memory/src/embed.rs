//! Embedding providers for the vector index.
//!
//! The Ollama embedder degrades to `None` on any failure so the system keeps
//! working offline; retrieval then falls back to lexical overlap scoring.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Calls the Ollama `/api/embeddings` endpoint.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: format!("{}/api/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let body = serde_json::json!({ "model": self.model, "prompt": text });
        let response = self.client.post(&self.url).json(&body).send().await.ok()?;
        let json: serde_json::Value = response.json().await.ok()?;

        let embedding = json["embedding"]
            .as_array()?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Vec<f32>>();

        if embedding.is_empty() { None } else { Some(embedding) }
    }
}

/// Deterministic feature-hashed bag-of-words embedding. Not semantically
/// meaningful, but stable across runs, which keeps retrieval usable without a
/// model and makes the test suite reproducible.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dims];
        let mut any = false;

        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let hashed = hasher.finish();

            let index = (hashed % self.dims as u64) as usize;
            let sign = if hashed & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
            any = true;
        }

        if !any {
            return None;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }

        Some(vector)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("dragons hoard gold").await.expect("embeds");
        let b = embedder.embed("dragons hoard gold").await.expect("embeds");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated() {
        let embedder = HashEmbedder::default();
        let base = embedder.embed("the dragon guards treasure").await.expect("embeds");
        let close = embedder.embed("a dragon and its treasure").await.expect("embeds");
        let far = embedder.embed("quarterly accounting ledgers").await.expect("embeds");

        assert!(cosine_similarity(&base, &close) > cosine_similarity(&base, &far));
    }

    #[tokio::test]
    async fn empty_text_embeds_to_none() {
        let embedder = HashEmbedder::default();
        assert!(embedder.embed("   ").await.is_none());
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
    }
}
