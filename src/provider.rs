//! Embedding provider abstraction and implementations.
//!
//! Two providers ship with the core:
//! - **[`DummyProvider`]** — deterministic SHA-256-derived vectors, no
//!   network. Used by tests and offline pipelines.
//! - **[`RemoteApiProvider`]** — any OpenAI-compatible `/v1/embeddings`
//!   endpoint, with batching, retry, and exponential backoff.
//!
//! The core never branches on the provider beyond this trait; dimension is
//! provider-declared and immutable for the life of a run.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s — capped at 30s, `max_retries` attempts

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier stored on every embedding row (e.g. `"dummy"`).
    fn provider_name(&self) -> &str;
    /// Model identifier recorded in the manifest.
    fn model_name(&self) -> &str;
    /// Declared vector dimensionality; every returned vector has this length.
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Dummy Provider ============

/// Deterministic offline embedder: vectors derived from the SHA-256 of the
/// normalized text, repeated to fill the dimension. Identical text always
/// yields the identical vector.
pub struct DummyProvider {
    dim: usize,
    model: String,
}

impl DummyProvider {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            model: format!("dummy-{}", dim),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let normalized = text.trim().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        let digest = hasher.finalize();

        let needed = self.dim * 4;
        let mut bytes = Vec::with_capacity(needed);
        while bytes.len() < needed {
            bytes.extend_from_slice(&digest);
        }
        bytes.truncate(needed);

        bytes
            .chunks_exact(4)
            .map(|b| {
                let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                v as f32 / u32::MAX as f32
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for DummyProvider {
    fn provider_name(&self) -> &str {
        "dummy"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_one(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Remote API Provider ============

/// Embedding provider for OpenAI-compatible HTTP endpoints.
///
/// Requires `OPENAI_API_KEY` in the environment unless the endpoint is a
/// local service that accepts unauthenticated requests.
pub struct RemoteApiProvider {
    model: String,
    dim: usize,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl RemoteApiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for remote provider"))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dim: config.dimension(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dim,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs((1u64 << (attempt - 1).min(5)).min(30));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&url).json(&body);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: EmbeddingsResponse = response
                            .json()
                            .await
                            .context("Invalid embeddings response body")?;
                        return parse_response(parsed, texts.len(), self.dim);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Embedding API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

fn parse_response(
    mut resp: EmbeddingsResponse,
    expected: usize,
    dim: usize,
) -> Result<Vec<Vec<f32>>> {
    resp.data.sort_by_key(|item| item.index);
    if resp.data.len() != expected {
        bail!(
            "Embedding response count mismatch: expected {}, got {}",
            expected,
            resp.data.len()
        );
    }
    for item in &resp.data {
        if item.embedding.len() != dim {
            bail!(
                "Embedding dimension mismatch: declared {}, got {}",
                dim,
                item.embedding.len()
            );
        }
    }
    Ok(resp.data.into_iter().map(|item| item.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for RemoteApiProvider {
    fn provider_name(&self) -> &str {
        "remote"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.request(&[text.to_string()]).await?;
        result
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

/// Create the configured [`EmbeddingProvider`].
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "dummy" => Ok(Box::new(DummyProvider::new(config.dimension()))),
        "remote" => Ok(Box::new(RemoteApiProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dummy_deterministic() {
        let p = DummyProvider::new(384);
        let a = p.embed("Navigate to SaaS").await.unwrap();
        let b = p.embed("Navigate to SaaS").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
    }

    #[tokio::test]
    async fn test_dummy_distinct_texts_differ() {
        let p = DummyProvider::new(64);
        let a = p.embed("alpha").await.unwrap();
        let b = p.embed("beta").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_dummy_normalizes_case_and_whitespace() {
        let p = DummyProvider::new(64);
        let a = p.embed("  Hello World  ").await.unwrap();
        let b = p.embed("hello world").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_dummy_batch_preserves_order() {
        let p = DummyProvider::new(32);
        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let batch = p.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 3);
        for (text, vec) in texts.iter().zip(batch.iter()) {
            assert_eq!(vec, &p.embed(text).await.unwrap());
        }
    }

    #[test]
    fn test_dummy_values_in_unit_interval() {
        let p = DummyProvider::new(128);
        for v in p.embed_one("range check") {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_parse_response_sorts_by_index() {
        let resp = EmbeddingsResponse {
            data: vec![
                EmbeddingItem {
                    index: 1,
                    embedding: vec![2.0, 2.0],
                },
                EmbeddingItem {
                    index: 0,
                    embedding: vec![1.0, 1.0],
                },
            ],
        };
        let parsed = parse_response(resp, 2, 2).unwrap();
        assert_eq!(parsed[0], vec![1.0, 1.0]);
    }

    #[test]
    fn test_parse_response_rejects_wrong_dim() {
        let resp = EmbeddingsResponse {
            data: vec![EmbeddingItem {
                index: 0,
                embedding: vec![1.0],
            }],
        };
        assert!(parse_response(resp, 1, 2).is_err());
    }

    #[test]
    fn test_create_provider_dummy() {
        let cfg = EmbeddingConfig::default();
        let p = create_provider(&cfg).unwrap();
        assert_eq!(p.provider_name(), "dummy");
        assert_eq!(p.dimension(), 384);
    }
}
