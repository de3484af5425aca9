//! Embedding provider client (Voyage-style batch endpoint).
//!
//! Documents and queries embed through different input modes; the
//! provider is free to optimize either side, so the distinction is kept
//! on the wire.

use reqwest::Client;
use serde_json::Value;
use waymark_core::EmbeddingProvider;
use waymark_shared::{EmbeddingProviderConfig, Result, WaymarkError, resolve_api_key};

use crate::http_client;

pub struct EmbeddingClient {
    client: Client,
    cfg: EmbeddingProviderConfig,
    api_key: String,
}

impl EmbeddingClient {
    /// Construct from config, reading the API key from the environment.
    pub fn new(cfg: EmbeddingProviderConfig) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.api_key_env)?;
        Self::with_key(cfg, api_key)
    }

    /// Construct with an explicit key (tests point this at a mock server).
    pub fn with_key(cfg: EmbeddingProviderConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: http_client(cfg.timeout_ms)?,
            cfg,
            api_key,
        })
    }

    async fn embed(&self, texts: &[String], input_type: &str) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.cfg.model,
            "input": texts,
            "input_type": input_type,
        });
        let response = self
            .client
            .post(&self.cfg.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| WaymarkError::Network(format!("embedding request failed: {e}")))?
            .error_for_status()
            .map_err(|e| WaymarkError::Provider(format!("embedding provider: {e}")))?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| WaymarkError::Provider(format!("embedding response body: {e}")))?;

        let vectors = parse_embedding_response(json)?;
        for vector in &vectors {
            if vector.len() != self.cfg.dimensions {
                return Err(WaymarkError::Provider(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.cfg.dimensions,
                    vector.len()
                )));
            }
        }
        Ok(vectors)
    }
}

impl EmbeddingProvider for EmbeddingClient {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.embed(texts, "document").await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut vectors = self.embed(&texts, "query").await?;
        if vectors.is_empty() {
            return Err(WaymarkError::Provider(
                "embedding provider returned no vector for query".into(),
            ));
        }
        Ok(vectors.remove(0))
    }
}

/// Parse `{ "data": [{ "index": n, "embedding": [...] }, ...] }`,
/// restoring index order in case the provider shuffled the batch.
fn parse_embedding_response(json: Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| WaymarkError::Provider("embedding response missing data array".into()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                WaymarkError::Provider("embedding item missing embedding array".into())
            })?;
        let mut vector = Vec::with_capacity(embedding.len());
        for value in embedding {
            let number = value
                .as_f64()
                .ok_or_else(|| WaymarkError::Provider("embedding value must be numeric".into()))?;
            vector.push(number as f32);
        }
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}
