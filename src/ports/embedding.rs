//! Embedding Port (spec §6)

use crate::error::CoreResult;
use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    /// `d` is fixed per deployment; the core never assumes a value for it.
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;
}

/// HTTP-backed embedding port, grounded in the teacher's `agent/provider.rs`
/// `OpenAICompatibleProvider` shape: a thin `reqwest::Client` wrapper
/// posting to a configurable base URL and parsing a flat float vector back.
pub struct HttpEmbeddingPort {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmbeddingPort {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl EmbeddingPort for HttpEmbeddingPort {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let resp = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&serde_json::json!({ "input": text }))
            .send()
            .await?;
        let body: EmbeddingResponse = resp.json().await?;
        Ok(body.embedding)
    }
}

#[derive(serde::Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}
