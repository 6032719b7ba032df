//! Upstream LLM Port (spec §6)
//!
//! The core treats request/response bodies as opaque JSON; only the
//! system prompt and model id are mutated in outbound requests (spec §4.5).
//! Modeled as an `async_trait`, the way the teacher's `LLMProvider`
//! (`agent/provider.rs`) abstracts over Ollama/OpenAI-compatible/local
//! backends.

use crate::error::CoreResult;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub body: Value,
}

#[async_trait]
pub trait UpstreamPort: Send + Sync {
    async fn invoke(&self, request: UpstreamRequest) -> CoreResult<Value>;
}

/// An `OpenAICompatibleProvider`-shaped implementation, grounded in the
/// teacher's `agent/provider.rs`: a thin `reqwest::Client` wrapper that
/// posts to a configurable base URL.
pub struct HttpUpstreamPort {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpUpstreamPort {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl UpstreamPort for HttpUpstreamPort {
    async fn invoke(&self, request: UpstreamRequest) -> CoreResult<Value> {
        let mut body = request.body;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(request.model));
            obj.insert("system".to_string(), Value::String(request.system_prompt));
        }

        let mut req = self.client.post(format!("{}/v1/chat/completions", self.base_url)).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if resp.status().is_server_error() {
            return Err(crate::error::CoreError::UpstreamFailure(format!("upstream returned {}", resp.status())));
        }
        let value = resp.json::<Value>().await?;
        Ok(value)
    }
}
