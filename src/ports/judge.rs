//! Judge LLM Port (spec §6)
//!
//! Distinct from `UpstreamPort` because its failures need a retry
//! classification (spec §4.6/§7.3) — the evaluation runner decides to
//! retry or fall back to a degraded score of `0.5`, never by matching on
//! an error string (Design Note §9.5).

use crate::error::ProviderErrorKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResponse {
    pub score: f64,
    pub reasoning: String,
    pub metadata: Value,
}

#[derive(Debug, thiserror::Error)]
#[error("judge call failed: {message}")]
pub struct JudgeError {
    pub message: String,
    pub kind: ProviderErrorKind,
}

#[async_trait]
pub trait JudgePort: Send + Sync {
    async fn judge(&self, request: JudgeRequest) -> Result<JudgeResponse, JudgeError>;
}

/// HTTP-backed judge, grounded in the teacher's `agent/provider.rs`
/// `OpenAICompatibleProvider` shape.
pub struct HttpJudgePort {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJudgePort {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl JudgePort for HttpJudgePort {
    async fn judge(&self, request: JudgeRequest) -> Result<JudgeResponse, JudgeError> {
        let resp = self
            .client
            .post(format!("{}/v1/judge", self.base_url))
            .json(&serde_json::json!({
                "system_prompt": request.system_prompt,
                "user_prompt": request.user_prompt,
                "output_format": "JSON",
            }))
            .send()
            .await
            .map_err(|e| JudgeError {
                kind: crate::error::classify_reqwest_error(&e),
                message: e.to_string(),
            })?;

        if resp.status().as_u16() == 429 {
            return Err(JudgeError { message: "rate limited".into(), kind: ProviderErrorKind::RateLimited });
        }
        if resp.status().is_server_error() {
            return Err(JudgeError { message: format!("judge returned {}", resp.status()), kind: ProviderErrorKind::ServerError });
        }

        resp.json::<JudgeResponse>().await.map_err(|e| JudgeError {
            kind: crate::error::classify_reqwest_error(&e),
            message: e.to_string(),
        })
    }
}
