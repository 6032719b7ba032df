//! Meta-prompt LLM Port (spec §4.8)
//!
//! The reflection controller's two LLM calls — "regenerate the evaluation
//! set" and "regenerate a system prompt" — both go through this port. It is
//! shaped like `JudgePort` (structured JSON out) rather than `UpstreamPort`
//! (opaque bodies) because the reflection controller needs to parse the
//! result to update `Evaluation`/`Arm` rows.

use crate::domain::EvaluationParams;
use crate::error::ProviderErrorKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("meta-prompt call failed: {message}")]
pub struct MetaPromptError {
    pub message: String,
    pub kind: ProviderErrorKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegeneratedEvaluation {
    pub params: EvaluationParams,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedPromptExample {
    pub request: String,
    pub response: String,
}

#[async_trait]
pub trait MetaPromptPort: Send + Sync {
    /// Regenerates the full evaluation set for a skill (spec §4.8 step 3a).
    async fn regenerate_evaluations(&self, skill_description: &str) -> Result<Vec<RegeneratedEvaluation>, MetaPromptError>;

    /// Regenerates a single seed system prompt from examples (spec §4.8
    /// step 3b) or, for ongoing reflection, from best/worst logs (step 4).
    async fn regenerate_system_prompt(
        &self,
        skill_description: &str,
        best_examples: &[SeedPromptExample],
        worst_examples: &[SeedPromptExample],
    ) -> Result<String, MetaPromptError>;
}

/// HTTP-backed meta-prompt port, grounded in the teacher's
/// `agent/provider.rs` `OpenAICompatibleProvider` shape, calling a
/// structured-output endpoint the way `HttpJudgePort` does.
pub struct HttpMetaPromptPort {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetaPromptPort {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }

    fn to_meta_prompt_error(err: reqwest::Error) -> MetaPromptError {
        MetaPromptError { kind: crate::error::classify_reqwest_error(&err), message: err.to_string() }
    }
}

#[async_trait]
impl MetaPromptPort for HttpMetaPromptPort {
    async fn regenerate_evaluations(&self, skill_description: &str) -> Result<Vec<RegeneratedEvaluation>, MetaPromptError> {
        let resp = self
            .client
            .post(format!("{}/v1/meta-prompt/evaluations", self.base_url))
            .json(&serde_json::json!({ "skill_description": skill_description }))
            .send()
            .await
            .map_err(Self::to_meta_prompt_error)?;
        resp.json::<Vec<RegeneratedEvaluation>>().await.map_err(Self::to_meta_prompt_error)
    }

    async fn regenerate_system_prompt(
        &self,
        skill_description: &str,
        best_examples: &[SeedPromptExample],
        worst_examples: &[SeedPromptExample],
    ) -> Result<String, MetaPromptError> {
        #[derive(Deserialize)]
        struct Response {
            system_prompt: String,
        }

        let resp = self
            .client
            .post(format!("{}/v1/meta-prompt/system-prompt", self.base_url))
            .json(&serde_json::json!({
                "skill_description": skill_description,
                "best_examples": best_examples,
                "worst_examples": worst_examples,
            }))
            .send()
            .await
            .map_err(Self::to_meta_prompt_error)?;
        let body: Response = resp.json().await.map_err(Self::to_meta_prompt_error)?;
        Ok(body.system_prompt)
    }
}
