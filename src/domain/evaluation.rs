use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method-specific, validated evaluation payloads, tagged by
/// `evaluation_method` (Design Note §9.1: dynamic parameter blobs are
/// modeled as tagged variants, falling back to an untyped map only at the
/// storage boundary).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "evaluation_method", rename_all = "snake_case")]
pub enum EvaluationParams {
    /// An LLM judge scores the response against free-form rubric text.
    LlmRubric { rubric: String, judge_model: String },
    /// The response is compared against a reference answer for exact
    /// (case-insensitive) match.
    ExactMatch { reference: String },
    /// A regular expression must match somewhere in the response.
    RegexMatch { pattern: String },
    /// Escape hatch for evaluation methods the core does not validate yet.
    /// Round-trips whatever the storage layer handed back.
    Other { method: String, params: Value },
}

impl EvaluationParams {
    pub fn method(&self) -> &str {
        match self {
            EvaluationParams::LlmRubric { .. } => "llm_rubric",
            EvaluationParams::ExactMatch { .. } => "exact_match",
            EvaluationParams::RegexMatch { .. } => "regex_match",
            EvaluationParams::Other { method, .. } => method,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub id: String,
    pub skill_id: String,
    pub params: EvaluationParams,
    /// Weight in `[0, 1]`. Defaults to `1.0` when the storage boundary
    /// omits it (spec §9 Open Question resolution).
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Evaluation {
    pub fn new(skill_id: impl Into<String>, params: EvaluationParams, weight: f64) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            skill_id: skill_id.into(),
            params,
            weight: weight.clamp(0.0, 1.0),
            created_at: now,
            updated_at: now,
        }
    }
}

pub const DEFAULT_EVALUATION_WEIGHT: f64 = 1.0;
