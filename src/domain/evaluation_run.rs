use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One evaluation method's result within an `EvaluationRun` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationScore {
    pub method: String,
    pub score: f64,
    pub reasoning: String,
    /// Set when the judge exhausted its retries and this score is the
    /// §7.3 fallback of `0.5`.
    pub fallback: bool,
}

/// Result of one evaluation-runner invocation over a single log (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationRun {
    pub id: String,
    pub log_id: String,
    pub arm_id: String,
    pub cluster_id: String,
    pub results: Vec<EvaluationScore>,
    /// The composed reward folded into the arm's `ArmStat` (spec §4.3).
    pub reward: f64,
    pub created_at: DateTime<Utc>,
}

impl EvaluationRun {
    pub fn new(log_id: impl Into<String>, arm_id: impl Into<String>, cluster_id: impl Into<String>, results: Vec<EvaluationScore>, reward: f64) -> Self {
        Self {
            id: super::new_id(),
            log_id: log_id.into(),
            arm_id: arm_id.into(),
            cluster_id: cluster_id.into(),
            results,
            reward,
            created_at: Utc::now(),
        }
    }
}
