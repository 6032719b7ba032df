use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Log {
    pub id: String,
    pub skill_id: String,
    pub cluster_id: String,
    pub arm_id: String,
    pub request_body: Value,
    pub response_body: Value,
    /// Nullable until the embedding port has run. Downstream consumers
    /// filter on `embedding IS NOT NULL` (spec §3/§4.1).
    pub embedding: Option<Vec<f32>>,
    pub start_time: DateTime<Utc>,
}

impl Log {
    pub fn new(
        skill_id: impl Into<String>,
        cluster_id: impl Into<String>,
        arm_id: impl Into<String>,
        request_body: Value,
        response_body: Value,
        embedding: Option<Vec<f32>>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: super::new_id(),
            skill_id: skill_id.into(),
            cluster_id: cluster_id.into(),
            arm_id: arm_id.into(),
            request_body,
            response_body,
            embedding,
            start_time,
        }
    }
}
