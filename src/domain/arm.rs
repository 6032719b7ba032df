use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An arm's configuration payload (spec §3: "system_prompt, model_id,
/// temperature, …"). The named fields are validated at the storage
/// boundary; anything else a caller wants to carry rides in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArmParams {
    pub system_prompt: String,
    pub model_id: String,
    pub temperature: f64,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl ArmParams {
    pub fn seed(system_prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            model_id: model_id.into(),
            temperature: 0.7,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Arm {
    pub id: String,
    pub skill_id: String,
    pub cluster_id: String,
    pub name: String,
    pub params: ArmParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Arm {
    pub fn new(skill_id: impl Into<String>, cluster_id: impl Into<String>, name: impl Into<String>, params: ArmParams) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            skill_id: skill_id.into(),
            cluster_id: cluster_id.into(),
            name: name.into(),
            params,
            created_at: now,
            updated_at: now,
        }
    }
}
