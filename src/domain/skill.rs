use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A skill's tunable configuration knobs (spec §3). Out-of-range values are
/// a `ValidationError` at the edge (§7.1) — this core never constructs one
/// outside its valid ranges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillConfig {
    /// Number of arms per cluster. Valid range `[1, 25]`.
    pub configuration_count: u32,
    /// Requests between partitioning triggers. Valid range `[1, 1000]`.
    pub clustering_interval: u32,
    /// Warm-up floor for the bandit. Valid range `[1, 1000]`.
    pub reflection_min_requests_per_arm: u32,
    /// Thompson-sampling temperature `τ`. Valid range `[0.1, 10.0]`.
    pub exploration_temperature: f64,
    /// Template variable names the seeded/reflected system prompt may use.
    pub allowed_template_variables: BTreeSet<String>,
    /// When false, C4/C3 collapse to a single implicit arm and C7/C8 are
    /// no-ops (spec §3 invariant).
    pub optimize: bool,
}

impl SkillConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=25).contains(&self.configuration_count) {
            return Err("configuration_count must be in [1, 25]".into());
        }
        if !(1..=1000).contains(&self.clustering_interval) {
            return Err("clustering_interval must be in [1, 1000]".into());
        }
        if !(1..=1000).contains(&self.reflection_min_requests_per_arm) {
            return Err("reflection_min_requests_per_arm must be in [1, 1000]".into());
        }
        if !(0.1..=10.0).contains(&self.exploration_temperature) {
            return Err("exploration_temperature must be in [0.1, 10.0]".into());
        }
        Ok(())
    }
}

/// Lock lifecycle fields, persisted on the skill row (spec §4.2/§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LockState {
    pub acquired_at: Option<DateTime<Utc>>,
    pub fencing_token: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Skill {
    pub id: String,
    pub agent_id: String,
    pub name: String,
    pub config: SkillConfig,
    /// Seed system prompt used the first time a cluster's arms are created,
    /// before any reflection has run (spec §4.4 seeding protocol).
    pub default_system_prompt: String,

    pub evaluations_regenerated_at: Option<DateTime<Utc>>,
    pub optimize_lock: LockState,
    pub reflect_lock: LockState,
    pub last_clustering_at: Option<DateTime<Utc>>,
    pub last_clustering_log_start_time: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Skill {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>, config: SkillConfig, default_system_prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            agent_id: agent_id.into(),
            name: name.into(),
            config,
            default_system_prompt: default_system_prompt.into(),
            evaluations_regenerated_at: None,
            optimize_lock: LockState::default(),
            reflect_lock: LockState::default(),
            last_clustering_at: None,
            last_clustering_log_start_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn lock_state(&self, purpose: super::LockPurpose) -> &LockState {
        match purpose {
            super::LockPurpose::Optimize => &self.optimize_lock,
            super::LockPurpose::Reflect => &self.reflect_lock,
        }
    }

    pub fn lock_state_mut(&mut self, purpose: super::LockPurpose) -> &mut LockState {
        match purpose {
            super::LockPurpose::Optimize => &mut self.optimize_lock,
            super::LockPurpose::Reflect => &mut self.reflect_lock,
        }
    }
}
