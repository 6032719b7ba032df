//! Storage Port (spec §4.1)
//!
//! The core never talks to a concrete database; everything goes through
//! this trait, the way the teacher's `TaskQueue` (`orchestrator/queue.rs`)
//! and `Memory` (`memory/mod.rs`) traits decouple the agent from its
//! persistence engine.

use crate::domain::{Arm, ArmStat, Cluster, Evaluation, EvaluationRun, Log, LockPurpose, Skill};
use crate::error::CoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outcome of a lock acquisition attempt (spec §4.1/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub acquired: bool,
    pub fencing_token: u64,
}

#[async_trait]
pub trait StoragePort: Send + Sync {
    // -- Skill --------------------------------------------------------
    async fn get_skill(&self, skill_id: &str) -> CoreResult<Skill>;
    async fn upsert_skill(&self, skill: &Skill) -> CoreResult<()>;
    async fn delete_skill(&self, skill_id: &str) -> CoreResult<()>;

    // -- Cluster --------------------------------------------------------
    async fn get_cluster(&self, cluster_id: &str) -> CoreResult<Cluster>;
    async fn get_clusters_for_skill(&self, skill_id: &str) -> CoreResult<Vec<Cluster>>;
    async fn upsert_cluster(&self, cluster: &Cluster) -> CoreResult<()>;
    async fn delete_cluster(&self, cluster_id: &str) -> CoreResult<()>;
    /// Atomically increments `cluster.total_steps` by one (spec §4.4).
    async fn increment_cluster_steps(&self, cluster_id: &str) -> CoreResult<()>;

    // -- Arm --------------------------------------------------------
    async fn get_arm(&self, arm_id: &str) -> CoreResult<Arm>;
    async fn get_arms_for_cluster(&self, cluster_id: &str) -> CoreResult<Vec<Arm>>;
    async fn upsert_arm(&self, arm: &Arm) -> CoreResult<()>;
    async fn delete_arm(&self, arm_id: &str) -> CoreResult<()>;

    // -- ArmStat --------------------------------------------------------
    async fn get_arm_stat(&self, arm_id: &str) -> CoreResult<ArmStat>;
    /// Compare-and-swap write: fails with `ConflictingUpdate` if
    /// `expected_version` no longer matches the stored version (spec §4.3).
    async fn cas_arm_stat(&self, arm_id: &str, expected_version: u64, new_stat: &ArmStat) -> CoreResult<()>;
    async fn reset_arm_stats(&self, arm_id: &str) -> CoreResult<()>;

    // -- Evaluation --------------------------------------------------------
    async fn get_evaluations_for_skill(&self, skill_id: &str) -> CoreResult<Vec<Evaluation>>;
    /// Rewrites the evaluation set for a skill atomically (spec §3).
    async fn replace_evaluations(&self, skill_id: &str, evaluations: &[Evaluation]) -> CoreResult<()>;

    // -- Log --------------------------------------------------------
    async fn upsert_log(&self, log: &Log) -> CoreResult<()>;
    async fn get_log(&self, log_id: &str) -> CoreResult<Log>;
    async fn count_logs_with_embedding(&self, skill_id: &str) -> CoreResult<u64>;
    /// Ordered by `start_time` ascending (spec §4.1).
    async fn get_logs_for_skill(
        &self,
        skill_id: &str,
        after_start_time: Option<DateTime<Utc>>,
        embedding_not_null: bool,
        limit: usize,
    ) -> CoreResult<Vec<Log>>;

    // -- EvaluationRun --------------------------------------------------------
    async fn append_evaluation_run(&self, run: &EvaluationRun) -> CoreResult<()>;
    async fn count_evaluation_runs_for_arm(&self, arm_id: &str) -> CoreResult<u64>;
    /// All evaluation runs recorded for `arm_id`, used by ongoing reflection
    /// (spec §4.8 step 2) to rank logs by reward.
    async fn get_evaluation_runs_for_arm(&self, arm_id: &str) -> CoreResult<Vec<EvaluationRun>>;

    // -- Locking (spec §4.1/§4.2) --------------------------------------------------------
    async fn try_acquire_lock(&self, skill_id: &str, purpose: LockPurpose, ttl_secs: u64, now: DateTime<Utc>) -> CoreResult<LockGrant>;

    /// Releases the lock and writes `updated_skill` in the same
    /// compare-and-swap: if `token` no longer matches the held fencing
    /// token, the whole call is a no-op (spec §4.1: "a release that does
    /// not match the current token is ignored"). This is what lets C7/C8
    /// write their completion fields and release the lock atomically
    /// (spec §4.7 step 7, §4.8 step 5).
    async fn release_lock(&self, skill_id: &str, purpose: LockPurpose, token: u64, updated_skill: &Skill) -> CoreResult<()>;
}
