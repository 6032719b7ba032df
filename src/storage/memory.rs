//! In-memory `StoragePort`, grounded in the teacher's `VectorMemory`
//! (`memory/vector.rs`): an `Arc<RwLock<...>>` cache, no disk I/O. Used by
//! the test suite and by `main.rs`'s demo wiring so the core's logic can be
//! exercised without a SQLite file.

use crate::domain::{Arm, ArmStat, Cluster, Evaluation, EvaluationRun, Log, LockPurpose, Skill};
use crate::error::{CoreError, CoreResult};
use crate::ports::storage::{LockGrant, StoragePort};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    skills: HashMap<String, Skill>,
    clusters: HashMap<String, Cluster>,
    arms: HashMap<String, Arm>,
    arm_stats: HashMap<String, ArmStat>,
    evaluations: HashMap<String, Vec<Evaluation>>,
    logs: HashMap<String, Log>,
    evaluation_runs: Vec<EvaluationRun>,
}

pub struct InMemoryStoragePort {
    tables: Arc<RwLock<Tables>>,
    fencing_counter: AtomicU64,
}

impl InMemoryStoragePort {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            fencing_counter: AtomicU64::new(0),
        }
    }

    fn next_token(&self) -> u64 {
        self.fencing_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for InMemoryStoragePort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoragePort for InMemoryStoragePort {
    async fn get_skill(&self, skill_id: &str) -> CoreResult<Skill> {
        self.tables.read().await.skills.get(skill_id).cloned().ok_or_else(|| CoreError::NotFound(format!("skill {skill_id}")))
    }

    async fn upsert_skill(&self, skill: &Skill) -> CoreResult<()> {
        self.tables.write().await.skills.insert(skill.id.clone(), skill.clone());
        Ok(())
    }

    async fn delete_skill(&self, skill_id: &str) -> CoreResult<()> {
        self.tables.write().await.skills.remove(skill_id);
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &str) -> CoreResult<Cluster> {
        self.tables.read().await.clusters.get(cluster_id).cloned().ok_or_else(|| CoreError::NotFound(format!("cluster {cluster_id}")))
    }

    async fn get_clusters_for_skill(&self, skill_id: &str) -> CoreResult<Vec<Cluster>> {
        Ok(self.tables.read().await.clusters.values().filter(|c| c.skill_id == skill_id).cloned().collect())
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> CoreResult<()> {
        self.tables.write().await.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn delete_cluster(&self, cluster_id: &str) -> CoreResult<()> {
        self.tables.write().await.clusters.remove(cluster_id);
        Ok(())
    }

    async fn increment_cluster_steps(&self, cluster_id: &str) -> CoreResult<()> {
        let mut tables = self.tables.write().await;
        let cluster = tables.clusters.get_mut(cluster_id).ok_or_else(|| CoreError::NotFound(format!("cluster {cluster_id}")))?;
        cluster.total_steps += 1;
        Ok(())
    }

    async fn get_arm(&self, arm_id: &str) -> CoreResult<Arm> {
        self.tables.read().await.arms.get(arm_id).cloned().ok_or_else(|| CoreError::NotFound(format!("arm {arm_id}")))
    }

    async fn get_arms_for_cluster(&self, cluster_id: &str) -> CoreResult<Vec<Arm>> {
        Ok(self.tables.read().await.arms.values().filter(|a| a.cluster_id == cluster_id).cloned().collect())
    }

    async fn upsert_arm(&self, arm: &Arm) -> CoreResult<()> {
        self.tables.write().await.arms.insert(arm.id.clone(), arm.clone());
        Ok(())
    }

    async fn delete_arm(&self, arm_id: &str) -> CoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.arms.remove(arm_id);
        tables.arm_stats.remove(arm_id);
        Ok(())
    }

    async fn get_arm_stat(&self, arm_id: &str) -> CoreResult<ArmStat> {
        Ok(self.tables.read().await.arm_stats.get(arm_id).copied().unwrap_or_default())
    }

    async fn cas_arm_stat(&self, arm_id: &str, expected_version: u64, new_stat: &ArmStat) -> CoreResult<()> {
        let mut tables = self.tables.write().await;
        let current = tables.arm_stats.get(arm_id).copied().unwrap_or_default();
        if current.version != expected_version {
            return Err(CoreError::ConflictingUpdate { entity: format!("arm_stat:{arm_id}") });
        }
        tables.arm_stats.insert(arm_id.to_string(), *new_stat);
        Ok(())
    }

    async fn reset_arm_stats(&self, arm_id: &str) -> CoreResult<()> {
        self.tables.write().await.arm_stats.insert(arm_id.to_string(), ArmStat::zero());
        Ok(())
    }

    async fn get_evaluations_for_skill(&self, skill_id: &str) -> CoreResult<Vec<Evaluation>> {
        Ok(self.tables.read().await.evaluations.get(skill_id).cloned().unwrap_or_default())
    }

    async fn replace_evaluations(&self, skill_id: &str, evaluations: &[Evaluation]) -> CoreResult<()> {
        self.tables.write().await.evaluations.insert(skill_id.to_string(), evaluations.to_vec());
        Ok(())
    }

    async fn upsert_log(&self, log: &Log) -> CoreResult<()> {
        self.tables.write().await.logs.insert(log.id.clone(), log.clone());
        Ok(())
    }

    async fn get_log(&self, log_id: &str) -> CoreResult<Log> {
        self.tables.read().await.logs.get(log_id).cloned().ok_or_else(|| CoreError::NotFound(format!("log {log_id}")))
    }

    async fn count_logs_with_embedding(&self, skill_id: &str) -> CoreResult<u64> {
        Ok(self.tables.read().await.logs.values().filter(|l| l.skill_id == skill_id && l.embedding.is_some()).count() as u64)
    }

    async fn get_logs_for_skill(
        &self,
        skill_id: &str,
        after_start_time: Option<DateTime<Utc>>,
        embedding_not_null: bool,
        limit: usize,
    ) -> CoreResult<Vec<Log>> {
        let tables = self.tables.read().await;
        let mut logs: Vec<Log> = tables
            .logs
            .values()
            .filter(|l| l.skill_id == skill_id)
            .filter(|l| !embedding_not_null || l.embedding.is_some())
            .filter(|l| after_start_time.map(|after| l.start_time > after).unwrap_or(true))
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.start_time);
        logs.truncate(limit);
        Ok(logs)
    }

    async fn append_evaluation_run(&self, run: &EvaluationRun) -> CoreResult<()> {
        self.tables.write().await.evaluation_runs.push(run.clone());
        Ok(())
    }

    async fn count_evaluation_runs_for_arm(&self, arm_id: &str) -> CoreResult<u64> {
        Ok(self.tables.read().await.evaluation_runs.iter().filter(|r| r.arm_id == arm_id).count() as u64)
    }

    async fn get_evaluation_runs_for_arm(&self, arm_id: &str) -> CoreResult<Vec<EvaluationRun>> {
        Ok(self.tables.read().await.evaluation_runs.iter().filter(|r| r.arm_id == arm_id).cloned().collect())
    }

    async fn try_acquire_lock(&self, skill_id: &str, purpose: LockPurpose, ttl_secs: u64, now: DateTime<Utc>) -> CoreResult<LockGrant> {
        let mut tables = self.tables.write().await;
        let skill = tables.skills.get_mut(skill_id).ok_or_else(|| CoreError::NotFound(format!("skill {skill_id}")))?;
        let lock = skill.lock_state_mut(purpose);

        if let Some(acquired_at) = lock.acquired_at {
            let elapsed = (now - acquired_at).num_seconds();
            if elapsed < ttl_secs as i64 {
                return Ok(LockGrant { acquired: false, fencing_token: lock.fencing_token.unwrap_or(0) });
            }
        }

        let token = self.next_token();
        lock.acquired_at = Some(now);
        lock.fencing_token = Some(token);
        Ok(LockGrant { acquired: true, fencing_token: token })
    }

    async fn release_lock(&self, skill_id: &str, purpose: LockPurpose, token: u64, updated_skill: &Skill) -> CoreResult<()> {
        let mut tables = self.tables.write().await;
        let current = tables.skills.get(skill_id).ok_or_else(|| CoreError::NotFound(format!("skill {skill_id}")))?;

        if current.lock_state(purpose).fencing_token != Some(token) {
            // Release does not match the current holder's token: ignored.
            return Ok(());
        }

        let mut next = updated_skill.clone();
        next.lock_state_mut(purpose).acquired_at = None;
        tables.skills.insert(skill_id.to_string(), next);
        Ok(())
    }
}
