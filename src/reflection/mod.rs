//! Reflection Controller (C8, spec §4.8)
//!
//! Two modes, both gated by the REFLECT lock and both driving a system
//! prompt rewrite through `MetaPromptPort`: a one-shot early regeneration
//! triggered the first time a skill accumulates 5 embedded logs, and an
//! ongoing per-cluster reflection that periodically rewrites each arm's
//! prompt from its best/worst-scoring logs. Grounded in the lock
//! acquire/double-check/release shape already established by C7
//! (`partitioning/mod.rs`), itself grounded in the teacher's
//! `SqliteTaskQueue::dequeue` idiom.

use crate::domain::{Evaluation, LockPurpose, Skill};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockService;
use crate::ports::events::{EventBus, RuntimeEvent};
use crate::ports::meta_prompt::{MetaPromptPort, SeedPromptExample};
use crate::ports::storage::StoragePort;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// How many of an arm's lowest-reward logs are shown to the meta-prompt LLM
/// as "documented failures" during ongoing reflection (spec §4.8 step 2).
const WORST_EXAMPLE_COUNT: usize = 3;

/// Logs drawn as *examples* for the one-shot early regeneration call (spec
/// §4.8 step 2).
const EARLY_REGENERATION_EXAMPLE_COUNT: usize = 5;

pub struct ReflectionController {
    storage: Arc<dyn StoragePort>,
    locks: Arc<LockService>,
    events: Arc<EventBus>,
    meta_prompt: Arc<dyn MetaPromptPort>,
    lock_ttl_secs: u64,
}

impl ReflectionController {
    pub fn new(storage: Arc<dyn StoragePort>, locks: Arc<LockService>, events: Arc<EventBus>, meta_prompt: Arc<dyn MetaPromptPort>, lock_ttl_secs: u64) -> Self {
        Self { storage, locks, events, meta_prompt, lock_ttl_secs }
    }

    /// Early regeneration (spec §4.8): one-shot per skill. A no-op if
    /// `evaluations_regenerated_at` is already set, which the double-check
    /// inside `acquire_with_double_check` enforces.
    #[tracing::instrument(skip(self))]
    pub async fn run_early_regeneration(&self, skill_id: &str) -> CoreResult<()> {
        let guard = self
            .locks
            .acquire_with_double_check(skill_id, LockPurpose::Reflect, self.lock_ttl_secs, |skill| skill.evaluations_regenerated_at.is_none())
            .await?;
        let Some(guard) = guard else {
            return Ok(());
        };

        let result = self.run_early_regeneration_locked(skill_id).await;
        match result {
            Ok(updated_skill) => {
                self.locks.release(guard, &updated_skill).await?;
            }
            Err(e) => {
                warn!(skill_id, error = %e, "early regeneration aborted, releasing lock unchanged");
                self.locks.release_unchanged(guard).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_early_regeneration_locked(&self, skill_id: &str) -> CoreResult<Skill> {
        let skill = self.storage.get_skill(skill_id).await?;

        let seed_logs = self.storage.get_logs_for_skill(skill_id, None, true, EARLY_REGENERATION_EXAMPLE_COUNT).await?;
        let examples: Vec<SeedPromptExample> = seed_logs.iter().map(|l| SeedPromptExample { request: l.request_body.to_string(), response: l.response_body.to_string() }).collect();
        let skill_description = format!("Skill '{}' (agent {})", skill.name, skill.agent_id);

        let (evaluations_result, prompt_result) =
            tokio::join!(self.meta_prompt.regenerate_evaluations(&skill_description), self.meta_prompt.regenerate_system_prompt(&skill_description, &examples, &[]));
        let regenerated = evaluations_result.map_err(|e| CoreError::JudgeFailure(e.message))?;
        let new_system_prompt = prompt_result.map_err(|e| CoreError::JudgeFailure(e.message))?;

        let existing = self.storage.get_evaluations_for_skill(skill_id).await?;
        let mut by_method: HashMap<String, Evaluation> = existing.into_iter().map(|e| (e.params.method().to_string(), e)).collect();

        let mut next_evaluations = Vec::with_capacity(regenerated.len());
        for regen in regenerated {
            let method = regen.params.method().to_string();
            if let Some(mut matched) = by_method.remove(&method) {
                matched.params = regen.params;
                matched.weight = regen.weight.clamp(0.0, 1.0);
                matched.updated_at = Utc::now();
                next_evaluations.push(matched);
            } else {
                next_evaluations.push(Evaluation::new(skill_id, regen.params, regen.weight));
            }
        }
        // Evaluations present in the old set but absent from the regenerated
        // one are left untouched (spec §4.8 step 4 only names evaluations
        // "matched by method").
        next_evaluations.extend(by_method.into_values());
        self.storage.replace_evaluations(skill_id, &next_evaluations).await?;

        let clusters = self.storage.get_clusters_for_skill(skill_id).await?;
        for cluster in &clusters {
            let arms = self.storage.get_arms_for_cluster(&cluster.id).await?;
            for mut arm in arms {
                arm.params.system_prompt = new_system_prompt.clone();
                arm.updated_at = Utc::now();
                self.storage.upsert_arm(&arm).await?;
                self.storage.reset_arm_stats(&arm.id).await?;
            }

            let mut reset_cluster = cluster.clone();
            reset_cluster.total_steps = 0;
            reset_cluster.updated_at = Utc::now();
            self.storage.upsert_cluster(&reset_cluster).await?;
        }

        let mut updated_skill = skill.clone();
        updated_skill.default_system_prompt = new_system_prompt;
        updated_skill.evaluations_regenerated_at = Some(Utc::now());
        updated_skill.updated_at = Utc::now();

        self.events.publish(RuntimeEvent::EvaluationsRegenerated { skill_id: skill_id.to_string() });
        info!(skill_id, cluster_count = clusters.len(), "early regeneration complete");

        Ok(updated_skill)
    }

    /// Ongoing reflection (spec §4.8): per cluster, periodic. A no-op if any
    /// arm in the cluster hasn't reached `reflection_min_requests_per_arm`
    /// pulls yet.
    #[tracing::instrument(skip(self))]
    pub async fn run_ongoing_reflection(&self, skill_id: &str, cluster_id: &str) -> CoreResult<()> {
        let guard = self.locks.acquire_with_double_check(skill_id, LockPurpose::Reflect, self.lock_ttl_secs, |_| true).await?;
        let Some(guard) = guard else {
            return Ok(());
        };

        let result = self.run_ongoing_reflection_locked(skill_id, cluster_id).await;
        match result {
            Ok(updated_skill) => {
                self.locks.release(guard, &updated_skill).await?;
            }
            Err(e) => {
                warn!(skill_id, cluster_id, error = %e, "ongoing reflection aborted, releasing lock unchanged");
                self.locks.release_unchanged(guard).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_ongoing_reflection_locked(&self, skill_id: &str, cluster_id: &str) -> CoreResult<Skill> {
        let skill = self.storage.get_skill(skill_id).await?;
        let arms = self.storage.get_arms_for_cluster(cluster_id).await?;

        for arm in &arms {
            let stat = self.storage.get_arm_stat(&arm.id).await?;
            if stat.n < skill.config.reflection_min_requests_per_arm as u64 {
                info!(skill_id, cluster_id, arm_id = %arm.id, n = stat.n, "arm below warm-up floor, skipping reflection this round");
                return Ok(skill);
            }
        }

        let skill_description = format!("Skill '{}' (agent {})", skill.name, skill.agent_id);

        for arm in &arms {
            let (best, worst) = self.best_and_worst_examples(&arm.id).await?;
            if best.is_empty() && worst.is_empty() {
                continue;
            }

            let new_prompt = self
                .meta_prompt
                .regenerate_system_prompt(&skill_description, &best, &worst)
                .await
                .map_err(|e| CoreError::JudgeFailure(e.message))?;

            let mut updated_arm = arm.clone();
            updated_arm.params.system_prompt = new_prompt;
            updated_arm.updated_at = Utc::now();
            self.storage.upsert_arm(&updated_arm).await?;
            self.storage.reset_arm_stats(&arm.id).await?;

            self.events.publish(RuntimeEvent::ReflectionCompleted { skill_id: skill_id.to_string(), cluster_id: cluster_id.to_string(), arm_id: arm.id.clone() });
        }

        info!(skill_id, cluster_id, arm_count = arms.len(), "ongoing reflection complete");
        Ok(skill)
    }

    /// Ranks `arm_id`'s evaluation runs by reward and resolves the top-1 and
    /// bottom-`WORST_EXAMPLE_COUNT` runs' logs into prompt examples (spec
    /// §4.8 step 2).
    async fn best_and_worst_examples(&self, arm_id: &str) -> CoreResult<(Vec<SeedPromptExample>, Vec<SeedPromptExample>)> {
        let mut runs = self.storage.get_evaluation_runs_for_arm(arm_id).await?;
        if runs.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        runs.sort_by(|a, b| a.reward.partial_cmp(&b.reward).unwrap());

        let worst_ids: Vec<&str> = runs.iter().take(WORST_EXAMPLE_COUNT).map(|r| r.log_id.as_str()).collect();
        let best_id = runs.last().map(|r| r.log_id.as_str());

        let mut best = Vec::new();
        if let Some(id) = best_id {
            if let Ok(log) = self.storage.get_log(id).await {
                best.push(SeedPromptExample { request: log.request_body.to_string(), response: log.response_body.to_string() });
            }
        }

        let mut worst = Vec::with_capacity(worst_ids.len());
        for id in worst_ids {
            if Some(id) == best_id {
                continue;
            }
            if let Ok(log) = self.storage.get_log(id).await {
                worst.push(SeedPromptExample { request: log.request_body.to_string(), response: log.response_body.to_string() });
            }
        }

        Ok((best, worst))
    }
}
