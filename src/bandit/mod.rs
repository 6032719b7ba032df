//! Bandit Core (C3, spec §4.3)
//!
//! Thompson sampling over a cluster's arms, backed by `ArmStat`'s Welford
//! statistics. Grounded in the teacher's `agent/rl.rs::calculate_advantages`
//! for the statistics idiom (mean/variance folded from a reward stream) and
//! in `agent/provider.rs` for the "pick among alternatives" selection shape.

use crate::domain::{Arm, Evaluation};
use crate::error::{CoreError, CoreResult};
use crate::ports::storage::StoragePort;
use rand::Rng;
use std::sync::Arc;
use tracing::warn;

/// Draws one sample from `Normal(mean, std_dev)` via the Box-Muller
/// transform, using only the `rand` crate (no `rand_distr` dependency).
fn sample_normal(rng: &mut impl Rng, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std_dev * z0
}

/// Max attempts for the CAS retry loop on `ArmStat` updates (spec §4.3: "up
/// to 3 times with exponential backoff").
const CAS_MAX_ATTEMPTS: usize = 3;
const CAS_BACKOFF_MS: [u64; 3] = [50, 100, 200];

pub struct BanditCore {
    storage: Arc<dyn StoragePort>,
}

impl BanditCore {
    pub fn new(storage: Arc<dyn StoragePort>) -> Self {
        Self { storage }
    }

    /// Selects an arm for `arms`, all belonging to the same cluster,
    /// drawing posterior samples with the skill's `exploration_temperature`
    /// (spec §4.3 steps 1-3).
    #[tracing::instrument(skip(self, arms))]
    pub async fn select(&self, arms: &[Arm], exploration_temperature: f64, reflection_min_requests_per_arm: u64) -> CoreResult<Arm> {
        if arms.len() == 1 {
            return Ok(arms[0].clone());
        }

        let mut stats = Vec::with_capacity(arms.len());
        for arm in arms {
            stats.push(self.storage.get_arm_stat(&arm.id).await?);
        }

        // Step 2: warm-up floor. The least-pulled under-trained arm wins,
        // ties broken by earliest occurrence in `arms` (round-robin in the
        // caller's iteration order, since arms are presented in a stable
        // order from storage).
        if let Some((idx, _)) = stats
            .iter()
            .enumerate()
            .filter(|(_, s)| s.n < reflection_min_requests_per_arm)
            .min_by_key(|(_, s)| s.n)
        {
            return Ok(arms[idx].clone());
        }

        // Step 3: Thompson sampling argmax.
        let mut rng = rand::thread_rng();
        let mut best_idx = 0;
        let mut best_sample = f64::NEG_INFINITY;
        for (idx, stat) in stats.iter().enumerate() {
            let sigma = exploration_temperature * stat.posterior_variance().sqrt();
            let sample = if sigma > 0.0 { sample_normal(&mut rng, stat.mean, sigma) } else { stat.mean };
            if sample > best_sample {
                best_sample = sample;
                best_idx = idx;
            }
        }
        Ok(arms[best_idx].clone())
    }

    /// Folds `reward` into `arm_id`'s stats under the storage port's
    /// compare-and-swap contract, retrying on `ConflictingUpdate` (spec
    /// §4.3/§7.5).
    #[tracing::instrument(skip(self))]
    pub async fn record_reward(&self, arm_id: &str, reward: f64) -> CoreResult<()> {
        for (attempt, delay_ms) in CAS_BACKOFF_MS.iter().enumerate().take(CAS_MAX_ATTEMPTS) {
            let current = self.storage.get_arm_stat(arm_id).await?;
            let updated = current.with_reward(reward);
            match self.storage.cas_arm_stat(arm_id, current.version, &updated).await {
                Ok(()) => return Ok(()),
                Err(CoreError::ConflictingUpdate { .. }) => {
                    warn!(arm_id, attempt, "arm stat CAS conflict, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
        Err(CoreError::ConflictingUpdate { entity: format!("arm_stat:{arm_id}") })
    }
}

/// Composes a single reward from one or more evaluation scores and their
/// evaluations' weights (spec §4.3 "Reward composition"). Evaluations with
/// no corresponding score are dropped from both sums. Returns `None` if no
/// scores apply (all sums empty).
pub fn compose_reward(evaluations: &[Evaluation], scores: &[(String, f64)]) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    for evaluation in evaluations {
        if let Some((_, score)) = scores.iter().find(|(method, _)| method == evaluation.params.method()) {
            weighted_sum += evaluation.weight * score;
            weight_sum += evaluation.weight;
        }
    }
    if weight_sum <= 0.0 {
        return None;
    }
    Some((weighted_sum / weight_sum).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArmParams, ArmStat, EvaluationParams};
    use crate::storage::InMemoryStoragePort;
    use std::collections::HashSet;

    fn evaluation(method: EvaluationParams, weight: f64) -> Evaluation {
        Evaluation::new("skill-1", method, weight)
    }

    /// Builds `count` arms in one cluster, each warmed up to `n` pulls with
    /// the given mean and Welford `m2`, and registers them with `storage`.
    async fn seeded_arms(storage: &InMemoryStoragePort, means: &[f64], n: u64, m2: f64) -> Vec<Arm> {
        let mut arms = Vec::with_capacity(means.len());
        for (i, mean) in means.iter().enumerate() {
            let arm = Arm::new("skill-1", "cluster-1", format!("arm-{i}"), ArmParams::seed("prompt", "model"));
            storage.upsert_arm(&arm).await.unwrap();
            let stat = ArmStat { version: 0, n, mean: *mean, m2, total_reward: mean * n as f64 };
            storage.cas_arm_stat(&arm.id, 0, &stat).await.unwrap();
            arms.push(arm);
        }
        arms
    }

    /// Spec §8 boundary behavior: at `exploration_temperature = 0.1`, the
    /// highest-mean arm should be picked at least 90% of the time once all
    /// arms are warmed up and have well-separated means.
    #[tokio::test]
    async fn low_temperature_converges_to_highest_mean_arm() {
        let storage = InMemoryStoragePort::new();
        let arms = seeded_arms(&storage, &[0.9, 0.5, 0.1], 30, 5.0).await;
        let bandit = BanditCore::new(Arc::new(storage));
        let best_id = &arms[0].id;

        let trials = 200;
        let mut best_count = 0;
        for _ in 0..trials {
            let picked = bandit.select(&arms, 0.1, 1).await.unwrap();
            if &picked.id == best_id {
                best_count += 1;
            }
        }

        assert!(best_count as f64 / trials as f64 >= 0.9, "expected >=90% picks of the best arm, got {best_count}/{trials}");
    }

    /// Spec §8 boundary behavior: at `exploration_temperature = 10.0`, every
    /// arm should be sampled at least once over 100 trials even when their
    /// means are tied, since the sampling variance dominates.
    #[tokio::test]
    async fn high_temperature_explores_every_arm() {
        let storage = InMemoryStoragePort::new();
        let arms = seeded_arms(&storage, &[0.5, 0.5, 0.5], 30, 5.0).await;
        let bandit = BanditCore::new(Arc::new(storage));

        let mut seen = HashSet::new();
        for _ in 0..100 {
            let picked = bandit.select(&arms, 10.0, 1).await.unwrap();
            seen.insert(picked.id.clone());
        }

        assert_eq!(seen.len(), arms.len(), "expected every arm to be picked at least once, saw {seen:?}");
    }

    #[test]
    fn compose_reward_weights_and_clamps() {
        let evaluations = vec![
            evaluation(EvaluationParams::ExactMatch { reference: "ok".into() }, 1.0),
            evaluation(EvaluationParams::RegexMatch { pattern: "^ok$".into() }, 0.5),
        ];
        let scores = vec![("exact_match".to_string(), 1.0), ("regex_match".to_string(), 0.0)];
        let reward = compose_reward(&evaluations, &scores).unwrap();
        // (1.0*1.0 + 0.5*0.0) / (1.0 + 0.5) = 0.666...
        assert!((reward - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn compose_reward_drops_missing_scores() {
        let evaluations = vec![
            evaluation(EvaluationParams::ExactMatch { reference: "ok".into() }, 1.0),
            evaluation(EvaluationParams::RegexMatch { pattern: "^ok$".into() }, 1.0),
        ];
        let scores = vec![("exact_match".to_string(), 0.8)];
        let reward = compose_reward(&evaluations, &scores).unwrap();
        assert!((reward - 0.8).abs() < 1e-9);
    }

    #[test]
    fn compose_reward_none_when_nothing_applies() {
        let evaluations = vec![evaluation(EvaluationParams::ExactMatch { reference: "ok".into() }, 1.0)];
        assert!(compose_reward(&evaluations, &[]).is_none());
    }
}
