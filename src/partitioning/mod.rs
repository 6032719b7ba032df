//! Partitioning Controller (C7, spec §4.7)

mod kmeans;

use crate::domain::{Arm, ArmParams, Cluster, LockPurpose, Skill};
use crate::error::CoreResult;
use crate::lock::LockService;
use crate::ports::events::{EventBus, RuntimeEvent};
use crate::ports::storage::StoragePort;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Safety cap on how many logs a single partitioning run will fetch, so a
/// skill with runaway traffic can't make C7 scan an unbounded table.
const LOG_FETCH_CAP: usize = 10_000;

pub struct PartitioningController {
    storage: Arc<dyn StoragePort>,
    locks: Arc<LockService>,
    events: Arc<EventBus>,
    lock_ttl_secs: u64,
}

impl PartitioningController {
    pub fn new(storage: Arc<dyn StoragePort>, locks: Arc<LockService>, events: Arc<EventBus>, lock_ttl_secs: u64) -> Self {
        Self { storage, locks, events, lock_ttl_secs }
    }

    /// Re-partitions `skill_id`'s embedding space (spec §4.7). A no-op
    /// (other than lock bookkeeping) if fewer than `clustering_interval`
    /// new logs are available, or if `optimize` is false.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, skill_id: &str) -> CoreResult<()> {
        let skill = self.storage.get_skill(skill_id).await?;
        if !skill.config.optimize {
            return Ok(());
        }

        let guard = self
            .locks
            .acquire_with_double_check(skill_id, LockPurpose::Optimize, self.lock_ttl_secs, |_| true)
            .await?;
        let Some(guard) = guard else {
            return Ok(());
        };

        let result = self.run_locked(&skill).await;
        match result {
            Ok(updated_skill) => {
                self.locks.release(guard, &updated_skill).await?;
            }
            Err(e) => {
                warn!(skill_id, error = %e, "partitioning aborted, releasing lock unchanged");
                self.locks.release_unchanged(guard).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_locked(&self, skill: &Skill) -> CoreResult<Skill> {
        let k = skill.config.configuration_count as usize;

        let logs = self
            .storage
            .get_logs_for_skill(&skill.id, skill.last_clustering_log_start_time, true, LOG_FETCH_CAP)
            .await?;

        if logs.len() < skill.config.clustering_interval as usize {
            info!(skill_id = %skill.id, count = logs.len(), "not enough new logs to partition yet");
            return Ok(skill.clone());
        }

        let points: Vec<Vec<f32>> = logs.iter().filter_map(|l| l.embedding.clone()).collect();
        let max_start_time = logs.iter().map(|l| l.start_time).max();

        let mut rng = rand::thread_rng();
        let new_centroids = kmeans::kmeans(&points, k, &mut rng);

        let existing_clusters = self.storage.get_clusters_for_skill(&skill.id).await?;
        let (bindings, unmatched_centroids) = greedy_match(&existing_clusters, &new_centroids);

        for (cluster_idx, centroid_idx) in bindings {
            let mut cluster = existing_clusters[cluster_idx].clone();
            cluster.centroid = new_centroids[centroid_idx].clone();
            cluster.updated_at = Utc::now();
            self.storage.upsert_cluster(&cluster).await?;
        }

        // Spec §3: "the number of clusters for a skill equals
        // `configuration_count` after the first partitioning." The first
        // partition only has one (default) existing cluster to match
        // against K new centroids, so every unmatched new centroid needs a
        // freshly-seeded cluster (spec §4.4 seeding protocol) rather than
        // being dropped.
        let seed_arms = self.seed_arm_template(&existing_clusters).await?;
        let mut new_cluster_count = 0usize;
        for centroid_idx in unmatched_centroids {
            let cluster = Cluster::new(&skill.id, format!("cluster-{}", existing_clusters.len() + new_cluster_count), new_centroids[centroid_idx].clone());
            self.storage.upsert_cluster(&cluster).await?;
            for i in 0..skill.config.configuration_count {
                let arm = Arm::new(&skill.id, cluster.id.clone(), format!("arm-{i}"), seed_arms.clone());
                self.storage.upsert_arm(&arm).await?;
                self.storage.reset_arm_stats(&arm.id).await?;
            }
            new_cluster_count += 1;
        }

        let mut updated = skill.clone();
        updated.last_clustering_at = Some(Utc::now());
        if let Some(max_start_time) = max_start_time {
            updated.last_clustering_log_start_time = Some(max_start_time);
        }
        updated.updated_at = Utc::now();

        self.events.publish(RuntimeEvent::PartitioningCompleted {
            skill_id: skill.id.clone(),
            cluster_count: existing_clusters.len() + new_cluster_count,
        });

        Ok(updated)
    }

    /// Picks an `ArmParams` template for newly-grown clusters (spec §4.4
    /// seeding protocol), copied from an arbitrary arm of an already
    /// existing cluster so growth clusters start with the same
    /// system_prompt/model_id the rest of the skill is using, rather than
    /// needing a `default_model_id` this controller has no way to know.
    async fn seed_arm_template(&self, existing_clusters: &[Cluster]) -> CoreResult<ArmParams> {
        for cluster in existing_clusters {
            if let Some(arm) = self.storage.get_arms_for_cluster(&cluster.id).await?.into_iter().next() {
                return Ok(arm.params);
            }
        }
        Ok(ArmParams::seed("", ""))
    }
}

/// Greedy closest-pair matching (spec §4.7 step 4): for each existing
/// cluster in order, bind it to the closest unmatched new centroid. This
/// preserves cluster (and therefore arm/stat) identity across
/// re-partitioning. Clusters left over when there are fewer new centroids
/// than existing clusters keep their prior centroid (no binding emitted).
/// The second return value is every new-centroid index nothing bound to —
/// on the first partition (one existing cluster, K new centroids) these are
/// the K-1 centroids the caller must grow fresh clusters for (spec §3).
fn greedy_match(existing: &[crate::domain::Cluster], new_centroids: &[Vec<f32>]) -> (Vec<(usize, usize)>, Vec<usize>) {
    let mut unmatched: Vec<usize> = (0..new_centroids.len()).collect();
    let mut bindings = Vec::with_capacity(existing.len());

    for (cluster_idx, cluster) in existing.iter().enumerate() {
        if unmatched.is_empty() {
            break;
        }
        let (pos, &centroid_idx) = unmatched
            .iter()
            .enumerate()
            .min_by(|(_, &a), (_, &b)| {
                let da = cluster.distance_to(&new_centroids[a]);
                let db = cluster.distance_to(&new_centroids[b]);
                da.partial_cmp(&db).unwrap()
            })
            .expect("unmatched is non-empty");
        unmatched.remove(pos);
        bindings.push((cluster_idx, centroid_idx));
    }

    (bindings, unmatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Cluster;

    #[test]
    fn greedy_match_preserves_closest_pairing() {
        let clusters = vec![
            Cluster::new("skill-1", "a", vec![0.0, 0.0]),
            Cluster::new("skill-1", "b", vec![10.0, 10.0]),
        ];
        let new_centroids = vec![vec![10.2, 9.8], vec![0.1, -0.1]];

        let (bindings, unmatched) = greedy_match(&clusters, &new_centroids);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0], (0, 1));
        assert_eq!(bindings[1], (1, 0));
        assert!(unmatched.is_empty());
    }

    #[test]
    fn greedy_match_leaves_extra_clusters_unbound() {
        let clusters = vec![Cluster::new("skill-1", "a", vec![0.0, 0.0]), Cluster::new("skill-1", "b", vec![10.0, 10.0])];
        let new_centroids = vec![vec![0.0, 0.0]];

        let (bindings, unmatched) = greedy_match(&clusters, &new_centroids);
        assert_eq!(bindings, vec![(0, 0)]);
        assert!(unmatched.is_empty());
    }
}
