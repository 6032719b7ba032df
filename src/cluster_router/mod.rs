//! Cluster Router (C4, spec §4.4)
//!
//! Nearest-centroid lookup with lazy default-cluster creation, grounded in
//! the teacher's `memory/vector.rs` nearest-neighbor search shape
//! (iterate, track minimum distance) generalized from cosine similarity
//! over memory entries to Euclidean distance over cluster centroids.

use crate::domain::{Arm, ArmParams, Cluster};
use crate::error::CoreResult;
use crate::ports::storage::StoragePort;
use std::sync::Arc;
use tracing::info;

pub struct ClusterRouter {
    storage: Arc<dyn StoragePort>,
}

impl ClusterRouter {
    pub fn new(storage: Arc<dyn StoragePort>) -> Self {
        Self { storage }
    }

    /// Routes `embedding` to a cluster of `skill_id`, creating a default
    /// cluster and its seeded arms if none exist yet (spec §4.4).
    ///
    /// Does not touch `total_steps` — the caller increments it only once
    /// the request's `Log` has actually been persisted, so a failed
    /// upstream call never bumps the counter without a matching log
    /// (spec §8 invariant).
    #[tracing::instrument(skip(self, embedding))]
    pub async fn route(
        &self,
        skill_id: &str,
        embedding: &[f32],
        configuration_count: u32,
        optimize: bool,
        default_system_prompt: &str,
        default_model_id: &str,
    ) -> CoreResult<Cluster> {
        let clusters = self.storage.get_clusters_for_skill(skill_id).await?;

        let cluster = if clusters.is_empty() {
            info!(skill_id, "no clusters exist, creating default cluster");
            let cluster = Cluster::new(skill_id, "default", embedding.to_vec());
            self.storage.upsert_cluster(&cluster).await?;

            let arm_count = if optimize { configuration_count } else { 1 };
            for i in 0..arm_count {
                let arm = Arm::new(
                    skill_id,
                    cluster.id.clone(),
                    format!("arm-{i}"),
                    ArmParams::seed(default_system_prompt, default_model_id),
                );
                self.storage.upsert_arm(&arm).await?;
                self.storage.reset_arm_stats(&arm.id).await?;
            }
            cluster
        } else {
            // Nearest centroid by Euclidean distance, ties broken by
            // smallest cluster id (spec §4.4).
            clusters
                .into_iter()
                .map(|c| {
                    let d = c.distance_to(embedding);
                    (c, d)
                })
                .min_by(|(a, da), (b, db)| da.partial_cmp(db).unwrap().then_with(|| a.id.cmp(&b.id)))
                .map(|(c, _)| c)
                .expect("clusters is non-empty")
        };

        Ok(cluster)
    }
}
