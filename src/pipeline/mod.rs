//! Request Pipeline (C5, spec §4.5)
//!
//! The only synchronous path in the runtime: embed, route, select, proxy
//! upstream, persist, return, and fire off C6/C7/C8 as bounded-channel
//! messages without awaiting them. Grounded in the teacher's
//! `Router::route` request-handling shape (`orchestrator/router.rs`) for
//! the embed-route-select-proxy sequence, and in `agent/background.rs` for
//! dispatching follow-up work onto bounded `tokio::sync::mpsc` channels
//! instead of inline `tokio::spawn` calls the caller would have to track.

use crate::bandit::BanditCore;
use crate::cluster_router::ClusterRouter;
use crate::domain::{Evaluation, Log, Skill};
use crate::error::CoreResult;
use crate::ports::embedding::EmbeddingPort;
use crate::ports::events::{EventBus, RuntimeEvent};
use crate::ports::storage::StoragePort;
use crate::ports::upstream::{UpstreamPort, UpstreamRequest};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Minimum embedded-log count that arms the one-shot early-regeneration
/// trigger (spec §4.5 "Early-regeneration trigger").
const EARLY_REGENERATION_THRESHOLD: u64 = 5;

/// Message sent to the C6 worker pool for one freshly-persisted log.
pub struct EvaluateMessage {
    pub log: Log,
    pub evaluations: Vec<Evaluation>,
    pub optimize: bool,
}

/// Message sent to the C7 worker for a skill whose log count has crossed
/// `clustering_interval` since the last partitioning run.
pub struct RunPartitioningMessage {
    pub skill_id: String,
}

/// Messages sent to the C8 worker: either the one-shot early regeneration,
/// or a periodic per-cluster reflection pass.
pub enum ReflectionMessage {
    EarlyRegeneration { skill_id: String },
    Ongoing { skill_id: String, cluster_id: String },
}

pub struct RequestPipeline {
    storage: Arc<dyn StoragePort>,
    embedding: Arc<dyn EmbeddingPort>,
    upstream: Arc<dyn UpstreamPort>,
    cluster_router: Arc<ClusterRouter>,
    bandit: Arc<BanditCore>,
    events: Arc<EventBus>,
    eval_tx: mpsc::Sender<EvaluateMessage>,
    partition_tx: mpsc::Sender<RunPartitioningMessage>,
    reflect_tx: mpsc::Sender<ReflectionMessage>,
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn StoragePort>,
        embedding: Arc<dyn EmbeddingPort>,
        upstream: Arc<dyn UpstreamPort>,
        cluster_router: Arc<ClusterRouter>,
        bandit: Arc<BanditCore>,
        events: Arc<EventBus>,
        eval_tx: mpsc::Sender<EvaluateMessage>,
        partition_tx: mpsc::Sender<RunPartitioningMessage>,
        reflect_tx: mpsc::Sender<ReflectionMessage>,
    ) -> Self {
        Self { storage, embedding, upstream, cluster_router, bandit, events, eval_tx, partition_tx, reflect_tx }
    }

    /// Handles one request against `skill` (spec §4.5 steps 1-7). `provider`
    /// and `default_model_id` identify which upstream backend/model a
    /// freshly-seeded cluster's arms should target; an already-routed
    /// cluster's arms carry their own `model_id`.
    #[tracing::instrument(skip(self, skill, request_body))]
    pub async fn handle_request(&self, skill: &Skill, provider: &str, default_model_id: &str, request_body: Value) -> CoreResult<Value> {
        let embed_text = request_body.to_string();
        let embedding = self.embedding.embed(&embed_text).await?;

        let cluster = self
            .cluster_router
            .route(&skill.id, &embedding, skill.config.configuration_count, skill.config.optimize, &skill.default_system_prompt, default_model_id)
            .await?;

        let arms = self.storage.get_arms_for_cluster(&cluster.id).await?;
        let arm = self.bandit.select(&arms, skill.config.exploration_temperature, skill.config.reflection_min_requests_per_arm as u64).await?;

        self.events.publish(RuntimeEvent::ArmSelected { skill_id: skill.id.clone(), cluster_id: cluster.id.clone(), arm_id: arm.id.clone() });

        let system_prompt = interpolate_template(&arm.params.system_prompt, &request_body, &skill.config.allowed_template_variables);
        let upstream_request = UpstreamRequest { provider: provider.to_string(), model: arm.params.model_id.clone(), system_prompt, body: request_body.clone() };
        // step 4: on upstream failure, propagate without touching arm stats
        // or persisting a log.
        let response_body = self.upstream.invoke(upstream_request).await?;

        let start_time = Utc::now();
        let log = Log::new(skill.id.clone(), cluster.id.clone(), arm.id.clone(), request_body, response_body.clone(), Some(embedding), start_time);
        self.storage.upsert_log(&log).await?;
        // Only now has a log been durably recorded for this cluster, so
        // only now is it safe to bump total_steps (spec §8: "Sum of
        // cluster.total_steps across a skill's clusters = count of logs for
        // that skill" must hold even when the upstream call above fails).
        self.storage.increment_cluster_steps(&cluster.id).await?;

        self.dispatch_followups(skill, &cluster.id, &log).await?;

        Ok(response_body)
    }

    /// Enqueues C6 unconditionally, plus C7/C8 when their trigger
    /// conditions are met (spec §4.5 "Early-regeneration trigger" /
    /// "Periodic partitioning trigger"). Every send is fire-and-forget:
    /// this method never awaits C6/C7/C8 themselves, only the bounded
    /// channel send.
    async fn dispatch_followups(&self, skill: &Skill, cluster_id: &str, log: &Log) -> CoreResult<()> {
        let evaluations = self.storage.get_evaluations_for_skill(&skill.id).await?;
        if self
            .eval_tx
            .try_send(EvaluateMessage { log: log.clone(), evaluations, optimize: skill.config.optimize })
            .is_err()
        {
            warn!(skill_id = %skill.id, "evaluation queue full, dropping evaluation for this log");
        }

        if skill.evaluations_regenerated_at.is_none() {
            let embedded_count = self.storage.count_logs_with_embedding(&skill.id).await?;
            if embedded_count >= EARLY_REGENERATION_THRESHOLD {
                if self.reflect_tx.try_send(ReflectionMessage::EarlyRegeneration { skill_id: skill.id.clone() }).is_err() {
                    warn!(skill_id = %skill.id, "reflection queue full, dropping early-regeneration trigger");
                }
            }
        }

        let since = skill.last_clustering_log_start_time;
        let interval = skill.config.clustering_interval as usize;
        let recent = self.storage.get_logs_for_skill(&skill.id, since, true, interval).await?;
        if recent.len() >= interval {
            if self.partition_tx.try_send(RunPartitioningMessage { skill_id: skill.id.clone() }).is_err() {
                warn!(skill_id = %skill.id, "partitioning queue full, dropping partitioning trigger");
            }
        }

        if skill.config.optimize {
            let arms = self.storage.get_arms_for_cluster(cluster_id).await?;
            let mut all_warmed_up = !arms.is_empty();
            for arm in &arms {
                let stat = self.storage.get_arm_stat(&arm.id).await?;
                if stat.n < skill.config.reflection_min_requests_per_arm as u64 {
                    all_warmed_up = false;
                    break;
                }
            }
            if all_warmed_up {
                if self
                    .reflect_tx
                    .try_send(ReflectionMessage::Ongoing { skill_id: skill.id.clone(), cluster_id: cluster_id.to_string() })
                    .is_err()
                {
                    warn!(skill_id = %skill.id, cluster_id, "reflection queue full, dropping ongoing-reflection trigger");
                }
            }
        }

        info!(skill_id = %skill.id, cluster_id, arm_id = %log.arm_id, "request handled");
        Ok(())
    }
}

/// Substitutes `{{var}}` placeholders in `template` with the matching
/// top-level field of `request_body`, restricted to `allowed_vars` (spec
/// §4.5 step 4: "with allowed template variables interpolated"). A
/// placeholder whose variable is not in `allowed_vars`, or whose field is
/// absent from the request body, is left unsubstituted.
fn interpolate_template(template: &str, request_body: &Value, allowed_vars: &std::collections::BTreeSet<String>) -> String {
    let mut result = template.to_string();
    for var in allowed_vars {
        let placeholder = format!("{{{{{var}}}}}");
        if !result.contains(&placeholder) {
            continue;
        }
        let Some(value) = request_body.get(var) else { continue };
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        result = result.replace(&placeholder, &rendered);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn interpolate_template_substitutes_allowed_vars_only() {
        let mut allowed = BTreeSet::new();
        allowed.insert("name".to_string());

        let body = serde_json::json!({"name": "Ada", "secret": "nope"});
        let rendered = interpolate_template("Hello {{name}}, id {{secret}}", &body, &allowed);
        assert_eq!(rendered, "Hello Ada, id {{secret}}");
    }

    #[test]
    fn interpolate_template_leaves_missing_fields_untouched() {
        let mut allowed = BTreeSet::new();
        allowed.insert("missing".to_string());
        let body = serde_json::json!({});
        let rendered = interpolate_template("value: {{missing}}", &body, &allowed);
        assert_eq!(rendered, "value: {{missing}}");
    }
}
