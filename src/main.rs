//! Composition root.
//!
//! Wires every port to a concrete adapter, starts the C6/C7/C8 worker loops
//! that drain the bounded channels C5 feeds, and drives one demo request
//! through [`pipeline::RequestPipeline`]. This binary is not the HTTP
//! routing layer (out of scope); it exists so the runtime can be exercised
//! end to end without a caller-facing server, the way the teacher's
//! `main.rs` is a composition root for its own supervisor loop.

use async_trait::async_trait;
use skill_optimizer::bandit::BanditCore;
use skill_optimizer::cluster_router::ClusterRouter;
use skill_optimizer::config::{init_tracing, RuntimeConfig};
use skill_optimizer::domain::{Skill, SkillConfig};
use skill_optimizer::error::CoreResult;
use skill_optimizer::evaluation::EvaluationRunner;
use skill_optimizer::lock::LockService;
use skill_optimizer::partitioning::PartitioningController;
use skill_optimizer::pipeline::{EvaluateMessage, ReflectionMessage, RequestPipeline, RunPartitioningMessage};
use skill_optimizer::ports::embedding::EmbeddingPort;
use skill_optimizer::ports::events::EventBus;
use skill_optimizer::ports::judge::{JudgeError, JudgePort, JudgeRequest, JudgeResponse};
use skill_optimizer::ports::meta_prompt::{MetaPromptError, MetaPromptPort, RegeneratedEvaluation, SeedPromptExample};
use skill_optimizer::ports::storage::StoragePort;
use skill_optimizer::ports::upstream::{UpstreamPort, UpstreamRequest};
use skill_optimizer::reflection::ReflectionController;
use skill_optimizer::storage::{InMemoryStoragePort, SqliteStoragePort};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const CHANNEL_CAPACITY: usize = 256;

/// Deterministic stand-in embedding port for local exercising: hashes the
/// input text into a fixed-dimension vector. Grounded in the teacher's
/// `SmartMockProvider` (`tests/e2e_scenarios.rs`) pattern of a
/// content-driven mock rather than a random one, so demo runs are
/// reproducible.
struct MockEmbeddingPort {
    dimensions: usize,
}

#[async_trait]
impl EmbeddingPort for MockEmbeddingPort {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let mut seed: u64 = 1469598103934665603;
        for byte in text.bytes() {
            seed ^= byte as u64;
            seed = seed.wrapping_mul(1099511628211);
        }
        Ok((0..self.dimensions)
            .map(|i| {
                let v = seed.wrapping_add(i as u64).wrapping_mul(2654435761);
                ((v % 2000) as f32 / 1000.0) - 1.0
            })
            .collect())
    }
}

/// Echoes the request body back with a marker, standing in for a live
/// provider.
struct MockUpstreamPort;

#[async_trait]
impl UpstreamPort for MockUpstreamPort {
    async fn invoke(&self, request: UpstreamRequest) -> CoreResult<serde_json::Value> {
        Ok(serde_json::json!({
            "model": request.model,
            "system_prompt": request.system_prompt,
            "echo": request.body,
        }))
    }
}

/// Always scores the midpoint; a deterministic stand-in judge.
struct MockJudgePort;

#[async_trait]
impl JudgePort for MockJudgePort {
    async fn judge(&self, _request: JudgeRequest) -> Result<JudgeResponse, JudgeError> {
        Ok(JudgeResponse { score: 0.75, reasoning: "mock judge".to_string(), metadata: serde_json::Value::Null })
    }
}

/// Returns a fixed evaluation set and a fixed seed prompt; a deterministic
/// stand-in for the meta-prompt LLM.
struct MockMetaPromptPort;

#[async_trait]
impl MetaPromptPort for MockMetaPromptPort {
    async fn regenerate_evaluations(&self, _skill_description: &str) -> Result<Vec<RegeneratedEvaluation>, MetaPromptError> {
        Ok(vec![RegeneratedEvaluation {
            params: skill_optimizer::domain::EvaluationParams::LlmRubric {
                rubric: "Is the response helpful and on-topic?".to_string(),
                judge_model: "mock-judge".to_string(),
            },
            weight: 1.0,
        }])
    }

    async fn regenerate_system_prompt(
        &self,
        skill_description: &str,
        _best_examples: &[SeedPromptExample],
        _worst_examples: &[SeedPromptExample],
    ) -> Result<String, MetaPromptError> {
        Ok(format!("You are assisting with: {skill_description}. Be concise and accurate."))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = RuntimeConfig::from_env();

    let storage: Arc<dyn StoragePort> = if config.storage_dsn == ":memory:" {
        Arc::new(InMemoryStoragePort::new())
    } else {
        Arc::new(SqliteStoragePort::new(config.storage_dsn.clone()).await?)
    };

    let embedding: Arc<dyn EmbeddingPort> = Arc::new(MockEmbeddingPort { dimensions: 16 });
    let upstream: Arc<dyn UpstreamPort> = Arc::new(MockUpstreamPort);
    let judge: Arc<dyn JudgePort> = Arc::new(MockJudgePort);
    let meta_prompt: Arc<dyn MetaPromptPort> = Arc::new(MockMetaPromptPort);

    let events = Arc::new(EventBus::new());
    let locks = Arc::new(LockService::new(storage.clone()));
    let bandit = Arc::new(BanditCore::new(storage.clone()));
    let cluster_router = Arc::new(ClusterRouter::new(storage.clone()));
    let evaluation_runner = Arc::new(EvaluationRunner::new(
        storage.clone(),
        judge,
        bandit.clone(),
        events.clone(),
        config.eval_concurrency_per_skill,
        config.eval_concurrency_global,
        Duration::from_secs(config.judge_timeout_secs),
        config.judge_retry_backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
    ));
    let partitioning = Arc::new(PartitioningController::new(storage.clone(), locks.clone(), events.clone(), config.optimize_lock_ttl_secs));
    let reflection = Arc::new(ReflectionController::new(storage.clone(), locks.clone(), events.clone(), meta_prompt, config.reflect_lock_ttl_secs));

    let (eval_tx, mut eval_rx) = mpsc::channel::<EvaluateMessage>(CHANNEL_CAPACITY);
    let (partition_tx, mut partition_rx) = mpsc::channel::<RunPartitioningMessage>(CHANNEL_CAPACITY);
    let (reflect_tx, mut reflect_rx) = mpsc::channel::<ReflectionMessage>(CHANNEL_CAPACITY);

    tokio::spawn({
        let runner = evaluation_runner.clone();
        async move {
            while let Some(msg) = eval_rx.recv().await {
                if let Err(e) = runner.evaluate(&msg.log, &msg.evaluations, msg.optimize).await {
                    warn!(error = %e, "evaluation task failed");
                }
            }
        }
    });

    tokio::spawn({
        let controller = partitioning.clone();
        async move {
            while let Some(msg) = partition_rx.recv().await {
                if let Err(e) = controller.run(&msg.skill_id).await {
                    warn!(error = %e, skill_id = %msg.skill_id, "partitioning run failed");
                }
            }
        }
    });

    tokio::spawn({
        let controller = reflection.clone();
        async move {
            while let Some(msg) = reflect_rx.recv().await {
                let result = match &msg {
                    ReflectionMessage::EarlyRegeneration { skill_id } => controller.run_early_regeneration(skill_id).await,
                    ReflectionMessage::Ongoing { skill_id, cluster_id } => controller.run_ongoing_reflection(skill_id, cluster_id).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "reflection task failed");
                }
            }
        }
    });

    let pipeline = RequestPipeline::new(storage.clone(), embedding, upstream, cluster_router, bandit, events, eval_tx, partition_tx, reflect_tx);

    let skill = Skill::new(
        "demo-agent",
        "greeter",
        SkillConfig {
            configuration_count: 3,
            clustering_interval: 50,
            reflection_min_requests_per_arm: 5,
            exploration_temperature: 1.0,
            allowed_template_variables: BTreeSet::from(["user_name".to_string()]),
            optimize: true,
        },
        "You are a friendly greeter.",
    );
    storage.upsert_skill(&skill).await?;

    let request_body = serde_json::json!({ "user_name": "Ada", "message": "hello" });
    let response = pipeline.handle_request(&skill, "demo-provider", "gpt-demo", request_body).await?;
    info!(response = %response, "handled demo request");

    // Give the spawned workers a beat to drain before exiting.
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}
