//! Evaluation Runner (C6, spec §4.6)
//!
//! Runs every active `Evaluation` for a skill against one `Log` in
//! parallel, bounded by per-skill and process-wide semaphores. Grounded in
//! the teacher's `agent/background.rs` bounded-worker-pool shape and
//! `agent/provider.rs`'s retry/backoff loop, generalized from provider
//! calls to judge calls and from string-matched retry conditions to the
//! typed `ProviderErrorKind` discriminator (Design Note §9.5).

use crate::bandit::{compose_reward, BanditCore};
use crate::domain::{Evaluation, EvaluationRun, EvaluationScore, Log};
use crate::error::CoreResult;
use crate::ports::events::{EventBus, RuntimeEvent};
use crate::ports::judge::{JudgeError, JudgePort, JudgeRequest};
use crate::ports::storage::StoragePort;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, warn};

pub struct EvaluationRunner {
    storage: Arc<dyn StoragePort>,
    judge: Arc<dyn JudgePort>,
    bandit: Arc<BanditCore>,
    events: Arc<EventBus>,
    per_skill_concurrency: usize,
    global_semaphore: Arc<Semaphore>,
    judge_timeout: Duration,
    judge_retry_backoff: Vec<Duration>,
}

impl EvaluationRunner {
    pub fn new(
        storage: Arc<dyn StoragePort>,
        judge: Arc<dyn JudgePort>,
        bandit: Arc<BanditCore>,
        events: Arc<EventBus>,
        per_skill_concurrency: usize,
        global_concurrency: usize,
        judge_timeout: Duration,
        judge_retry_backoff: Vec<Duration>,
    ) -> Self {
        Self {
            storage,
            judge,
            bandit,
            events,
            per_skill_concurrency,
            global_semaphore: Arc::new(Semaphore::new(global_concurrency)),
            judge_timeout,
            judge_retry_backoff,
        }
    }

    /// Evaluates `log` against every active `evaluations` for its skill,
    /// composes the reward, appends an `EvaluationRun`, and (unless
    /// `optimize` is false — spec §8 boundary behavior) updates the
    /// selected arm's `ArmStat`.
    #[tracing::instrument(skip(self, evaluations, log))]
    pub async fn evaluate(&self, log: &Log, evaluations: &[Evaluation], optimize: bool) -> CoreResult<()> {
        let per_skill = Arc::new(Semaphore::new(self.per_skill_concurrency));
        let mut tasks = Vec::with_capacity(evaluations.len());

        for evaluation in evaluations {
            let per_skill = per_skill.clone();
            let global = self.global_semaphore.clone();
            let judge = self.judge.clone();
            let evaluation = evaluation.clone();
            let request_body = log.request_body.clone();
            let response_body = log.response_body.clone();
            let timeout = self.judge_timeout;
            let backoff = self.judge_retry_backoff.clone();

            tasks.push(tokio::spawn(async move {
                let _skill_permit = per_skill.acquire_owned().await.expect("semaphore not closed");
                let _global_permit = global.acquire_owned().await.expect("semaphore not closed");
                run_one_judge(judge.as_ref(), &evaluation, &request_body, &response_body, timeout, &backoff).await
            }));
        }

        let mut scores = Vec::with_capacity(tasks.len());
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(score) => {
                    scores.push((score.method.clone(), score.score));
                    results.push(score);
                }
                Err(join_err) => {
                    error!(error = %join_err, "evaluation task panicked");
                }
            }
        }

        let reward = compose_reward(evaluations, &scores).unwrap_or(0.0);
        let run = EvaluationRun::new(log.id.clone(), log.arm_id.clone(), log.cluster_id.clone(), results, reward);
        self.storage.append_evaluation_run(&run).await?;

        if optimize {
            if let Err(e) = self.bandit.record_reward(&log.arm_id, reward).await {
                warn!(arm_id = %log.arm_id, error = %e, "dropping reward after exhausting CAS retries");
            }
        }

        self.events.publish(RuntimeEvent::EvaluationRunCreated {
            arm_id: log.arm_id.clone(),
            log_id: log.id.clone(),
            reward,
        });

        Ok(())
    }
}

/// Calls the judge for a single evaluation with timeout + retry (spec
/// §4.6/§7.3). Non-retryable failures, and retryable failures that exhaust
/// the backoff schedule, degrade to the fallback score of `0.5`.
async fn run_one_judge(
    judge: &dyn JudgePort,
    evaluation: &Evaluation,
    request_body: &serde_json::Value,
    response_body: &serde_json::Value,
    timeout: Duration,
    backoff: &[Duration],
) -> EvaluationScore {
    let request = JudgeRequest {
        system_prompt: judge_system_prompt(evaluation),
        user_prompt: format!("Request:\n{request_body}\n\nResponse:\n{response_body}"),
    };

    let mut last_err: Option<JudgeError> = None;
    let attempts = backoff.len() + 1;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff[attempt - 1]).await;
        }

        let call = tokio::time::timeout(timeout, judge.judge(request.clone()));
        match call.await {
            Ok(Ok(response)) => {
                return EvaluationScore {
                    method: evaluation.params.method().to_string(),
                    score: response.score.clamp(0.0, 1.0),
                    reasoning: response.reasoning,
                    fallback: false,
                };
            }
            Ok(Err(e)) => {
                let retryable = e.kind.is_retryable();
                last_err = Some(e);
                if !retryable {
                    break;
                }
            }
            Err(_elapsed) => {
                warn!(method = evaluation.params.method(), attempt, "judge call timed out");
                last_err = Some(JudgeError { message: "judge call timed out".to_string(), kind: crate::error::ProviderErrorKind::Timeout });
            }
        }
    }

    let message = last_err.map(|e| e.message).unwrap_or_else(|| "judge call failed".to_string());
    warn!(method = evaluation.params.method(), message, "judge exhausted retries, falling back to 0.5");
    EvaluationScore {
        method: evaluation.params.method().to_string(),
        score: 0.5,
        reasoning: message,
        fallback: true,
    }
}

fn judge_system_prompt(evaluation: &Evaluation) -> String {
    match &evaluation.params {
        crate::domain::EvaluationParams::LlmRubric { rubric, .. } => format!("Score the response against this rubric: {rubric}"),
        crate::domain::EvaluationParams::ExactMatch { reference } => format!("Score 1.0 if the response exactly matches: {reference}, else 0.0."),
        crate::domain::EvaluationParams::RegexMatch { pattern } => format!("Score 1.0 if the response matches the pattern: {pattern}, else 0.0."),
        crate::domain::EvaluationParams::Other { method, .. } => format!("Evaluate the response using method: {method}"),
    }
}
