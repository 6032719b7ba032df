//! Event Port (spec §6)
//!
//! A `tokio::sync::broadcast` pub/sub, shaped like the teacher's
//! `EventBus` (`orchestrator/event_bus.rs`) — but *not* its
//! `lazy_static!` global singleton. Design Note §9.4 is explicit that the
//! source has no true globals in its core and this crate must not
//! introduce one: the bus is constructed once in the composition root and
//! handed to every component that needs to publish, the same way the
//! storage port and LLM ports are injected.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// The five named events from spec §6. Ordering across events is not
/// guaranteed, matching the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RuntimeEvent {
    #[serde(rename = "skill-optimization:arm-selected")]
    ArmSelected { skill_id: String, cluster_id: String, arm_id: String },
    #[serde(rename = "evaluation-run-created")]
    EvaluationRunCreated { arm_id: String, log_id: String, reward: f64 },
    #[serde(rename = "evaluations-regenerated")]
    EvaluationsRegenerated { skill_id: String },
    #[serde(rename = "partitioning-completed")]
    PartitioningCompleted { skill_id: String, cluster_count: usize },
    #[serde(rename = "reflection-completed")]
    ReflectionCompleted { skill_id: String, cluster_id: String, arm_id: String },
}

pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Fire-and-forget publish. A send failing because there are no
    /// subscribers is not an error (spec §6: "fire-and-forget").
    pub fn publish(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
