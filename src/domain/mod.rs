//! Domain model (spec §3)
//!
//! Plain data types with no storage- or provider-specific behavior attached.
//! Ownership: a `Skill` owns its `Cluster`s, a `Cluster` owns its `Arm`s, an
//! `Arm` owns its `ArmStat`. `Log`s and `EvaluationRun`s reference upward but
//! never mutate their parents directly — only `BanditCore`/`EvaluationRunner`
//! update paths do that.

mod arm;
mod arm_stat;
mod cluster;
mod evaluation;
mod evaluation_run;
mod log;
mod skill;

pub use arm::{Arm, ArmParams};
pub use arm_stat::ArmStat;
pub use cluster::Cluster;
pub use evaluation::{Evaluation, EvaluationParams};
pub use evaluation_run::{EvaluationRun, EvaluationScore};
pub use log::Log;
pub use skill::Skill;

/// Named purposes an advisory lock can be held for (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockPurpose {
    Optimize,
    Reflect,
}

impl LockPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            LockPurpose::Optimize => "OPTIMIZE",
            LockPurpose::Reflect => "REFLECT",
        }
    }
}

impl std::fmt::Display for LockPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generates a fresh entity id the way the teacher's `SqliteTaskQueue`
/// generates task ids.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
