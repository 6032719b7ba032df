//! Skill-optimization runtime
//!
//! A contextual multi-armed bandit that routes LLM requests to per-cluster
//! configurations ("arms"), runs async LLM-as-judge evaluations, folds
//! composed rewards into bandit posteriors, periodically re-partitions the
//! embedding space, and reflects on outcomes to regenerate prompts. Every
//! external collaborator — storage, the upstream LLM, the judge LLM, the
//! embedding model, the meta-prompt LLM, the event sink — is reached
//! through a `#[async_trait]` port in [`ports`]; nothing in the core names a
//! concrete backend.

pub mod bandit;
pub mod cluster_router;
pub mod config;
pub mod domain;
pub mod error;
pub mod evaluation;
pub mod lock;
pub mod partitioning;
pub mod pipeline;
pub mod ports;
pub mod reflection;
pub mod storage;

pub use config::RuntimeConfig;
pub use error::{CoreError, CoreResult};
