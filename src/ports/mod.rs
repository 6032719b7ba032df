//! External interfaces (spec §6)
//!
//! Every collaborator outside the core — storage, the upstream LLM
//! provider, the judge LLM, the embedding model, and the event sink — is
//! reached exclusively through the traits in this module. Nothing in
//! `bandit`, `cluster_router`, `pipeline`, `evaluation`, `partitioning`, or
//! `reflection` names a concrete backend.

pub mod embedding;
pub mod events;
pub mod judge;
pub mod meta_prompt;
pub mod storage;
pub mod upstream;

pub use embedding::{EmbeddingPort, HttpEmbeddingPort};
pub use events::{EventBus, RuntimeEvent};
pub use judge::{HttpJudgePort, JudgeError, JudgePort, JudgeRequest, JudgeResponse};
pub use meta_prompt::{HttpMetaPromptPort, MetaPromptError, MetaPromptPort, RegeneratedEvaluation, SeedPromptExample};
pub use storage::{LockGrant, StoragePort};
pub use upstream::{HttpUpstreamPort, UpstreamPort, UpstreamRequest};
