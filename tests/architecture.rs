//! Architecture verification suite.
//!
//! Asserts `Send + Sync` on every port adapter and controller (spec §5's
//! concurrency model depends on all of them being safely shareable across
//! the worker pool). Grounded in the teacher's `tests/architecture.rs`
//! "anatomy" checks, generalized from tool/organ types to this crate's
//! ports and controllers.

#[cfg(test)]
mod architecture_tests {
    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn storage_adapters_are_thread_safe() {
        assert_send_sync::<skill_optimizer::storage::InMemoryStoragePort>();
        assert_send_sync::<skill_optimizer::storage::SqliteStoragePort>();
    }

    #[test]
    fn provider_adapters_are_thread_safe() {
        assert_send_sync::<skill_optimizer::ports::HttpUpstreamPort>();
        assert_send_sync::<skill_optimizer::ports::HttpJudgePort>();
        assert_send_sync::<skill_optimizer::ports::HttpEmbeddingPort>();
        assert_send_sync::<skill_optimizer::ports::HttpMetaPromptPort>();
        assert_send_sync::<skill_optimizer::ports::EventBus>();
    }

    #[test]
    fn controllers_are_thread_safe() {
        assert_send_sync::<skill_optimizer::bandit::BanditCore>();
        assert_send_sync::<skill_optimizer::cluster_router::ClusterRouter>();
        assert_send_sync::<skill_optimizer::evaluation::EvaluationRunner>();
        assert_send_sync::<skill_optimizer::partitioning::PartitioningController>();
        assert_send_sync::<skill_optimizer::reflection::ReflectionController>();
        assert_send_sync::<skill_optimizer::pipeline::RequestPipeline>();
        assert_send_sync::<skill_optimizer::lock::LockService>();
    }
}
