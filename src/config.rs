//! Runtime configuration
//!
//! Loaded from the environment the way the teacher's `AgencyConfig` is —
//! `dotenv::dotenv().ok()` followed by plain `std::env` reads, with
//! defaults that make the crate runnable with zero configuration.

use std::env;

/// Process-wide knobs that are not per-skill (those live on `Skill`).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// SQLite DSN for `SqliteStoragePort`. `:memory:` is valid for tests.
    pub storage_dsn: String,
    /// Per-skill concurrency cap for the evaluation runner (§5).
    pub eval_concurrency_per_skill: usize,
    /// Process-wide concurrency cap for the evaluation runner (§5).
    pub eval_concurrency_global: usize,
    /// TTL for the OPTIMIZE lock purpose (§4.2).
    pub optimize_lock_ttl_secs: u64,
    /// TTL for the REFLECT lock purpose (§4.2).
    pub reflect_lock_ttl_secs: u64,
    /// Per-call judge timeout (§4.6).
    pub judge_timeout_secs: u64,
    /// Retry backoff schedule for judge calls, in seconds (§4.6).
    pub judge_retry_backoff_secs: Vec<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage_dsn: "skill_optimizer.sqlite3".to_string(),
            eval_concurrency_per_skill: 10,
            eval_concurrency_global: 100,
            optimize_lock_ttl_secs: 10 * 60,
            reflect_lock_ttl_secs: 5 * 60,
            judge_timeout_secs: 30,
            judge_retry_backoff_secs: vec![1, 2, 4],
        }
    }
}

impl RuntimeConfig {
    /// Load from the environment, falling back to defaults for anything
    /// unset. Mirrors the teacher's `dotenv::dotenv().ok()` + `AgencyConfig`
    /// pattern in `main.rs`.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();
        Self {
            storage_dsn: env::var("SKILL_OPT_STORAGE_DSN").unwrap_or(defaults.storage_dsn),
            eval_concurrency_per_skill: env_usize(
                "SKILL_OPT_EVAL_CONCURRENCY_PER_SKILL",
                defaults.eval_concurrency_per_skill,
            ),
            eval_concurrency_global: env_usize(
                "SKILL_OPT_EVAL_CONCURRENCY_GLOBAL",
                defaults.eval_concurrency_global,
            ),
            optimize_lock_ttl_secs: env_u64(
                "SKILL_OPT_OPTIMIZE_LOCK_TTL_SECS",
                defaults.optimize_lock_ttl_secs,
            ),
            reflect_lock_ttl_secs: env_u64(
                "SKILL_OPT_REFLECT_LOCK_TTL_SECS",
                defaults.reflect_lock_ttl_secs,
            ),
            judge_timeout_secs: env_u64("SKILL_OPT_JUDGE_TIMEOUT_SECS", defaults.judge_timeout_secs),
            judge_retry_backoff_secs: defaults.judge_retry_backoff_secs,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Initializes the global tracing subscriber. Mirrors the teacher's
/// `main.rs` subscriber setup, but driven by `RUST_LOG` via `EnvFilter`
/// instead of a fixed `Level`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
