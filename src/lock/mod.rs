//! Lock Service (C2, spec §4.2)
//!
//! Wraps a `StoragePort` with the acquire/double-check/release contract.
//! Grounded in the teacher's `SqliteTaskQueue::dequeue` transactional
//! read-then-update idiom, generalized to advisory per-(skill, purpose)
//! locks instead of task rows.

use crate::domain::{LockPurpose, Skill};
use crate::error::{CoreError, CoreResult};
use crate::ports::storage::StoragePort;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// A held lock. Dropping this without calling `release` leaks the lock
/// until its TTL expires — callers MUST route every exit path (including
/// error returns) through `release`.
pub struct LockGuard {
    pub skill_id: String,
    pub purpose: LockPurpose,
    pub fencing_token: u64,
}

pub struct LockService {
    storage: Arc<dyn StoragePort>,
}

impl LockService {
    pub fn new(storage: Arc<dyn StoragePort>) -> Self {
        Self { storage }
    }

    /// Attempts to acquire `purpose` for `skill_id`, then performs the
    /// double-check spec §4.2 requires: re-read the skill and verify the
    /// completion flag named by `completion_unset` is still unset and that
    /// our token is still current. Returns `None` if the lock is held by
    /// another holder whose TTL has not expired, or if the double-check
    /// fails (in which case the lock is released before returning).
    #[tracing::instrument(skip(self, completion_unset))]
    pub async fn acquire_with_double_check(
        &self,
        skill_id: &str,
        purpose: LockPurpose,
        ttl_secs: u64,
        completion_unset: impl Fn(&Skill) -> bool + Send,
    ) -> CoreResult<Option<LockGuard>> {
        let now = Utc::now();
        let grant = self.storage.try_acquire_lock(skill_id, purpose, ttl_secs, now).await?;
        if !grant.acquired {
            info!(skill_id, %purpose, "lock held by another holder, exiting");
            return Ok(None);
        }

        let skill = self.storage.get_skill(skill_id).await?;
        let token_current = skill.lock_state(purpose).fencing_token == Some(grant.fencing_token);
        if !completion_unset(&skill) || !token_current {
            warn!(skill_id, %purpose, "double-check failed after acquisition, releasing");
            self.storage.release_lock(skill_id, purpose, grant.fencing_token, &skill).await?;
            return Ok(None);
        }

        Ok(Some(LockGuard { skill_id: skill_id.to_string(), purpose, fencing_token: grant.fencing_token }))
    }

    /// Releases `guard`, writing `updated_skill`'s other fields atomically
    /// with the release (spec §4.7 step 7 / §4.8 step 5). A release whose
    /// token no longer matches the current holder is a no-op.
    pub async fn release(&self, guard: LockGuard, updated_skill: &Skill) -> CoreResult<()> {
        self.storage.release_lock(&guard.skill_id, guard.purpose, guard.fencing_token, updated_skill).await
    }

    /// Releases without mutating any other field, by fetching the current
    /// skill row first. Used on error paths where the caller has nothing
    /// new to persist.
    pub async fn release_unchanged(&self, guard: LockGuard) -> CoreResult<()> {
        let current = self.storage.get_skill(&guard.skill_id).await.map_err(|e| match e {
            CoreError::NotFound(_) => e,
            other => other,
        })?;
        self.release(guard, &current).await
    }
}
