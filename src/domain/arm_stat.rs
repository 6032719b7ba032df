use serde::{Deserialize, Serialize};

/// Rolling Bayesian sufficient statistics for one arm, updated via
/// Welford's online algorithm (spec §4.3). `version` is the fencing-token
/// style counter the storage port uses for compare-and-swap writes — it is
/// not part of the spec's data model, only an implementation detail of the
/// `ConflictingUpdate` contract in §4.1/§4.3.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ArmStat {
    pub version: u64,
    pub n: u64,
    pub mean: f64,
    pub m2: f64,
    pub total_reward: f64,
}

impl ArmStat {
    pub fn zero() -> Self {
        Self {
            version: 0,
            n: 0,
            mean: 0.0,
            m2: 0.0,
            total_reward: 0.0,
        }
    }

    /// Folds a new reward `r` into the statistics (Welford). Returns the
    /// updated statistics; the caller is responsible for writing it back
    /// under the storage port's CAS contract.
    pub fn with_reward(&self, reward: f64) -> Self {
        let n = self.n + 1;
        let delta = reward - self.mean;
        let mean = self.mean + delta / n as f64;
        let m2 = self.m2 + delta * (reward - mean);
        Self {
            version: self.version + 1,
            n,
            mean,
            m2,
            total_reward: self.total_reward + reward,
        }
    }

    /// Posterior variance used by Thompson sampling (spec §4.3):
    /// `m2 / (n·(n−1))` for `n ≥ 2`, else a high prior variance of `1`.
    pub fn posterior_variance(&self) -> f64 {
        if self.n >= 2 {
            self.m2 / (self.n as f64 * (self.n as f64 - 1.0))
        } else {
            1.0
        }
    }
}

impl Default for ArmStat {
    fn default() -> Self {
        Self::zero()
    }
}
