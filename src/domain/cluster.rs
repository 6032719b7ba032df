use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub skill_id: String,
    pub name: String,
    pub centroid: Vec<f32>,
    pub total_steps: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(skill_id: impl Into<String>, name: impl Into<String>, centroid: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            skill_id: skill_id.into(),
            name: name.into(),
            centroid,
            total_steps: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Euclidean distance to an embedding. Panics in debug builds if the
    /// dimensions disagree — per spec §3, all centroids for one skill share
    /// a dimension, so a mismatch is a programming error, not user input.
    pub fn distance_to(&self, embedding: &[f32]) -> f32 {
        debug_assert_eq!(self.centroid.len(), embedding.len(), "embedding dimension mismatch");
        self.centroid
            .iter()
            .zip(embedding.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}
