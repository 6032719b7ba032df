//! Hand-rolled k-means++ (spec §4.7). No teacher dependency provides
//! clustering; the k-means++ seeding step reuses `rand`, already a teacher
//! dependency (`memory/vector.rs` uses it for sampling), weighted by
//! squared distance to the nearest existing centroid as the standard
//! algorithm specifies.

use rand::Rng;

const MAX_ITERATIONS: usize = 50;
const CONVERGENCE_THRESHOLD: f32 = 1e-4;

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// k-means++ initialization: the first centroid is drawn uniformly; each
/// subsequent centroid is drawn with probability proportional to its
/// squared distance to the nearest already-chosen centroid.
fn kmeans_plus_plus_init(points: &[Vec<f32>], k: usize, rng: &mut impl Rng) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);
    let first = rng.gen_range(0..points.len());
    centroids.push(points[first].clone());

    while centroids.len() < k {
        let weights: Vec<f32> = points
            .iter()
            .map(|p| centroids.iter().map(|c| squared_distance(p, c)).fold(f32::INFINITY, f32::min))
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            // All remaining points coincide with a chosen centroid; pad
            // with uniform draws rather than looping forever.
            let idx = rng.gen_range(0..points.len());
            centroids.push(points[idx].clone());
            continue;
        }
        let mut target = rng.gen_range(0.0..total);
        let mut chosen = points.len() - 1;
        for (idx, w) in weights.iter().enumerate() {
            if target <= *w {
                chosen = idx;
                break;
            }
            target -= w;
        }
        centroids.push(points[chosen].clone());
    }
    centroids
}

/// Runs Lloyd's algorithm seeded by k-means++, for ≤50 iterations or until
/// total centroid movement drops below `1e-4` (spec §4.7 step 3). Returns
/// the final centroids; panics if `points` is empty or `k` is zero, which
/// the caller must have already excluded (spec §4.7 step 2's minimum-count
/// precondition).
pub fn kmeans(points: &[Vec<f32>], k: usize, rng: &mut impl Rng) -> Vec<Vec<f32>> {
    assert!(!points.is_empty(), "kmeans requires at least one point");
    assert!(k > 0, "kmeans requires k >= 1");
    let dim = points[0].len();

    let mut centroids = kmeans_plus_plus_init(points, k.min(points.len()), rng);
    // Pad with repeats of the last centroid if k exceeds distinct points.
    while centroids.len() < k {
        centroids.push(centroids.last().unwrap().clone());
    }

    for _ in 0..MAX_ITERATIONS {
        let mut assignments = vec![0usize; points.len()];
        for (i, point) in points.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f32::INFINITY;
            for (c_idx, centroid) in centroids.iter().enumerate() {
                let d = squared_distance(point, centroid);
                if d < best_dist {
                    best_dist = d;
                    best = c_idx;
                }
            }
            assignments[i] = best;
        }

        let mut sums = vec![vec![0f32; dim]; k];
        let mut counts = vec![0u64; k];
        for (point, &assignment) in points.iter().zip(assignments.iter()) {
            counts[assignment] += 1;
            for (s, p) in sums[assignment].iter_mut().zip(point.iter()) {
                *s += p;
            }
        }

        let mut movement = 0f32;
        let mut new_centroids = Vec::with_capacity(k);
        for idx in 0..k {
            if counts[idx] == 0 {
                // Empty cluster: keep its previous centroid in place.
                new_centroids.push(centroids[idx].clone());
                continue;
            }
            let mean: Vec<f32> = sums[idx].iter().map(|s| s / counts[idx] as f32).collect();
            movement += squared_distance(&mean, &centroids[idx]).sqrt();
            new_centroids.push(mean);
        }

        centroids = new_centroids;
        if movement < CONVERGENCE_THRESHOLD {
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn separates_two_distinct_blobs() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let points = vec![
            vec![0.0, 0.0],
            vec![0.1, -0.1],
            vec![-0.1, 0.1],
            vec![10.0, 10.0],
            vec![10.1, 9.9],
            vec![9.9, 10.1],
        ];
        let centroids = kmeans(&points, 2, &mut rng);
        assert_eq!(centroids.len(), 2);
        let near_origin = centroids.iter().any(|c| squared_distance(c, &[0.0, 0.0]).sqrt() < 1.0);
        let near_ten = centroids.iter().any(|c| squared_distance(c, &[10.0, 10.0]).sqrt() < 1.0);
        assert!(near_origin && near_ten);
    }

    #[test]
    fn single_cluster_returns_mean() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let points = vec![vec![1.0, 1.0], vec![3.0, 3.0]];
        let centroids = kmeans(&points, 1, &mut rng);
        assert_eq!(centroids.len(), 1);
        assert!((centroids[0][0] - 2.0).abs() < 1e-6);
        assert!((centroids[0][1] - 2.0).abs() < 1e-6);
    }
}
