use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::cosine::cosine_similarity;
use crate::error::ClusterError;
use crate::types::{ClusterId, Decision, Snapshot};

/// Assignment confidence from the best similarity and its gap to the
/// runner-up: `best * (1 + gap)`.
///
/// This is a heuristic score, not a probability. It can exceed 1 when the
/// gap is large and is only meaningful when compared with a threshold.
pub fn confidence(best: f32, second: f32) -> f32 {
    let gap = best - second;
    best * (1.0 + gap)
}

/// Decides whether `embedding` belongs to a cluster of `snapshot`.
///
/// Pure function of its inputs. An empty snapshot always defers with
/// confidence 0. A single-cluster snapshot has gap 0, so its confidence
/// equals the raw similarity. Similarity ties go to the smaller id.
pub fn assign(
    embedding: &[f32],
    snapshot: &Snapshot,
    threshold: f32,
) -> Result<Decision, ClusterError> {
    check_embedding(embedding, snapshot.dim)?;

    let Some((best_id, best, second)) = top_two(embedding, snapshot) else {
        return Ok(Decision::defer(None, 0.0));
    };

    let conf = confidence(best, second);
    if conf >= threshold {
        Ok(Decision {
            cluster_id: Some(best_id),
            confidence: conf,
            deferred: false,
        })
    } else {
        Ok(Decision::defer(Some(best_id), conf))
    }
}

/// Rejects embeddings of the wrong length or with NaN/infinite entries.
pub(crate) fn check_embedding(embedding: &[f32], dim: usize) -> Result<(), ClusterError> {
    if embedding.len() != dim {
        return Err(ClusterError::DimensionMismatch {
            expected: dim,
            got: embedding.len(),
        });
    }
    if let Some(i) = embedding.iter().position(|x| !x.is_finite()) {
        return Err(ClusterError::InvalidEmbedding(format!("non-finite value at index {i}")));
    }
    Ok(())
}

/// Best cluster, best similarity and second-best similarity.
/// With one cluster, second == best.
fn top_two(embedding: &[f32], snapshot: &Snapshot) -> Option<(ClusterId, f32, f32)> {
    let mut best: Option<(ClusterId, f32)> = None;
    let mut second: Option<f32> = None;

    for (id, view) in &snapshot.clusters {
        let sim = cosine_similarity(embedding, &view.centroid);
        match best {
            Some((_, b)) if sim <= b => {
                if second.is_none_or(|s| sim > s) {
                    second = Some(sim);
                }
            }
            _ => {
                if let Some((_, b)) = best {
                    second = Some(b);
                }
                best = Some((*id, sim));
            }
        }
    }

    best.map(|(id, b)| (id, b, second.unwrap_or(b)))
}

/// Cluster whose centroid is most similar to `embedding`, ignoring any
/// threshold. Returns None for an empty snapshot.
pub(crate) fn nearest(embedding: &[f32], snapshot: &Snapshot) -> Option<(ClusterId, f32)> {
    top_two(embedding, snapshot).map(|(id, best, _)| (id, best))
}

/// Counters reported by [`RealtimeAssigner::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignerStats {
    pub assigned: u64,
    pub deferred: u64,
    pub rejected: u64,
    pub total: u64,

    /// Fraction of accepted items that were deferred.
    pub deferral_rate: f64,

    /// Mean decision latency in microseconds.
    pub avg_latency_us: f64,
}

/// Threshold-gated nearest-centroid assigner.
///
/// Safe to call from many threads at once; it only reads the snapshot
/// handed in and updates atomic counters.
pub struct RealtimeAssigner {
    threshold: f32,
    assigned: AtomicU64,
    deferred: AtomicU64,
    rejected: AtomicU64,
    latency_us: AtomicU64,
}

impl RealtimeAssigner {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            assigned: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Runs [`assign`] and records the outcome.
    pub fn assign(&self, embedding: &[f32], snapshot: &Snapshot) -> Result<Decision, ClusterError> {
        let start = Instant::now();
        let result = assign(embedding, snapshot, self.threshold);
        let elapsed = start.elapsed().as_micros() as u64;

        match &result {
            Ok(d) if d.deferred => {
                self.deferred.fetch_add(1, Ordering::Relaxed);
                debug!(confidence = d.confidence, candidate = ?d.cluster_id, "assigner: defer");
            }
            Ok(d) => {
                self.assigned.fetch_add(1, Ordering::Relaxed);
                debug!(confidence = d.confidence, cluster = ?d.cluster_id, "assigner: assign");
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        if result.is_ok() {
            self.latency_us.fetch_add(elapsed, Ordering::Relaxed);
        }
        result
    }

    pub fn stats(&self) -> AssignerStats {
        let assigned = self.assigned.load(Ordering::Relaxed);
        let deferred = self.deferred.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let latency = self.latency_us.load(Ordering::Relaxed);
        let accepted = assigned + deferred;
        let (deferral_rate, avg_latency_us) = if accepted > 0 {
            (
                deferred as f64 / accepted as f64,
                latency as f64 / accepted as f64,
            )
        } else {
            (0.0, 0.0)
        };
        AssignerStats {
            assigned,
            deferred,
            rejected,
            total: accepted + rejected,
            deferral_rate,
            avg_latency_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::ClusterView;

    fn snapshot(centroids: &[(u64, Vec<f32>)]) -> Snapshot {
        let dim = centroids.first().map(|(_, c)| c.len()).unwrap_or(3);
        let clusters: BTreeMap<ClusterId, ClusterView> = centroids
            .iter()
            .map(|(id, c)| {
                (
                    ClusterId(*id),
                    ClusterView {
                        centroid: c.clone(),
                        member_count: 3,
                        name: String::new(),
                    },
                )
            })
            .collect();
        Snapshot { dim, clusters }
    }

    #[test]
    fn empty_snapshot_defers() {
        let snap = Snapshot::empty(3);
        let d = assign(&[1.0, 0.0, 0.0], &snap, 0.6).unwrap();
        assert!(d.deferred);
        assert_eq!(d.cluster_id, None);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn empty_snapshot_still_checks_dimension() {
        let snap = Snapshot::empty(3);
        let err = assign(&[1.0, 0.0], &snap, 0.6).unwrap_err();
        assert!(matches!(err, ClusterError::DimensionMismatch { expected: 3, got: 2 }));
    }

    #[test]
    fn dimension_mismatch() {
        let snap = snapshot(&[(1, vec![1.0, 0.0, 0.0])]);
        assert!(assign(&[1.0, 0.0, 0.0, 0.0], &snap, 0.6).is_err());
    }

    #[test]
    fn non_finite_values_rejected() {
        let snap = snapshot(&[(1, vec![1.0, 0.0, 0.0])]);
        for emb in [
            [1.0, f32::NAN, 0.0],
            [f32::INFINITY, 0.0, 0.0],
            [0.0, 0.0, f32::NEG_INFINITY],
        ] {
            let err = assign(&emb, &snap, 0.6).unwrap_err();
            assert!(matches!(err, ClusterError::InvalidEmbedding(_)), "got {err}");
        }
        // Also on an empty registry, where nothing would be compared.
        let err = assign(&[f32::NAN, 0.0, 0.0], &Snapshot::empty(3), 0.6).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidEmbedding(_)));
    }

    #[test]
    fn single_cluster_confidence_is_similarity() {
        let snap = snapshot(&[(1, vec![1.0, 0.0, 0.0])]);
        let emb = [0.95, 0.312, 0.0];
        let sim = cosine_similarity(&emb, &[1.0, 0.0, 0.0]);
        let d = assign(&emb, &snap, 0.6).unwrap();
        assert!(!d.deferred);
        assert_eq!(d.cluster_id, Some(ClusterId(1)));
        assert!((d.confidence - sim).abs() < 1e-6);
    }

    #[test]
    fn picks_best_and_uses_gap() {
        let snap = snapshot(&[
            (1, vec![1.0, 0.0, 0.0]),
            (2, vec![0.0, 1.0, 0.0]),
            (3, vec![0.0, 0.0, 1.0]),
        ]);
        let emb = [0.1, 0.9, 0.3];
        let d = assign(&emb, &snap, 0.0).unwrap();
        assert_eq!(d.cluster_id, Some(ClusterId(2)));

        let best = cosine_similarity(&emb, &[0.0, 1.0, 0.0]);
        let second = cosine_similarity(&emb, &[0.0, 0.0, 1.0]);
        assert!((d.confidence - best * (1.0 + best - second)).abs() < 1e-6);
    }

    #[test]
    fn assigned_id_exists_in_snapshot() {
        let snap = snapshot(&[(4, vec![1.0, 0.0, 0.0]), (9, vec![0.0, 1.0, 0.0])]);
        let embeddings = [[1.0, 0.2, 0.0], [0.1, 1.0, 0.0], [0.5, 0.5, 0.7], [-1.0, 0.0, 0.0]];
        for emb in embeddings {
            let d = assign(&emb, &snap, 0.0).unwrap();
            let id = d.cluster_id.expect("non-empty snapshot yields a candidate");
            assert!(snap.clusters.contains_key(&id));
        }
    }

    #[test]
    fn below_threshold_defers_with_hint() {
        let snap = snapshot(&[(1, vec![1.0, 0.0, 0.0])]);
        let d = assign(&[0.3, 1.0, 0.0], &snap, 0.6).unwrap();
        assert!(d.deferred);
        assert_eq!(d.cluster_id, Some(ClusterId(1)));
        assert!(d.confidence < 0.6);
    }

    #[test]
    fn tie_goes_to_smaller_id() {
        let snap = snapshot(&[(2, vec![1.0, 0.0]), (5, vec![1.0, 0.0])]);
        let d = assign(&[1.0, 0.0], &snap, 0.0).unwrap();
        assert_eq!(d.cluster_id, Some(ClusterId(2)));
        assert!((d.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn confidence_formula_and_monotonicity() {
        assert!((confidence(0.8, 0.8) - 0.8).abs() < 1e-6);
        assert!((confidence(0.8, 0.3) - 0.8 * 1.5).abs() < 1e-6);
        // Exceeds 1 with a large gap.
        assert!(confidence(0.9, -0.5) > 1.0);

        // Increasing best at a fixed gap.
        let gap = 0.1;
        let mut prev = f32::MIN;
        for i in 1..=10 {
            let best = i as f32 / 10.0;
            let c = confidence(best, best - gap);
            assert!(c > prev);
            prev = c;
        }

        // Increasing gap at a fixed best.
        let best = 0.7;
        let mut prev = f32::MIN;
        for i in 0..=10 {
            let gap = i as f32 / 20.0;
            let c = confidence(best, best - gap);
            assert!(c > prev);
            prev = c;
        }
    }

    #[test]
    fn near_equal_pair_defers_when_best_below_threshold() {
        // Two centroids equally similar to the probe: gap ~ 0.
        let snap = snapshot(&[(1, vec![1.0, 0.0, 0.0]), (2, vec![0.0, 1.0, 0.0])]);
        let emb = [1.0, 1.0, 1.5];
        let d = assign(&emb, &snap, 0.6).unwrap();
        let best = cosine_similarity(&emb, &[1.0, 0.0, 0.0]);
        assert!(best < 0.6);
        assert!((d.confidence - best).abs() < 1e-5);
        assert!(d.deferred);
    }

    #[test]
    fn stats_count_outcomes() {
        let a = RealtimeAssigner::new(0.6);
        let empty = Snapshot::empty(2);
        let snap = snapshot(&[(1, vec![1.0, 0.0])]);

        a.assign(&[1.0, 0.0], &empty).unwrap();
        a.assign(&[1.0, 0.0], &snap).unwrap();
        a.assign(&[1.0, 0.1], &snap).unwrap();
        assert!(a.assign(&[1.0], &snap).is_err());

        let s = a.stats();
        assert_eq!(s.assigned, 2);
        assert_eq!(s.deferred, 1);
        assert_eq!(s.rejected, 1);
        assert_eq!(s.total, 4);
        assert!((s.deferral_rate - 1.0 / 3.0).abs() < 1e-9);
    }
}
