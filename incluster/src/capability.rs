//! Numerical capabilities consumed by the reconciler.
//!
//! Production deployments typically back these with an external ML service
//! (UMAP + HDBSCAN). The built-in [`RandomProjection`] and [`Dbscan`] are
//! small self-contained stand-ins suitable for tests, simulations and
//! modest batch sizes.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cosine::{cosine_distance, l2_norm};
use crate::error::CapabilityError;

/// Label for items that belong to no density group.
pub const NOISE: i32 = -1;

/// Reduces the dimensionality of a batch of vectors.
#[async_trait::async_trait]
pub trait DimensionReducer: Send + Sync {
    /// Returns one `target_dim`-dimensional vector per input vector.
    /// Must accept batches as small as the configured minimum cluster size.
    async fn reduce(
        &self,
        vectors: &[Vec<f32>],
        target_dim: usize,
    ) -> Result<Vec<Vec<f32>>, CapabilityError>;
}

/// Groups a batch of vectors by density.
#[async_trait::async_trait]
pub trait DensityClusterer: Send + Sync {
    /// Returns one label per input vector. [`NOISE`] (-1) means "no group";
    /// every other label names a group of at least `min_group_size` members.
    async fn cluster(
        &self,
        vectors: &[Vec<f32>],
        min_group_size: usize,
    ) -> Result<Vec<i32>, CapabilityError>;
}

/// Checks that every vector is non-empty, finite and of the same length.
/// Returns that length (0 for an empty batch).
fn check_batch(vectors: &[Vec<f32>]) -> Result<usize, CapabilityError> {
    let Some(first) = vectors.first() else {
        return Ok(0);
    };
    let dim = first.len();
    if dim == 0 {
        return Err(CapabilityError::InvalidInput("empty vector".into()));
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dim {
            return Err(CapabilityError::InvalidInput(format!(
                "vector {i} has dimension {}, want {dim}",
                v.len()
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(CapabilityError::InvalidInput(format!(
                "vector {i} has non-finite values"
            )));
        }
    }
    Ok(dim)
}

/// Dense random projection with a fixed seed: every matrix entry is
/// ±1/sqrt(k) with equal probability (a Rademacher matrix).
///
/// Approximately preserves angles, which is all the cosine-based
/// clustering downstream needs. Deterministic for a given seed and input
/// dimension.
pub struct RandomProjection {
    seed: u64,
}

impl RandomProjection {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn matrix(&self, input_dim: usize, target_dim: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let scale = 1.0 / (target_dim as f32).sqrt();
        (0..target_dim)
            .map(|_| {
                (0..input_dim)
                    .map(|_| if rng.gen_bool(0.5) { scale } else { -scale })
                    .collect()
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DimensionReducer for RandomProjection {
    async fn reduce(
        &self,
        vectors: &[Vec<f32>],
        target_dim: usize,
    ) -> Result<Vec<Vec<f32>>, CapabilityError> {
        if target_dim == 0 {
            return Err(CapabilityError::InvalidInput("target dimension is 0".into()));
        }
        let dim = check_batch(vectors)?;
        if dim == 0 || target_dim >= dim {
            return Ok(vectors.to_vec());
        }

        let m = self.matrix(dim, target_dim);
        Ok(vectors
            .iter()
            .map(|v| {
                let mut unit = v.clone();
                l2_norm(&mut unit);
                m.iter()
                    .map(|row| row.iter().zip(&unit).map(|(a, b)| a * b).sum::<f32>())
                    .collect::<Vec<f32>>()
            })
            .collect())
    }
}

/// DBSCAN over cosine distance.
///
/// `min_group_size` doubles as DBSCAN's `min_pts`. Groups that still end
/// up smaller than `min_group_size` (border points shared between
/// clusters) are relabelled [`NOISE`]; surviving groups are renumbered
/// `0, 1, ...` in order of first appearance.
pub struct Dbscan {
    eps: f32,
}

impl Dbscan {
    /// `eps` is the maximum cosine distance (1 - similarity) between
    /// neighbors.
    pub fn new(eps: f32) -> Self {
        Self { eps }
    }
}

#[async_trait::async_trait]
impl DensityClusterer for Dbscan {
    async fn cluster(
        &self,
        vectors: &[Vec<f32>],
        min_group_size: usize,
    ) -> Result<Vec<i32>, CapabilityError> {
        if min_group_size == 0 {
            return Err(CapabilityError::InvalidInput("min_group_size is 0".into()));
        }
        check_batch(vectors)?;

        let normed: Vec<Vec<f32>> = vectors
            .iter()
            .map(|v| {
                let mut cp = v.clone();
                l2_norm(&mut cp);
                cp
            })
            .collect();
        let refs: Vec<&[f32]> = normed.iter().map(|v| v.as_slice()).collect();
        let labels = dbscan(&refs, self.eps, min_group_size);
        Ok(compact_labels(&labels, min_group_size))
    }
}

/// Drops undersized groups to NOISE and renumbers the rest from 0.
fn compact_labels(labels: &[i32], min_group_size: usize) -> Vec<i32> {
    let mut sizes: HashMap<i32, usize> = HashMap::new();
    for &l in labels {
        if l != NOISE {
            *sizes.entry(l).or_default() += 1;
        }
    }

    let mut renumber: HashMap<i32, i32> = HashMap::new();
    labels
        .iter()
        .map(|&l| {
            if l == NOISE || sizes[&l] < min_group_size {
                return NOISE;
            }
            let next = renumber.len() as i32;
            *renumber.entry(l).or_insert(next)
        })
        .collect()
}

/// Classic DBSCAN. Returns -1 for noise and 1, 2, ... for clusters.
fn dbscan(vectors: &[&[f32]], eps: f32, min_pts: usize) -> Vec<i32> {
    const UNDEFINED: i32 = 0;

    let n = vectors.len();
    let mut labels = vec![UNDEFINED; n];
    let mut cluster_id: i32 = 0;

    for i in 0..n {
        if labels[i] != UNDEFINED {
            continue;
        }

        let neighbors = range_query(vectors, i, eps);
        if neighbors.len() < min_pts {
            labels[i] = NOISE;
            continue;
        }

        cluster_id += 1;
        labels[i] = cluster_id;

        let mut seed: VecDeque<usize> = neighbors.into_iter().filter(|&j| j != i).collect();
        while let Some(q) = seed.pop_front() {
            if labels[q] == NOISE {
                // Border point: claimed by this cluster, not expanded.
                labels[q] = cluster_id;
                continue;
            }
            if labels[q] != UNDEFINED {
                continue;
            }
            labels[q] = cluster_id;

            let q_neighbors = range_query(vectors, q, eps);
            if q_neighbors.len() >= min_pts {
                seed.extend(q_neighbors);
            }
        }
    }

    labels
}

/// Indices of all vectors within eps cosine distance of vectors[idx],
/// including idx itself.
fn range_query(vectors: &[&[f32]], idx: usize, eps: f32) -> Vec<usize> {
    let q = vectors[idx];
    vectors
        .iter()
        .enumerate()
        .filter(|(_, v)| cosine_distance(q, v) <= eps)
        .map(|(i, _)| i)
        .collect()
}
