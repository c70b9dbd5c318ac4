/// Cosine similarity between two vectors, in `[-1, 1]`.
///
/// Uses f64 intermediate precision. Returns 0 for zero vectors and for
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot: f64 = 0.0;
    let mut na: f64 = 0.0;
    let mut nb: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let x = x as f64;
        let y = y as f64;
        dot += x * y;
        na += x * x;
        nb += y * y;
    }

    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    // Clamp to [-1, 1] to absorb floating point error.
    (dot / denom).clamp(-1.0, 1.0) as f32
}

/// Cosine distance: 1 - cosine_similarity, in `[0, 2]`.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Normalizes a vector to unit length in-place.
pub(crate) fn l2_norm(v: &mut [f32]) {
    let sum: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum();
    let norm = sum.sqrt();
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}

/// Element-wise sum of the given vectors, accumulated in f64.
pub(crate) fn vector_sum<'a, I>(dim: usize, vectors: I) -> Vec<f64>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum = vec![0.0f64; dim];
    for v in vectors {
        for (acc, &x) in sum.iter_mut().zip(v) {
            *acc += x as f64;
        }
    }
    sum
}

/// Arithmetic mean of the given vectors. Empty input yields a zero vector.
pub(crate) fn mean<'a, I>(dim: usize, vectors: I) -> Vec<f32>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut count = 0usize;
    let mut sum = vec![0.0f64; dim];
    for v in vectors {
        for (acc, &x) in sum.iter_mut().zip(v) {
            *acc += x as f64;
        }
        count += 1;
    }
    if count == 0 {
        return vec![0.0; dim];
    }
    let n = count as f64;
    sum.into_iter().map(|x| (x / n) as f32).collect()
}

/// Folds `count` new members, whose element-wise sum is `sum`, into a
/// centroid that currently averages `n` members.
pub(crate) fn weighted_merge(centroid: &[f32], n: usize, sum: &[f64], count: usize) -> Vec<f32> {
    let total = (n + count) as f64;
    centroid
        .iter()
        .zip(sum)
        .map(|(&c, &s)| ((c as f64 * n as f64 + s) / total) as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6, "identical vectors should have sim=1, got {sim}");
    }

    #[test]
    fn cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6, "orthogonal vectors should have sim=0, got {sim}");
    }

    #[test]
    fn cosine_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6, "opposite vectors should have sim=-1, got {sim}");
    }

    #[test]
    fn cosine_scale_invariant() {
        let a = cosine_similarity(&[1.0, 2.0, 3.0], &[2.0, 1.0, 0.5]);
        let b = cosine_similarity(&[10.0, 20.0, 30.0], &[2.0, 1.0, 0.5]);
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_and_mismatch() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert!((cosine_distance(&[0.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_norm_unit() {
        let mut v = [3.0, 4.0];
        l2_norm(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut z = [0.0, 0.0, 0.0];
        l2_norm(&mut z);
        assert_eq!(z, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn mean_of_vectors() {
        let a = [1.0, 0.0];
        let b = [3.0, 2.0];
        let m = mean(2, [&a[..], &b[..]]);
        assert_eq!(m, vec![2.0, 1.0]);
        assert_eq!(mean(2, std::iter::empty()), vec![0.0, 0.0]);
    }

    #[test]
    fn weighted_merge_matches_exact_mean() {
        // Centroid of [0,0] and [2,2] is [1,1] with n=2; fold in [4,4].
        let sum = vector_sum(2, [&[4.0f32, 4.0][..]]);
        let merged = weighted_merge(&[1.0, 1.0], 2, &sum, 1);
        assert!((merged[0] - 2.0).abs() < 1e-6);
        assert!((merged[1] - 2.0).abs() < 1e-6);
    }
}
