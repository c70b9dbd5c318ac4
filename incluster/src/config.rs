use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ClusterError;

/// Controls pipeline behavior.
///
/// Missing YAML fields take their defaults, so a file only needs the
/// fields it wants to change (plus `dim`). Sizes, durations, `dbscan_eps`
/// and `name_prefix` also treat zero or empty as "use the default";
/// `threshold` and `seed` do not, so 0 is a valid setting for both.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Embedding dimension (e.g. 1536 for text-embedding-3-small).
    pub dim: usize,

    /// Minimum real-time confidence to assign without deferring.
    /// Compared against `best * (1 + gap)`, which may exceed 1. Zero
    /// assigns every item to its nearest cluster. Default: 0.6.
    pub threshold: f32,

    /// Minimum group size for a new cluster, also handed to the density
    /// clusterer. Batches smaller than this skip clustering entirely.
    /// Default: 3.
    pub min_cluster_size: usize,

    /// Maximum items drained from the queue per reconciliation pass.
    /// Default: 100.
    pub batch_size: usize,

    /// Queue length that wakes the background reconcile loop early.
    /// Default: same as `batch_size`.
    pub trigger_size: usize,

    /// Dimensionality reduction only runs when a batch has more items than
    /// this. Default: 10.
    pub reduce_above: usize,

    /// Upper bound on the reduced dimension; the effective target is
    /// `min(reduce_dim, batch_len - 2)`. Default: 10.
    pub reduce_dim: usize,

    /// Neighborhood radius (cosine distance) for the built-in DBSCAN.
    /// Default: 0.15.
    pub dbscan_eps: f32,

    /// Timeout per capability call during reconciliation. Default: 30000.
    pub clustering_timeout_ms: u64,

    /// Period of the background reconcile loop. Default: 60000.
    pub reconcile_interval_ms: u64,

    /// Prefix for placeholder cluster names ("cluster" -> "cluster:007").
    pub name_prefix: String,

    /// Seed for the built-in random projection and CLI shuffling.
    /// Default: 42.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dim: 0,
            threshold: 0.6,
            min_cluster_size: 3,
            batch_size: 100,
            trigger_size: 0,
            reduce_above: 10,
            reduce_dim: 10,
            dbscan_eps: 0.15,
            clustering_timeout_ms: 30_000,
            reconcile_interval_ms: 60_000,
            name_prefix: "cluster".into(),
            seed: 42,
        }
    }
}

impl Config {
    /// Creates a config for the given dimension with every other field
    /// at its default.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
        .with_defaults()
    }

    /// Parses a YAML document, fills defaults and validates.
    pub fn from_yaml_str(s: &str) -> Result<Self, ClusterError> {
        let cfg: Config = serde_yaml::from_str(s)?;
        let cfg = cfg.with_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and parses a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    pub fn with_defaults(mut self) -> Self {
        if self.min_cluster_size == 0 {
            self.min_cluster_size = 3;
        }
        if self.batch_size == 0 {
            self.batch_size = 100;
        }
        if self.trigger_size == 0 {
            self.trigger_size = self.batch_size;
        }
        if self.reduce_above == 0 {
            self.reduce_above = 10;
        }
        if self.reduce_dim == 0 {
            self.reduce_dim = 10;
        }
        if self.dbscan_eps == 0.0 {
            self.dbscan_eps = 0.15;
        }
        if self.clustering_timeout_ms == 0 {
            self.clustering_timeout_ms = 30_000;
        }
        if self.reconcile_interval_ms == 0 {
            self.reconcile_interval_ms = 60_000;
        }
        if self.name_prefix.is_empty() {
            self.name_prefix = "cluster".into();
        }
        self
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.dim == 0 {
            return Err(ClusterError::InvalidConfig("dim must be positive".into()));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ClusterError::InvalidConfig(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        if self.batch_size < self.min_cluster_size {
            return Err(ClusterError::InvalidConfig(format!(
                "batch_size {} is smaller than min_cluster_size {}",
                self.batch_size, self.min_cluster_size
            )));
        }
        if !(self.dbscan_eps > 0.0 && self.dbscan_eps <= 2.0) {
            return Err(ClusterError::InvalidConfig(format!(
                "dbscan_eps must be in (0, 2], got {}",
                self.dbscan_eps
            )));
        }
        Ok(())
    }

    pub fn clustering_timeout(&self) -> Duration {
        Duration::from_millis(self.clustering_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}
