use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cosine::weighted_merge;
use crate::error::ClusterError;
use crate::types::{ClusterId, ClusterView, RegistryStats, Snapshot};

/// Folds `count` embeddings, whose element-wise sum is `sum`, into an
/// existing cluster.
///
/// Merges are applied against the centroid current at commit time, so
/// they commute with other merges committed in between.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub cluster_id: ClusterId,
    pub sum: Vec<f64>,
    pub count: usize,
}

/// A cluster to create.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCluster {
    pub centroid: Vec<f32>,
    pub member_count: usize,

    /// Empty means "use a placeholder name".
    pub name: String,
}

/// Every registry mutation of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub merges: Vec<Merge>,
    pub new_clusters: Vec<NewCluster>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.merges.is_empty() && self.new_clusters.is_empty()
    }
}

/// Owns cluster state: id, centroid, member count and display name.
///
/// Implementations must be safe for concurrent use. Readers always see
/// either the state before or after a mutation, never a mix, and
/// mutations are mutually exclusive with each other. Use
/// [`MemoryRegistry`] for in-process state.
pub trait ClusterRegistry: Send + Sync {
    /// Embedding dimension every centroid must have.
    fn dim(&self) -> usize;

    /// Creates a cluster and returns its newly allocated id.
    fn add_cluster(
        &self,
        centroid: Vec<f32>,
        member_count: usize,
        name: &str,
    ) -> Result<ClusterId, ClusterError>;

    /// Replaces a cluster's centroid and member count as one step.
    fn update_centroid(
        &self,
        id: ClusterId,
        centroid: Vec<f32>,
        member_count: usize,
    ) -> Result<(), ClusterError>;

    /// Commits a change set all-or-nothing. Returns the ids allocated to
    /// `changes.new_clusters`, in order.
    fn apply(&self, changes: ChangeSet) -> Result<Vec<ClusterId>, ClusterError>;

    /// Returns a consistent point-in-time view.
    fn snapshot(&self) -> Arc<Snapshot>;

    /// Returns cluster count, member total and per-cluster sizes.
    fn stats(&self) -> RegistryStats {
        self.snapshot().stats()
    }
}

struct WriterState {
    next_id: u64,
}

/// In-memory [`ClusterRegistry`].
///
/// The current state is an immutable [`Snapshot`] behind an `Arc`.
/// Writers serialize on a mutex, build the next snapshot off to the side
/// and publish it with a pointer swap, so readers hold the read lock only
/// for an `Arc` clone.
pub struct MemoryRegistry {
    dim: usize,
    name_prefix: String,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<WriterState>,
}

impl MemoryRegistry {
    /// Creates an empty registry. Panics if `dim` is 0.
    pub fn new(dim: usize, name_prefix: impl Into<String>) -> Self {
        assert!(dim > 0, "incluster: registry dim must be positive");
        Self {
            dim,
            name_prefix: name_prefix.into(),
            current: RwLock::new(Arc::new(Snapshot::empty(dim))),
            writer: Mutex::new(WriterState { next_id: 0 }),
        }
    }

    fn check_dim(&self, v: &[f32]) -> Result<(), ClusterError> {
        if v.len() != self.dim {
            return Err(ClusterError::DimensionMismatch {
                expected: self.dim,
                got: v.len(),
            });
        }
        Ok(())
    }

    fn placeholder_name(&self, id: ClusterId) -> String {
        if self.name_prefix.is_empty() {
            id.to_string()
        } else {
            format!("{}:{}", self.name_prefix, id)
        }
    }

    fn publish(&self, next: Snapshot) {
        *self.current.write() = Arc::new(next);
    }
}

impl ClusterRegistry for MemoryRegistry {
    fn dim(&self) -> usize {
        self.dim
    }

    fn add_cluster(
        &self,
        centroid: Vec<f32>,
        member_count: usize,
        name: &str,
    ) -> Result<ClusterId, ClusterError> {
        let ids = self.apply(ChangeSet {
            merges: Vec::new(),
            new_clusters: vec![NewCluster {
                centroid,
                member_count,
                name: name.to_string(),
            }],
        })?;
        Ok(ids[0])
    }

    fn update_centroid(
        &self,
        id: ClusterId,
        centroid: Vec<f32>,
        member_count: usize,
    ) -> Result<(), ClusterError> {
        self.check_dim(&centroid)?;
        if member_count == 0 {
            return Err(ClusterError::EmptyCluster);
        }

        let _w = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot());
        let view = next
            .clusters
            .get_mut(&id)
            .ok_or(ClusterError::UnknownCluster(id))?;
        view.centroid = centroid;
        view.member_count = member_count;
        self.publish(next);
        Ok(())
    }

    fn apply(&self, changes: ChangeSet) -> Result<Vec<ClusterId>, ClusterError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let mut w = self.writer.lock();
        let current = self.snapshot();

        // Validate everything before touching state.
        for m in &changes.merges {
            if !current.clusters.contains_key(&m.cluster_id) {
                return Err(ClusterError::UnknownCluster(m.cluster_id));
            }
            if m.sum.len() != self.dim {
                return Err(ClusterError::DimensionMismatch {
                    expected: self.dim,
                    got: m.sum.len(),
                });
            }
        }
        for c in &changes.new_clusters {
            self.check_dim(&c.centroid)?;
            if c.member_count == 0 {
                return Err(ClusterError::EmptyCluster);
            }
        }

        let mut next = Snapshot::clone(&current);
        for m in changes.merges {
            if m.count == 0 {
                continue;
            }
            if let Some(view) = next.clusters.get_mut(&m.cluster_id) {
                view.centroid = weighted_merge(&view.centroid, view.member_count, &m.sum, m.count);
                view.member_count += m.count;
            }
        }

        let mut ids = Vec::with_capacity(changes.new_clusters.len());
        for c in changes.new_clusters {
            w.next_id += 1;
            let id = ClusterId(w.next_id);
            let name = if c.name.is_empty() {
                self.placeholder_name(id)
            } else {
                c.name
            };
            debug!(cluster = %id, members = c.member_count, name = %name, "registry: add cluster");
            next.clusters.insert(
                id,
                ClusterView {
                    centroid: c.centroid,
                    member_count: c.member_count,
                    name,
                },
            );
            ids.push(id);
        }

        self.publish(next);
        Ok(ids)
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.current.read())
    }
}
