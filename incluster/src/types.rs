use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable cluster identifier. Allocated monotonically, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// A semantic cluster as held by the registry.
#[derive(Clone, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,

    /// Mean of every embedding merged into this cluster.
    pub centroid: Vec<f32>,

    /// Number of embeddings merged into this cluster. Always >= 1.
    pub member_count: usize,

    /// Display name. May be a placeholder until an external namer renames it.
    pub name: String,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("member_count", &self.member_count)
            .field("centroid_len", &self.centroid.len())
            .finish()
    }
}

/// Read-only view of one cluster inside a [`Snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterView {
    pub centroid: Vec<f32>,
    pub member_count: usize,
    pub name: String,
}

/// Point-in-time view of the registry.
///
/// Snapshots are immutable; the registry publishes a fresh one on every
/// mutation, so holding one never blocks writers.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Embedding dimension every centroid has.
    pub dim: usize,
    pub clusters: BTreeMap<ClusterId, ClusterView>,
}

impl Snapshot {
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            clusters: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn get(&self, id: ClusterId) -> Option<Cluster> {
        self.clusters.get(&id).map(|v| Cluster {
            id,
            centroid: v.centroid.clone(),
            member_count: v.member_count,
            name: v.name.clone(),
        })
    }

    /// Aggregate sizes, as returned by `ClusterRegistry::stats`.
    pub fn stats(&self) -> RegistryStats {
        let sizes: BTreeMap<ClusterId, usize> = self
            .clusters
            .iter()
            .map(|(id, v)| (*id, v.member_count))
            .collect();
        RegistryStats {
            total_clusters: sizes.len(),
            total_members: sizes.values().sum(),
            sizes,
        }
    }
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_clusters: usize,
    pub total_members: usize,
    pub sizes: BTreeMap<ClusterId, usize>,
}

/// An item the real-time assigner could not place confidently.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PendingItem {
    pub item_id: String,
    pub embedding: Vec<f32>,

    /// Opaque content reference carried through untouched.
    #[serde(default)]
    pub payload: String,
}

impl PendingItem {
    pub fn new(item_id: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            item_id: item_id.into(),
            embedding,
            payload: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Which step of the pipeline produced an [`Assignment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    /// Real-time assignment that passed the confidence threshold.
    Realtime,
    /// Density-noise item placed on the nearest existing centroid.
    NearestCentroid,
    /// Member of a cluster discovered during reconciliation.
    NewCluster,
    /// Could not be placed anywhere.
    Outlier,
}

/// Placement of one item. `cluster_id == None` marks an outlier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub item_id: String,
    pub cluster_id: Option<ClusterId>,

    /// Producer-specific score, see [`AssignmentSource`]. Not a probability.
    pub confidence: f32,
    pub source: AssignmentSource,
}

impl Assignment {
    pub(crate) fn outlier(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            cluster_id: None,
            confidence: 0.0,
            source: AssignmentSource::Outlier,
        }
    }

    pub fn is_outlier(&self) -> bool {
        self.cluster_id.is_none()
    }
}

/// Result of a real-time assignment attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Assigned cluster; for a deferred item, the best candidate if any.
    pub cluster_id: Option<ClusterId>,
    pub confidence: f32,
    pub deferred: bool,
}

impl Decision {
    pub(crate) fn defer(cluster_id: Option<ClusterId>, confidence: f32) -> Self {
        Self {
            cluster_id,
            confidence,
            deferred: true,
        }
    }

    /// The real-time assignment for `item_id`, or None if deferred.
    pub fn assignment(&self, item_id: &str) -> Option<Assignment> {
        if self.deferred {
            return None;
        }
        self.cluster_id.map(|id| Assignment {
            item_id: item_id.to_string(),
            cluster_id: Some(id),
            confidence: self.confidence,
            source: AssignmentSource::Realtime,
        })
    }
}
