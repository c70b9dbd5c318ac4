use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assigner::{check_embedding, nearest};
use crate::capability::{Dbscan, DensityClusterer, DimensionReducer, NOISE, RandomProjection};
use crate::config::Config;
use crate::cosine::{mean, vector_sum};
use crate::error::{CapabilityError, ClusterError};
use crate::queue::DeferralQueue;
use crate::registry::{ChangeSet, ClusterRegistry, Merge, NewCluster};
use crate::types::{Assignment, AssignmentSource, ClusterId, PendingItem};

/// Confidence attached to members of a newly discovered cluster. Marks
/// "found by density clustering", not "passed a threshold".
pub const NEW_CLUSTER_CONFIDENCE: f32 = 0.9;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    /// One assignment per batch item, in batch order. Outliers carry
    /// `cluster_id: None`.
    pub assignments: Vec<Assignment>,

    /// Clusters created by this pass, in creation order.
    pub new_clusters: Vec<ClusterId>,
    pub outliers: usize,
}

impl PassReport {
    /// Number of items that ended up in a cluster.
    pub fn assigned(&self) -> usize {
        self.assignments.len() - self.outliers
    }
}

/// Cumulative counters over all passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcilerStats {
    pub batches_processed: u64,
    pub items_assigned: u64,
    pub new_clusters_created: u64,
    pub outliers: u64,
    pub failed_passes: u64,
}

/// Where one batch item goes, decided before the commit.
enum Slot {
    Nearest(ClusterId, f32),
    Group(i32),
    Outlier,
}

/// Re-examines deferred items in micro-batches.
///
/// Each pass reduces and density-clusters the batch, places noise items on
/// the nearest existing centroid, turns large enough groups into new
/// clusters and commits every registry change at once. Passes are not
/// reentrant: a call made while another pass is running fails with
/// [`ClusterError::ReconcileInProgress`].
pub struct BatchReconciler {
    registry: Arc<dyn ClusterRegistry>,
    reducer: Arc<dyn DimensionReducer>,
    clusterer: Arc<dyn DensityClusterer>,

    min_cluster_size: usize,
    batch_size: usize,
    reduce_above: usize,
    reduce_dim: usize,
    timeout: Duration,

    pass_lock: tokio::sync::Mutex<()>,
    stats: Mutex<ReconcilerStats>,
}

impl BatchReconciler {
    pub fn new(
        registry: Arc<dyn ClusterRegistry>,
        reducer: Arc<dyn DimensionReducer>,
        clusterer: Arc<dyn DensityClusterer>,
        cfg: &Config,
    ) -> Self {
        Self {
            registry,
            reducer,
            clusterer,
            min_cluster_size: cfg.min_cluster_size,
            batch_size: cfg.batch_size,
            reduce_above: cfg.reduce_above,
            reduce_dim: cfg.reduce_dim,
            timeout: cfg.clustering_timeout(),
            pass_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(ReconcilerStats::default()),
        }
    }

    /// Creates a reconciler backed by the built-in random projection and
    /// cosine DBSCAN.
    pub fn with_builtin_capabilities(registry: Arc<dyn ClusterRegistry>, cfg: &Config) -> Self {
        Self::new(
            registry,
            Arc::new(RandomProjection::new(cfg.seed)),
            Arc::new(Dbscan::new(cfg.dbscan_eps)),
            cfg,
        )
    }

    /// Reconciles the given batch against the registry.
    ///
    /// On error nothing has been committed and the caller still owns the
    /// batch.
    pub async fn reconcile(&self, batch: &[PendingItem]) -> Result<PassReport, ClusterError> {
        let _pass = self
            .pass_lock
            .try_lock()
            .map_err(|_| ClusterError::ReconcileInProgress)?;
        self.run_pass(batch).await
    }

    /// Runs the first pass over a seed set. Fails with
    /// [`ClusterError::AlreadyBootstrapped`] unless the registry is empty
    /// once the pass lock is held.
    pub async fn bootstrap(&self, seed: &[PendingItem]) -> Result<PassReport, ClusterError> {
        let _pass = self
            .pass_lock
            .try_lock()
            .map_err(|_| ClusterError::ReconcileInProgress)?;
        if !self.registry.snapshot().is_empty() {
            return Err(ClusterError::AlreadyBootstrapped);
        }
        self.run_pass(seed).await
    }

    /// Pops up to `batch_size` items from `queue` and reconciles them.
    /// If the pass fails the items are restored to the head of the queue.
    pub async fn drain(&self, queue: &dyn DeferralQueue) -> Result<PassReport, ClusterError> {
        let _pass = self
            .pass_lock
            .try_lock()
            .map_err(|_| ClusterError::ReconcileInProgress)?;

        let batch = queue.pop_batch(self.batch_size);
        if batch.is_empty() {
            return Ok(PassReport::default());
        }
        match self.run_pass(&batch).await {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(
                    items = batch.len(),
                    error = %err,
                    "reconciler: pass failed, restoring batch"
                );
                queue.restore(batch);
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats.lock().clone()
    }

    async fn run_pass(&self, batch: &[PendingItem]) -> Result<PassReport, ClusterError> {
        let result = self.pass(batch).await;
        let mut stats = self.stats.lock();
        match &result {
            Ok(report) if !batch.is_empty() => {
                stats.batches_processed += 1;
                stats.items_assigned += report.assigned() as u64;
                stats.new_clusters_created += report.new_clusters.len() as u64;
                stats.outliers += report.outliers as u64;
            }
            Ok(_) => {}
            Err(_) => stats.failed_passes += 1,
        }
        result
    }

    async fn pass(&self, batch: &[PendingItem]) -> Result<PassReport, ClusterError> {
        if batch.is_empty() {
            return Ok(PassReport::default());
        }

        let dim = self.registry.dim();
        for item in batch {
            check_embedding(&item.embedding, dim)?;
        }

        if batch.len() < self.min_cluster_size {
            debug!(
                items = batch.len(),
                min_cluster_size = self.min_cluster_size,
                "reconciler: batch too small, all outliers"
            );
            return Ok(PassReport {
                assignments: batch.iter().map(|i| Assignment::outlier(&i.item_id)).collect(),
                new_clusters: Vec::new(),
                outliers: batch.len(),
            });
        }

        // Every comparison in this pass sees the registry as of now.
        let snapshot = self.registry.snapshot();

        let embeddings: Vec<Vec<f32>> = batch.iter().map(|i| i.embedding.clone()).collect();
        let labels = self.label(&embeddings).await?;

        let mut slots = Vec::with_capacity(batch.len());
        let mut merge_members: BTreeMap<ClusterId, Vec<usize>> = BTreeMap::new();
        let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            if label != NOISE {
                groups.entry(label).or_default().push(i);
                slots.push(Slot::Group(label));
                continue;
            }
            match nearest(&embeddings[i], &snapshot) {
                Some((id, sim)) => {
                    merge_members.entry(id).or_default().push(i);
                    slots.push(Slot::Nearest(id, sim));
                }
                None => slots.push(Slot::Outlier),
            }
        }

        let mut changes = ChangeSet::default();
        for (id, members) in &merge_members {
            changes.merges.push(Merge {
                cluster_id: *id,
                sum: vector_sum(dim, members.iter().map(|&i| embeddings[i].as_slice())),
                count: members.len(),
            });
        }
        let mut kept_labels = Vec::new();
        for (label, members) in &groups {
            if members.len() < self.min_cluster_size {
                debug!(
                    label,
                    size = members.len(),
                    "reconciler: group too small, demoted to outliers"
                );
                continue;
            }
            changes.new_clusters.push(NewCluster {
                centroid: mean(dim, members.iter().map(|&i| embeddings[i].as_slice())),
                member_count: members.len(),
                name: String::new(),
            });
            kept_labels.push(*label);
        }

        let new_ids = self.registry.apply(changes)?;
        let label_ids: BTreeMap<i32, ClusterId> = kept_labels
            .into_iter()
            .zip(new_ids.iter().copied())
            .collect();

        let mut outliers = 0;
        let assignments: Vec<Assignment> = batch
            .iter()
            .zip(slots)
            .map(|(item, slot)| match slot {
                Slot::Nearest(id, sim) => Assignment {
                    item_id: item.item_id.clone(),
                    cluster_id: Some(id),
                    confidence: sim,
                    source: AssignmentSource::NearestCentroid,
                },
                Slot::Group(label) => match label_ids.get(&label) {
                    Some(&id) => Assignment {
                        item_id: item.item_id.clone(),
                        cluster_id: Some(id),
                        confidence: NEW_CLUSTER_CONFIDENCE,
                        source: AssignmentSource::NewCluster,
                    },
                    None => {
                        outliers += 1;
                        Assignment::outlier(&item.item_id)
                    }
                },
                Slot::Outlier => {
                    outliers += 1;
                    Assignment::outlier(&item.item_id)
                }
            })
            .collect();

        for id in &new_ids {
            info!(cluster = %id, "reconciler: new cluster");
        }
        info!(
            items = batch.len(),
            merged = merge_members.values().map(Vec::len).sum::<usize>(),
            new_clusters = new_ids.len(),
            outliers,
            "reconciler: pass complete"
        );

        Ok(PassReport {
            assignments,
            new_clusters: new_ids,
            outliers,
        })
    }

    /// Runs optional reduction and density clustering with timeouts.
    async fn label(&self, embeddings: &[Vec<f32>]) -> Result<Vec<i32>, ClusterError> {
        let n = embeddings.len();

        let reduced = if n > self.reduce_above {
            let target = self.reduce_dim.min(n.saturating_sub(2)).max(1);
            debug!(items = n, target, "reconciler: reducing dimensions");
            let out = self
                .bounded("dimension reduction", self.reducer.reduce(embeddings, target))
                .await?;
            if out.len() != n {
                return Err(ClusterError::ClusteringUnavailable(format!(
                    "reducer returned {} vectors for {n} inputs",
                    out.len()
                )));
            }
            Some(out)
        } else {
            None
        };
        let input = reduced.as_deref().unwrap_or(embeddings);

        let labels = self
            .bounded(
                "density clustering",
                self.clusterer.cluster(input, self.min_cluster_size),
            )
            .await?;
        if labels.len() != n {
            return Err(ClusterError::ClusteringUnavailable(format!(
                "clusterer returned {} labels for {n} inputs",
                labels.len()
            )));
        }
        Ok(labels)
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "reconciler: {what} timed out");
                Err(ClusterError::ClusteringUnavailable(format!(
                    "{what} timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}
