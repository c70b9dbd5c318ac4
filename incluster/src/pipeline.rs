use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assigner::{AssignerStats, RealtimeAssigner};
use crate::capability::{DensityClusterer, DimensionReducer};
use crate::config::Config;
use crate::error::ClusterError;
use crate::queue::{DeferralQueue, MemoryQueue};
use crate::reconciler::{BatchReconciler, PassReport, ReconcilerStats};
use crate::registry::{ClusterRegistry, MemoryRegistry};
use crate::types::{Decision, PendingItem, RegistryStats, Snapshot};

/// Everything [`Pipeline::stats`] reports.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub registry: RegistryStats,
    pub assigner: AssignerStats,
    pub reconciler: ReconcilerStats,
    pub queued: usize,
}

/// Wires the registry, deferral queue, assigner and reconciler together.
///
/// `assign` is the high-frequency path and may be called from many tasks
/// at once. Reconciliation runs either on demand through `reconcile` or in
/// the background via [`Pipeline::spawn_reconcile_loop`].
pub struct Pipeline {
    cfg: Config,
    registry: Arc<dyn ClusterRegistry>,
    queue: Arc<dyn DeferralQueue>,
    assigner: RealtimeAssigner,
    reconciler: BatchReconciler,
    trigger: Notify,
}

impl Pipeline {
    /// Creates an in-memory pipeline with the built-in capabilities.
    pub fn new(cfg: Config) -> Result<Self, ClusterError> {
        let cfg = cfg.with_defaults();
        cfg.validate()?;
        let registry: Arc<dyn ClusterRegistry> =
            Arc::new(MemoryRegistry::new(cfg.dim, cfg.name_prefix.clone()));
        let reconciler = BatchReconciler::with_builtin_capabilities(Arc::clone(&registry), &cfg);
        Ok(Self::assemble(cfg, registry, Arc::new(MemoryQueue::new()), reconciler))
    }

    /// Creates a pipeline over caller-provided state and capabilities.
    pub fn with_parts(
        cfg: Config,
        registry: Arc<dyn ClusterRegistry>,
        queue: Arc<dyn DeferralQueue>,
        reducer: Arc<dyn DimensionReducer>,
        clusterer: Arc<dyn DensityClusterer>,
    ) -> Result<Self, ClusterError> {
        let cfg = cfg.with_defaults();
        cfg.validate()?;
        if registry.dim() != cfg.dim {
            return Err(ClusterError::InvalidConfig(format!(
                "registry dimension {} does not match config dim {}",
                registry.dim(),
                cfg.dim
            )));
        }
        let reconciler = BatchReconciler::new(Arc::clone(&registry), reducer, clusterer, &cfg);
        Ok(Self::assemble(cfg, registry, queue, reconciler))
    }

    fn assemble(
        cfg: Config,
        registry: Arc<dyn ClusterRegistry>,
        queue: Arc<dyn DeferralQueue>,
        reconciler: BatchReconciler,
    ) -> Self {
        Self {
            assigner: RealtimeAssigner::new(cfg.threshold),
            cfg,
            registry,
            queue,
            reconciler,
            trigger: Notify::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<dyn ClusterRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn DeferralQueue> {
        &self.queue
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.registry.snapshot()
    }

    /// Assigns one item in real time, deferring it to the queue when the
    /// confidence is too low.
    ///
    /// An item is either assigned or queued, never both. Items with the
    /// wrong dimension are rejected and not queued.
    pub fn assign(&self, item: PendingItem) -> Result<Decision, ClusterError> {
        let snapshot = self.registry.snapshot();
        let decision = self.assigner.assign(&item.embedding, &snapshot)?;
        if decision.deferred {
            self.queue.push(item);
            if self.queue.len() >= self.cfg.trigger_size {
                self.trigger.notify_one();
            }
        }
        Ok(decision)
    }

    /// Runs one reconciliation pass over the head of the queue.
    pub async fn reconcile(&self) -> Result<PassReport, ClusterError> {
        self.reconciler.drain(self.queue.as_ref()).await
    }

    /// Runs passes until the queue is empty and merges their reports.
    /// Stops at the first failed pass; its batch is back in the queue.
    pub async fn reconcile_all(&self) -> Result<PassReport, ClusterError> {
        let mut total = PassReport::default();
        while !self.queue.is_empty() {
            let report = self.reconcile().await?;
            total.assignments.extend(report.assignments);
            total.new_clusters.extend(report.new_clusters);
            total.outliers += report.outliers;
        }
        Ok(total)
    }

    /// Builds the initial clusters from a seed set on an empty registry.
    ///
    /// Seed items that fall in no dense group remain unassigned.
    pub async fn bootstrap(&self, items: &[PendingItem]) -> Result<PassReport, ClusterError> {
        let report = self.reconciler.bootstrap(items).await?;
        info!(
            items = items.len(),
            clusters = report.new_clusters.len(),
            unassigned = report.outliers,
            "pipeline: bootstrap complete"
        );
        Ok(report)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            registry: self.registry.stats(),
            assigner: self.assigner.stats(),
            reconciler: self.reconciler.stats(),
            queued: self.queue.len(),
        }
    }

    /// Spawns the background reconcile loop.
    ///
    /// A pass runs on every `reconcile_interval` tick and whenever the
    /// queue reaches `trigger_size`. Failed passes are logged and retried
    /// on the next tick. The loop exits when `cancel` fires.
    pub fn spawn_reconcile_loop(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.cfg.reconcile_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("pipeline: reconcile loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {}
                }

                if self.queue.is_empty() {
                    continue;
                }
                match self.reconcile().await {
                    Ok(report) => {
                        debug!(
                            items = report.assignments.len(),
                            new_clusters = report.new_clusters.len(),
                            outliers = report.outliers,
                            "pipeline: background pass done"
                        );
                        if self.queue.len() >= self.cfg.trigger_size {
                            self.trigger.notify_one();
                        }
                    }
                    Err(ClusterError::ReconcileInProgress) => {
                        debug!("pipeline: pass already running");
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            queued = self.queue.len(),
                            "pipeline: background pass failed"
                        );
                    }
                }
            }
        })
    }
}
