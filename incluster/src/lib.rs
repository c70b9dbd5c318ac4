//! Incremental assignment of streaming embeddings to semantic clusters.
//!
//! New items are matched against existing cluster centroids in real time.
//! Items that cannot be placed confidently are deferred and later
//! re-examined in micro-batches with density clustering, which can both
//! place them on existing clusters and discover new ones.
//!
//! # Usage
//!
//! ```no_run
//! use incluster::{Config, PendingItem, Pipeline};
//!
//! # async fn run() -> Result<(), incluster::ClusterError> {
//! let pipeline = Pipeline::new(Config::new(1536))?;
//!
//! // Real-time: assigned now, or deferred to the queue.
//! let decision = pipeline.assign(PendingItem::new("post-1", vec![0.0; 1536]))?;
//!
//! // Later: re-examine deferred items in a micro-batch.
//! let report = pipeline.reconcile().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Design
//!
//! [`Pipeline::assign`] never creates clusters; only reconciliation does.
//! Each reconciliation pass compares against one registry snapshot and
//! commits all of its changes at once, so a failed pass leaves the
//! registry untouched and its items queued for the next attempt.

mod assigner;
mod capability;
mod config;
mod cosine;
mod error;
mod pipeline;
mod queue;
mod reconciler;
mod registry;
mod types;

pub use assigner::{AssignerStats, RealtimeAssigner, assign, confidence};
pub use capability::{Dbscan, DensityClusterer, DimensionReducer, NOISE, RandomProjection};
pub use config::Config;
pub use cosine::cosine_similarity;
pub use error::{CapabilityError, ClusterError};
pub use pipeline::{Pipeline, PipelineStats};
pub use queue::{DeferralQueue, MemoryQueue};
pub use reconciler::{BatchReconciler, NEW_CLUSTER_CONFIDENCE, PassReport, ReconcilerStats};
pub use registry::{ChangeSet, ClusterRegistry, MemoryRegistry, Merge, NewCluster};
pub use types::{
    Assignment, AssignmentSource, Cluster, ClusterId, ClusterView, Decision, PendingItem,
    RegistryStats, Snapshot,
};
