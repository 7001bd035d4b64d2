//! Capabilities the coordinator drives.
//!
//! Each trait has a Kubernetes implementation in [`crate::k8s`] and an
//! in-memory fake used by the coordinator tests.

use std::sync::Arc;

use async_trait::async_trait;

use super::policy::DrainPolicy;
use super::record::{NodeUpgradeRecord, PodRef};
use crate::error::UpgradeError;

/// Persists upgrade records on nodes.
#[async_trait]
pub trait UpgradeStateStore: Send + Sync {
    /// Returns an untracked record when the node carries none or does not exist.
    async fn get(&self, node: &str) -> Result<NodeUpgradeRecord, UpgradeError>;

    async fn set(&self, node: &str, record: &NodeUpgradeRecord) -> Result<(), UpgradeError>;

    async fn clear(&self, node: &str) -> Result<(), UpgradeError>;

    /// Every node that currently carries a record.
    async fn list_tracked(&self) -> Result<Vec<NodeUpgradeRecord>, UpgradeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CordonOutcome {
    /// We made the node unschedulable.
    Cordoned,
    /// Our marker was already there.
    AlreadyCordoned,
    /// Someone else cordoned the node before us.
    Preexisting,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainResult {
    pub evicted: Vec<String>,
    pub force_deleted: Vec<String>,
    pub skipped: usize,
}

#[async_trait]
pub trait DrainEngine: Send + Sync {
    async fn cordon(&self, node: &str) -> Result<CordonOutcome, UpgradeError>;

    /// Cordon (idempotent) then evict every non-exempt pod on `node`.
    async fn drain(&self, node: &str, policy: &DrainPolicy) -> Result<DrainResult, UpgradeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[async_trait]
pub trait PodDeleteEngine: Send + Sync {
    async fn delete_pod(
        &self,
        pod: &PodRef,
        grace_period_seconds: Option<u32>,
    ) -> Result<DeleteOutcome, UpgradeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UncordonOutcome {
    Uncordoned,
    NotFound,
}

#[async_trait]
pub trait UncordonEngine: Send + Sync {
    async fn uncordon(&self, node: &str) -> Result<UncordonOutcome, UpgradeError>;
}

/// The driver pod currently running on a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverPod {
    pub pod: PodRef,
    pub version: String,
    pub ready: bool,
}

/// What a node runs versus what it should run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeVersion {
    pub node_name: String,
    pub desired_version: String,
    pub pod: Option<DriverPod>,
}

impl NodeVersion {
    /// A node without a driver pod has nothing to upgrade.
    pub fn needs_upgrade(&self) -> bool {
        self.pod
            .as_ref()
            .is_some_and(|p| p.version != self.desired_version)
    }

    /// The new driver is in place and serving.
    pub fn is_upgraded_and_ready(&self) -> bool {
        self.pod
            .as_ref()
            .is_some_and(|p| p.version == self.desired_version && p.ready)
    }
}

/// Source of truth for which driver version each node should run.
#[async_trait]
pub trait VersionOracle: Send + Sync {
    /// One entry per node that is eligible to run the driver.
    async fn observe(&self) -> Result<Vec<NodeVersion>, UpgradeError>;
}

/// The full set of capabilities handed to the coordinator.
#[derive(Clone)]
pub struct Engines {
    pub store: Arc<dyn UpgradeStateStore>,
    pub drain: Arc<dyn DrainEngine>,
    pub pod_delete: Arc<dyn PodDeleteEngine>,
    pub uncordon: Arc<dyn UncordonEngine>,
    pub oracle: Arc<dyn VersionOracle>,
}
