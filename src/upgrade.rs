//! Node upgrade state machine and the cluster-wide coordinator.

pub mod backoff;
pub mod conflict;
pub mod coordinator;
pub mod engine;
pub mod policy;
pub mod record;

#[cfg(test)]
pub mod fake;

pub use coordinator::{ClusterUpgradeCoordinator, CycleReport};
pub use engine::{
    CordonOutcome, DeleteOutcome, DrainEngine, DrainResult, DriverPod, Engines, NodeVersion,
    PodDeleteEngine, UncordonEngine, UncordonOutcome, UpgradeStateStore, VersionOracle,
};
pub use policy::{DrainPolicy, UpgradePolicy};
pub use record::PodRef;
