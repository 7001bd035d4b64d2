//! `DriverUpgradePolicy` CRD type definition.

pub mod spec;
pub mod status;
pub mod types;

pub use spec::{
    BackoffSpec, DrainSpec, DriverSelector, DriverUpgradePolicy, DriverUpgradePolicySpec,
    PodDeletionSpec, RetrySpec, WaitForReadySpec,
};
pub use status::{DriverUpgradePolicyStatus, FailedNodeStatus, PolicyCondition};
pub use types::UpgradeState;
