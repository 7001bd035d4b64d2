//! Kubernetes-backed implementations of the upgrade engines.

pub mod drain;
pub mod node;
pub mod oracle;
pub mod pod;
pub mod store;

use std::sync::Arc;

use crate::crd::DriverSelector;
use crate::upgrade::Engines;

/// Wire every engine to the cluster behind `client`.
pub fn build_engines(client: &kube::Client, driver: DriverSelector) -> Engines {
    Engines {
        store: Arc::new(store::NodeMetadataStore::new(client.clone())),
        drain: Arc::new(drain::KubeDrainEngine::new(client.clone())),
        pod_delete: Arc::new(pod::KubePodDeleter::new(client.clone())),
        uncordon: Arc::new(node::KubeUncordonEngine::new(client.clone())),
        oracle: Arc::new(oracle::DaemonSetOracle::new(client.clone(), driver)),
    }
}
