//! Desired driver version from the driver DaemonSet's revision history.
//!
//! The desired version is the `controller-revision-hash` of the DaemonSet's
//! newest ControllerRevision; a pod runs the version in its own
//! `controller-revision-hash` label.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use tracing::{debug, warn};

use crate::crd::DriverSelector;
use crate::error::UpgradeError;
use crate::upgrade::{DriverPod, NodeVersion, PodRef, VersionOracle};

pub const REVISION_HASH_LABEL: &str = "controller-revision-hash";

pub struct DaemonSetOracle {
    client: kube::Client,
    selector: DriverSelector,
}

impl DaemonSetOracle {
    pub const fn new(client: kube::Client, selector: DriverSelector) -> Self {
        Self { client, selector }
    }
}

fn owned_by(owners: &[OwnerReference], uid: &str) -> bool {
    owners
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Hash of the highest-numbered revision owned by the DaemonSet `uid`.
pub fn latest_revision_hash(uid: &str, revisions: &[ControllerRevision]) -> Option<String> {
    revisions
        .iter()
        .filter(|r| owned_by(r.owner_references(), uid))
        .max_by_key(|r| r.revision)
        .and_then(|r| r.labels().get(REVISION_HASH_LABEL).cloned())
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// One entry per node running a live pod of the DaemonSet `uid`.
pub fn node_versions(uid: &str, desired: &str, pods: &[Pod]) -> Vec<NodeVersion> {
    let mut by_node: BTreeMap<String, NodeVersion> = BTreeMap::new();
    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() || !owned_by(pod.owner_references(), uid) {
            continue;
        }
        let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            continue;
        };
        let version = pod
            .labels()
            .get(REVISION_HASH_LABEL)
            .cloned()
            .unwrap_or_default();
        let entry = NodeVersion {
            node_name: node.clone(),
            desired_version: desired.to_string(),
            pod: Some(DriverPod {
                pod: PodRef::new(pod.namespace().unwrap_or_default(), pod.name_any()),
                version,
                ready: pod_is_ready(pod),
            }),
        };
        if by_node.insert(node.clone(), entry).is_some() {
            warn!(node = %node, "More than one live driver pod on node");
        }
    }
    by_node.into_values().collect()
}

#[async_trait]
impl VersionOracle for DaemonSetOracle {
    async fn observe(&self) -> Result<Vec<NodeVersion>, UpgradeError> {
        let ns = self.selector.namespace.as_str();
        let daemonsets: Api<DaemonSet> = Api::namespaced(self.client.clone(), ns);
        let revisions: Api<ControllerRevision> = Api::namespaced(self.client.clone(), ns);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);

        let selector = self.selector.label_selector();
        let list = daemonsets
            .list(&ListParams::default().labels(&selector))
            .await?;
        if list.items.is_empty() {
            warn!(namespace = ns, selector = %selector, "No driver DaemonSet found");
            return Ok(Vec::new());
        }

        let all_revisions = revisions.list(&ListParams::default()).await?.items;
        let mut observed = Vec::new();
        for ds in &list.items {
            let name = ds.name_any();
            let uid = ds.uid().unwrap_or_default();
            let Some(desired) = latest_revision_hash(&uid, &all_revisions) else {
                warn!(daemonset = %name, "DaemonSet has no ControllerRevision yet");
                continue;
            };
            let pod_selector = ds
                .spec
                .as_ref()
                .and_then(|s| s.selector.match_labels.as_ref())
                .map(|labels| {
                    labels
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            let ds_pods = pods
                .list(&ListParams::default().labels(&pod_selector))
                .await?
                .items;
            let versions = node_versions(&uid, &desired, &ds_pods);
            debug!(
                daemonset = %name,
                desired = %desired,
                nodes = versions.len(),
                "Observed driver versions"
            );
            observed.extend(versions);
        }
        Ok(observed)
    }
}
