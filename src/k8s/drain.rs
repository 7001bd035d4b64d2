//! Node drain through the eviction API, in the manner of `kubectl drain`.
//!
//! Evictions respect PodDisruptionBudgets: a 429 (budget exhausted) or 500
//! (conflicting budgets) is retried on a fixed interval until the drain
//! timeout. Pods still present at the timeout are force deleted when the
//! policy allows it, otherwise the drain fails and the node stays cordoned.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams};
use kube::core::SelectorExt;
use kube::{Api, ResourceExt};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use super::node;
use crate::error::{DrainFailure, UpgradeError, api_code};
use crate::upgrade::{CordonOutcome, DrainEngine, DrainPolicy, DrainResult};

/// Pod label that exempts a workload from drains.
pub const SKIP_DRAIN_LABEL: &str = "duo.io/skip-drain";

const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";

// Evictions in flight at once, including the wait for deletion.
const CONCURRENT_EVICTIONS: usize = 5;
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Evict,
    Skip(&'static str),
    /// Uses local storage and the policy forbids losing it.
    Blocked,
}

/// Pods of a node split by what the drain does with them.
#[derive(Debug, Default)]
pub struct DrainPlan {
    pub evict: Vec<Pod>,
    pub blocked: Vec<String>,
    pub skipped: usize,
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_default(),
        pod.name_any()
    )
}

pub fn disposition(pod: &Pod, policy: &DrainPolicy) -> Disposition {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if matches!(phase, Some("Succeeded" | "Failed")) {
        return Disposition::Skip("completed");
    }
    if pod.annotations().contains_key(MIRROR_ANNOTATION) {
        return Disposition::Skip("static mirror pod");
    }
    let daemonset_owned = pod
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.kind == "DaemonSet");
    if daemonset_owned {
        return Disposition::Skip("DaemonSet member");
    }

    let labels: &BTreeMap<String, String> = pod.labels();
    if labels.get(SKIP_DRAIN_LABEL).is_some_and(|v| v == "true") {
        return Disposition::Skip("skip-drain label");
    }
    if policy.skip_selector.as_ref().is_some_and(|s| s.matches(labels)) {
        return Disposition::Skip("matches skip selector");
    }

    let uses_empty_dir = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|vols| vols.iter().any(|v| v.empty_dir.is_some()));
    if uses_empty_dir && !policy.delete_empty_dir {
        return Disposition::Blocked;
    }
    Disposition::Evict
}

/// Pods bound to `node`, narrowed server-side by the policy's pod selector.
pub fn pod_list_params(node: &str, policy: &DrainPolicy) -> ListParams {
    let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
    match &policy.pod_selector {
        Some(selector) => params.labels_from(selector),
        None => params,
    }
}

pub fn plan_drain(pods: Vec<Pod>, policy: &DrainPolicy) -> DrainPlan {
    let mut plan = DrainPlan::default();
    for pod in pods {
        match disposition(&pod, policy) {
            Disposition::Evict => plan.evict.push(pod),
            Disposition::Blocked => plan.blocked.push(pod_key(&pod)),
            Disposition::Skip(reason) => {
                debug!(pod = %pod_key(&pod), reason, "Not draining pod");
                plan.skipped += 1;
            }
        }
    }
    plan
}

enum Eviction {
    Gone(String),
    Remaining(Pod),
}

pub struct KubeDrainEngine {
    client: kube::Client,
    nodes: Api<Node>,
}

impl KubeDrainEngine {
    pub fn new(client: kube::Client) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            client,
        }
    }

    fn pod_api(&self, pod: &Pod) -> Api<Pod> {
        match pod.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }

    /// Evict `pod` and wait for it to go away, giving up at `deadline`.
    async fn evict(&self, pod: Pod, deadline: Instant) -> Eviction {
        let api = self.pod_api(&pod);
        let name = pod.name_any();
        let key = pod_key(&pod);

        loop {
            match api.evict(&name, &EvictParams::default()).await {
                Ok(_) => {
                    debug!(pod = %key, "Eviction created");
                    break;
                }
                Err(e) if api_code(&e) == Some(404) => return Eviction::Gone(key),
                Err(e) if matches!(api_code(&e), Some(429 | 500)) => {
                    if Instant::now() + EVICTION_RETRY_INTERVAL >= deadline {
                        warn!(pod = %key, error = %e, "Eviction still refused at drain timeout");
                        return Eviction::Remaining(pod);
                    }
                    debug!(
                        pod = %key,
                        error = %e,
                        "Eviction refused, likely a PodDisruptionBudget; retrying"
                    );
                    sleep(EVICTION_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    warn!(pod = %key, error = %e, "Eviction failed");
                    return Eviction::Remaining(pod);
                }
            }
        }

        let uid = pod.uid();
        loop {
            match api.get_opt(&name).await {
                Ok(None) => return Eviction::Gone(key),
                // Same name, new object: the old pod is gone.
                Ok(Some(current)) if current.uid() != uid => return Eviction::Gone(key),
                Ok(Some(_)) => debug!(pod = %key, "Pod not deleted yet"),
                Err(e) => debug!(pod = %key, error = %e, "Could not check pod deletion"),
            }
            let now = Instant::now();
            if now >= deadline {
                return Eviction::Remaining(pod);
            }
            sleep(DELETION_CHECK_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn force_delete(&self, pod: &Pod) -> Result<(), kube::Error> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        match self.pod_api(pod).delete(&pod.name_any(), &params).await {
            Err(e) if api_code(&e) != Some(404) => Err(e),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DrainEngine for KubeDrainEngine {
    async fn cordon(&self, node: &str) -> Result<CordonOutcome, UpgradeError> {
        node::cordon(&self.nodes, node).await
    }

    async fn drain(&self, node: &str, policy: &DrainPolicy) -> Result<DrainResult, UpgradeError> {
        let deadline = Instant::now() + policy.timeout;
        let failure = |reason: DrainFailure, message: String, remaining_pods: Vec<String>| {
            UpgradeError::Drain {
                node: node.to_string(),
                reason,
                message,
                remaining_pods,
            }
        };

        self.cordon(node)
            .await
            .map_err(|e| failure(DrainFailure::Cordon, e.to_string(), Vec::new()))?;

        let pods = Api::<Pod>::all(self.client.clone())
            .list(&pod_list_params(node, policy))
            .await
            .map_err(|e| failure(DrainFailure::ListPods, e.to_string(), Vec::new()))?;

        let plan = plan_drain(pods.items, policy);
        if !plan.blocked.is_empty() {
            return Err(failure(
                DrainFailure::LocalStorage,
                format!(
                    "{} pod(s) use emptyDir and deleteEmptyDir is off",
                    plan.blocked.len()
                ),
                plan.blocked,
            ));
        }

        info!(node, pods = plan.evict.len(), skipped = plan.skipped, "Draining node");
        let evictions: Vec<_> = plan
            .evict
            .into_iter()
            .map(|pod| self.evict(pod, deadline))
            .collect();
        let results: Vec<Eviction> = stream::iter(evictions)
            .buffer_unordered(CONCURRENT_EVICTIONS)
            .collect()
            .await;

        let mut drained = DrainResult {
            skipped: plan.skipped,
            ..DrainResult::default()
        };
        let mut remaining = Vec::new();
        for result in results {
            match result {
                Eviction::Gone(key) => drained.evicted.push(key),
                Eviction::Remaining(pod) => remaining.push(pod),
            }
        }
        if remaining.is_empty() {
            return Ok(drained);
        }

        if !policy.force {
            let keys: Vec<String> = remaining.iter().map(pod_key).collect();
            return Err(failure(
                DrainFailure::Timeout,
                format!("{} pod(s) still present after drain timeout", keys.len()),
                keys,
            ));
        }

        let mut stuck = Vec::new();
        for pod in &remaining {
            let key = pod_key(pod);
            match self.force_delete(pod).await {
                Ok(()) => {
                    warn!(node, pod = %key, "Force deleted pod after drain timeout");
                    drained.force_deleted.push(key);
                }
                Err(e) => {
                    warn!(node, pod = %key, error = %e, "Force delete failed");
                    stuck.push(key);
                }
            }
        }
        if stuck.is_empty() {
            Ok(drained)
        } else {
            Err(failure(
                DrainFailure::Timeout,
                format!("{} pod(s) could not be force deleted", stuck.len()),
                stuck,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{Expression, Selector};
    use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, PodSpec, PodStatus, Volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("apps".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..PodStatus::default()
            }),
        }
    }

    fn with_labels(mut pod: Pod, labels: &[(&str, &str)]) -> Pod {
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
        pod
    }

    fn with_empty_dir(mut pod: Pod) -> Pod {
        pod.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        }]);
        pod
    }

    #[test]
    fn test_plain_pod_is_evicted() {
        assert_eq!(
            disposition(&pod("web-0"), &DrainPolicy::default()),
            Disposition::Evict
        );
    }

    #[test]
    fn test_completed_pod_is_skipped() {
        let mut p = pod("job-1");
        p.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        assert_eq!(
            disposition(&p, &DrainPolicy::default()),
            Disposition::Skip("completed")
        );
    }

    #[test]
    fn test_daemonset_and_mirror_pods_are_skipped() {
        let mut ds = pod("driver-abc");
        ds.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            name: "driver".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            ..OwnerReference::default()
        }]);
        assert!(matches!(
            disposition(&ds, &DrainPolicy::default()),
            Disposition::Skip(_)
        ));

        let mut mirror = pod("etcd-node");
        mirror.metadata.annotations = Some(BTreeMap::from([(
            MIRROR_ANNOTATION.to_string(),
            "hash".to_string(),
        )]));
        assert!(matches!(
            disposition(&mirror, &DrainPolicy::default()),
            Disposition::Skip(_)
        ));
    }

    #[test]
    fn test_skip_label_and_selector() {
        let policy = DrainPolicy {
            skip_selector: Some(Selector::from(Expression::Exists("keep".to_string()))),
            ..DrainPolicy::default()
        };
        let skip_labelled = with_labels(pod("a"), &[(SKIP_DRAIN_LABEL, "true"), ("tier", "batch")]);
        let kept = with_labels(pod("b"), &[("tier", "batch"), ("keep", "")]);
        let target = with_labels(pod("d"), &[("tier", "batch")]);

        assert!(matches!(disposition(&skip_labelled, &policy), Disposition::Skip(_)));
        assert_eq!(
            disposition(&kept, &policy),
            Disposition::Skip("matches skip selector")
        );
        assert_eq!(disposition(&target, &policy), Disposition::Evict);
    }

    #[test]
    fn test_pod_selector_goes_to_the_api_server() {
        let params = pod_list_params("gpu-07", &DrainPolicy::default());
        assert_eq!(params.field_selector.as_deref(), Some("spec.nodeName=gpu-07"));
        assert!(params.label_selector.is_none());

        let policy = DrainPolicy {
            pod_selector: Some(Selector::from(Expression::In(
                "tier".to_string(),
                ["batch".to_string(), "etl".to_string()].into(),
            ))),
            ..DrainPolicy::default()
        };
        let params = pod_list_params("gpu-07", &policy);
        assert_eq!(params.label_selector.as_deref(), Some("tier in (batch,etl)"));
    }

    #[test]
    fn test_empty_dir_blocks_unless_allowed() {
        let p = with_empty_dir(pod("cache-0"));
        assert_eq!(
            disposition(&p, &DrainPolicy::default()),
            Disposition::Blocked
        );
        let allow = DrainPolicy {
            delete_empty_dir: true,
            ..DrainPolicy::default()
        };
        assert_eq!(disposition(&p, &allow), Disposition::Evict);
    }

    #[test]
    fn test_plan_drain_splits_pods() {
        let mut done = pod("job-1");
        done.status.as_mut().unwrap().phase = Some("Failed".to_string());
        let plan = plan_drain(
            vec![pod("web-0"), with_empty_dir(pod("cache-0")), done],
            &DrainPolicy::default(),
        );
        assert_eq!(plan.evict.len(), 1);
        assert_eq!(plan.blocked, vec!["apps/cache-0"]);
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn test_plan_drain_of_empty_node() {
        let plan = plan_drain(Vec::new(), &DrainPolicy::default());
        assert!(plan.evict.is_empty());
        assert!(plan.blocked.is_empty());
        assert_eq!(plan.skipped, 0);
    }
}
