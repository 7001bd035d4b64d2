//! `DriverUpgradePolicy` spec types.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::DriverUpgradePolicyStatus;

/// `DriverUpgradePolicy` describes how a driver DaemonSet is rolled out across nodes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "duo.io",
    version = "v1alpha1",
    kind = "DriverUpgradePolicy",
    shortname = "dup",
    status = "DriverUpgradePolicyStatus",
    printcolumn = r#"{"name":"AUTO","type":"boolean","jsonPath":".spec.autoUpgrade"}"#,
    printcolumn = r#"{"name":"PARALLEL","type":"integer","jsonPath":".spec.maxParallelUpgrades"}"#,
    printcolumn = r#"{"name":"IN-PROGRESS","type":"integer","jsonPath":".status.inProgress"}"#,
    printcolumn = r#"{"name":"FAILED","type":"integer","jsonPath":".status.nodeCounts.Failed"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DriverUpgradePolicySpec {
    /// Roll out new driver revisions automatically. When false no node is touched.
    #[serde(default)]
    pub auto_upgrade: bool,

    /// Maximum number of nodes upgrading at once (0 = unlimited).
    #[serde(default = "default_max_parallel")]
    pub max_parallel_upgrades: u32,

    /// Which DaemonSet pods are the driver being upgraded.
    pub driver: DriverSelector,

    #[serde(default)]
    pub drain: DrainSpec,

    #[serde(default)]
    pub pod_deletion: PodDeletionSpec,

    #[serde(default)]
    pub wait_for_ready: WaitForReadySpec,

    #[serde(default)]
    pub retry: RetrySpec,
}

/// Selects the driver pods by namespace and labels.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverSelector {
    pub namespace: String,

    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl DriverSelector {
    /// Render `matchLabels` as a list selector (`k1=v1,k2=v2`).
    pub fn label_selector(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Drain behaviour for nodes being upgraded.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrainSpec {
    /// Evict workloads before restarting the driver.
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Delete pods that are still present when the drain timeout fires.
    #[serde(default)]
    pub force: bool,

    #[serde(default = "default_drain_timeout")]
    pub timeout_seconds: u64,

    /// Evict pods that use `emptyDir` volumes (their data is lost).
    #[serde(default)]
    pub delete_empty_dir: bool,

    /// Only evict pods matching this label selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    /// Never evict pods matching this label selector. An empty selector skips nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_selector: Option<LabelSelector>,
}

impl Default for DrainSpec {
    fn default() -> Self {
        Self {
            enable: true,
            force: false,
            timeout_seconds: default_drain_timeout(),
            delete_empty_dir: false,
            pod_selector: None,
            skip_selector: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDeletionSpec {
    /// Grace period for deleting the old driver pod. Pod default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WaitForReadySpec {
    /// How long the new driver pod may stay unready before attempts start failing.
    #[serde(default = "default_ready_timeout")]
    pub timeout_seconds: u64,
}

impl Default for WaitForReadySpec {
    fn default() -> Self {
        Self {
            timeout_seconds: default_ready_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    /// Consecutive failed attempts before a node is marked Failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffSpec,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffSpec::default(),
        }
    }
}

/// Delay between failed attempts on the same node.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum BackoffSpec {
    Fixed { seconds: u64 },
    Exponential { base_seconds: u64, max_seconds: u64 },
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self::Exponential {
            base_seconds: 10,
            max_seconds: 300,
        }
    }
}

const fn default_true() -> bool {
    true
}
const fn default_max_parallel() -> u32 {
    1
}
const fn default_drain_timeout() -> u64 {
    300
}
const fn default_ready_timeout() -> u64 {
    600
}
const fn default_max_attempts() -> u32 {
    5
}
