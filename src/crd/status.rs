//! `DriverUpgradePolicy` status types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Observed state of the rollout, written after every cycle.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverUpgradePolicyStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cycle_time: Option<DateTime<Utc>>,

    /// Number of managed nodes per upgrade state.
    /// Every state is always present (zero included) so a merge patch
    /// overwrites stale counts instead of leaving them behind.
    #[serde(default)]
    pub node_counts: BTreeMap<String, u32>,

    /// Nodes currently cordoned, draining or waiting for the driver.
    #[serde(default)]
    pub in_progress: u32,

    /// Nodes that exhausted their retry budget.
    #[serde(default)]
    pub failed_nodes: Vec<FailedNodeStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PolicyCondition>,

    /// Human-readable summary of the last cycle.
    /// NOTE: No `skip_serializing_if` so that `None` clears a stale message
    /// under JSON Merge Patch.
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailedNodeStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

/// Standard Kubernetes-style condition.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCondition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}
