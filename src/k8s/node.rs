//! Guarded node patches: cordon, uncordon and record metadata.
//!
//! Every write reads the node, decides on a patch, and submits it as a JSON
//! merge patch carrying the read `resourceVersion`, so a concurrent writer
//! turns into a 409 that is retried against a fresh read.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::UpgradeError;
use crate::upgrade::conflict::retry_on_conflict;
use crate::upgrade::{CordonOutcome, UncordonEngine, UncordonOutcome};

/// Node annotation marking a cordon made by us.
pub const CORDON_MARKER: &str = "duo.io/cordoned";

/// Read `name`, let `plan` pick an outcome and an optional patch, and apply
/// the patch guarded by the read resourceVersion. `plan` sees `None` when the
/// node does not exist.
pub async fn guarded_node_patch<T, P>(
    api: &Api<Node>,
    name: &str,
    plan: P,
) -> Result<T, UpgradeError>
where
    P: Fn(Option<&Node>) -> Result<(T, Option<Value>), UpgradeError>,
{
    let resource = format!("node {name}");
    let resource = resource.as_str();
    let plan = &plan;

    retry_on_conflict(resource, move || async move {
        let node = api
            .get_opt(name)
            .await
            .map_err(|e| UpgradeError::from_write(resource, e))?;
        let (outcome, patch) = plan(node.as_ref())?;
        if let (Some(mut patch), Some(node)) = (patch, node) {
            if let Some(version) = node.resource_version() {
                patch["metadata"]["resourceVersion"] = json!(version);
            }
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| UpgradeError::from_write(resource, e))?;
        }
        Ok(outcome)
    })
    .await
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

fn has_marker(node: &Node) -> bool {
    node.annotations()
        .get(CORDON_MARKER)
        .is_some_and(|v| v == "true")
}

pub fn cordon_plan(node: &Node) -> (CordonOutcome, Option<Value>) {
    match (is_unschedulable(node), has_marker(node)) {
        (true, true) => (CordonOutcome::AlreadyCordoned, None),
        (true, false) => (CordonOutcome::Preexisting, None),
        (false, _) => (
            CordonOutcome::Cordoned,
            Some(json!({
                "spec": { "unschedulable": true },
                "metadata": { "annotations": { CORDON_MARKER: "true" } }
            })),
        ),
    }
}

/// `None` when the node is already schedulable and unmarked.
pub fn uncordon_plan(node: &Node) -> Option<Value> {
    if !is_unschedulable(node) && !has_marker(node) {
        return None;
    }
    Some(json!({
        "spec": { "unschedulable": null },
        "metadata": { "annotations": { CORDON_MARKER: null } }
    }))
}

pub async fn cordon(api: &Api<Node>, name: &str) -> Result<CordonOutcome, UpgradeError> {
    let outcome = guarded_node_patch(api, name, |node| {
        let node = node.ok_or_else(|| UpgradeError::NotFound(format!("node {name}")))?;
        Ok(cordon_plan(node))
    })
    .await?;
    match outcome {
        CordonOutcome::Cordoned => info!(node = name, "Cordoned node"),
        CordonOutcome::AlreadyCordoned => debug!(node = name, "Node already cordoned by us"),
        CordonOutcome::Preexisting => info!(node = name, "Node was cordoned by someone else"),
    }
    Ok(outcome)
}

pub struct KubeUncordonEngine {
    api: Api<Node>,
}

impl KubeUncordonEngine {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl UncordonEngine for KubeUncordonEngine {
    async fn uncordon(&self, node: &str) -> Result<UncordonOutcome, UpgradeError> {
        let outcome = guarded_node_patch(&self.api, node, |current| {
            Ok(match current {
                None => (UncordonOutcome::NotFound, None),
                Some(n) => (UncordonOutcome::Uncordoned, uncordon_plan(n)),
            })
        })
        .await
        .map_err(|e| match e {
            UpgradeError::Conflict { message, .. } => UpgradeError::Uncordon {
                node: node.to_string(),
                message,
            },
            other => other,
        })?;
        info!(node, ?outcome, "Uncordon finished");
        Ok(outcome)
    }
}
