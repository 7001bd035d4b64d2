//! Upgrade records persisted as node label + annotation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use serde_json::{Value, json};

use super::node::guarded_node_patch;
use crate::error::UpgradeError;
use crate::upgrade::UpgradeStateStore;
use crate::upgrade::record::{NodeUpgradeRecord, RECORD_ANNOTATION, STATE_LABEL};

pub struct NodeMetadataStore {
    api: Api<Node>,
}

impl NodeMetadataStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    async fn write(&self, node: &str, payload: Option<&(String, String)>) -> Result<(), UpgradeError> {
        let patch = record_patch(payload);
        guarded_node_patch(&self.api, node, |current| match current {
            None => Err(UpgradeError::Conflict {
                resource: format!("node {node}"),
                message: "deleted concurrently".to_string(),
            }),
            Some(_) => Ok(((), Some(patch.clone()))),
        })
        .await
    }
}

fn record_of(node: &Node) -> NodeUpgradeRecord {
    NodeUpgradeRecord::from_metadata(
        &node.name_any(),
        node.labels().get(STATE_LABEL).map(String::as_str),
        node.annotations().get(RECORD_ANNOTATION).map(String::as_str),
    )
}

/// Merge patch setting (or, for `None`, removing) the state label and record annotation.
fn record_patch(payload: Option<&(String, String)>) -> Value {
    let (label, record) = payload.map_or((Value::Null, Value::Null), |(l, r)| {
        (json!(l), json!(r))
    });
    json!({
        "metadata": {
            "labels": { STATE_LABEL: label },
            "annotations": { RECORD_ANNOTATION: record }
        }
    })
}

#[async_trait]
impl UpgradeStateStore for NodeMetadataStore {
    async fn get(&self, node: &str) -> Result<NodeUpgradeRecord, UpgradeError> {
        let current = self.api.get_opt(node).await?;
        Ok(current.map_or_else(|| NodeUpgradeRecord::untracked(node), |n| record_of(&n)))
    }

    async fn set(&self, node: &str, record: &NodeUpgradeRecord) -> Result<(), UpgradeError> {
        let payload = record.to_metadata()?;
        self.write(node, Some(&payload)).await
    }

    async fn clear(&self, node: &str) -> Result<(), UpgradeError> {
        self.write(node, None).await
    }

    async fn list_tracked(&self) -> Result<Vec<NodeUpgradeRecord>, UpgradeError> {
        let nodes = self
            .api
            .list(&ListParams::default().labels(STATE_LABEL))
            .await?;
        Ok(nodes.items.iter().map(record_of).collect())
    }
}
