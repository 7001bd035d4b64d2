//! In-memory cluster implementing every engine, with fault injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::conflict::retry_on_conflict;
use super::engine::{
    CordonOutcome, DeleteOutcome, DrainEngine, DrainResult, DriverPod, Engines, NodeVersion,
    PodDeleteEngine, UncordonEngine, UncordonOutcome, UpgradeStateStore, VersionOracle,
};
use super::policy::DrainPolicy;
use super::record::{NodeUpgradeRecord, PodRef};
use crate::crd::UpgradeState;
use crate::error::{DrainFailure, UpgradeError};

const DRIVER_NAMESPACE: &str = "drivers";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Cordon,
    Drain,
    Delete,
    Uncordon,
    Set,
    Clear,
    Observe,
    List,
}

struct FakePod {
    name: String,
    version: String,
    ready: bool,
}

struct FakeNode {
    unschedulable: bool,
    cordon_marker: bool,
    label: Option<String>,
    record: Option<String>,
    resource_version: u64,
    driver: Option<FakePod>,
    workloads: Vec<String>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, FakeNode>,
    desired: String,
    recreate_ready: bool,
    calls: HashMap<Op, u32>,
    failures: HashMap<(Op, String), u32>,
    slow: HashMap<(Op, String), Duration>,
    conflicts: HashMap<String, u32>,
    /// Nodes the interleaved writer cordons instead of only bumping the version.
    foreign_cordons: HashSet<String>,
    /// Nodes whose workloads never leave (a disruption budget that stays exhausted).
    blocked_drains: HashSet<String>,
}

impl Inner {
    /// Let another writer touch `node` if a conflict is pending for it.
    fn interleave(&mut self, node: &str) {
        let hit = self.conflicts.get_mut(node).is_some_and(|remaining| {
            let hit = *remaining > 0;
            *remaining = remaining.saturating_sub(1);
            hit
        });
        if !hit {
            return;
        }
        let foreign_cordon = self.foreign_cordons.remove(node);
        if let Some(n) = self.nodes.get_mut(node) {
            n.resource_version += 1;
            if foreign_cordon {
                n.unschedulable = true;
            }
        }
    }
}

/// The node fields a cordon or uncordon reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Schedulability {
    unschedulable: bool,
    marker: bool,
}

fn conflict(node: &str, message: &str) -> UpgradeError {
    UpgradeError::Conflict {
        resource: format!("node {node}"),
        message: message.to_string(),
    }
}

pub struct FakeCluster {
    inner: Mutex<Inner>,
}

fn pod_name(node: &str, version: &str) -> String {
    format!("driver-{node}-{version}")
}

fn injected(op: Op, node: &str) -> UpgradeError {
    let message = "injected failure".to_string();
    match op {
        Op::Cordon => UpgradeError::Drain {
            node: node.to_string(),
            reason: DrainFailure::Cordon,
            message,
            remaining_pods: Vec::new(),
        },
        Op::Drain => UpgradeError::Drain {
            node: node.to_string(),
            reason: DrainFailure::Timeout,
            message,
            remaining_pods: vec!["default/web-0".to_string()],
        },
        Op::Delete => UpgradeError::Delete {
            pod: node.to_string(),
            message,
        },
        Op::Uncordon => UpgradeError::Uncordon {
            node: node.to_string(),
            message,
        },
        Op::Set | Op::Clear => UpgradeError::Store {
            node: node.to_string(),
            message,
        },
        Op::Observe | Op::List => UpgradeError::Snapshot(message),
    }
}

impl FakeCluster {
    /// `count` nodes named `node-00`, `node-01`, ... each running the driver
    /// at `current` with a ready pod and one evictable workload.
    pub fn with_nodes(count: usize, current: &str, desired: &str) -> Arc<Self> {
        let nodes = (0..count)
            .map(|i| {
                let name = format!("node-{i:02}");
                let node = FakeNode {
                    unschedulable: false,
                    cordon_marker: false,
                    label: None,
                    record: None,
                    resource_version: 1,
                    driver: Some(FakePod {
                        name: pod_name(&name, current),
                        version: current.to_string(),
                        ready: true,
                    }),
                    workloads: vec![format!("default/web-{i}")],
                };
                (name, node)
            })
            .collect();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                nodes,
                desired: desired.to_string(),
                recreate_ready: true,
                ..Inner::default()
            }),
        })
    }

    pub fn engines(self: &Arc<Self>) -> Engines {
        Engines {
            store: self.clone(),
            drain: self.clone(),
            pod_delete: self.clone(),
            uncordon: self.clone(),
            oracle: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Fail the next `times` calls of `op` on `node`.
    pub fn fail_next(&self, op: Op, node: &str, times: u32) {
        self.lock().failures.insert((op, node.to_string()), times);
    }

    /// Delay every call of `op` on `node`.
    pub fn slow(&self, op: Op, node: &str, delay: Duration) {
        self.lock().slow.insert((op, node.to_string()), delay);
    }

    /// Have another writer modify `node` between our read and write, `times` times.
    pub fn inject_conflicts(&self, node: &str, times: u32) {
        self.lock().conflicts.insert(node.to_string(), times);
    }

    /// Have another actor cordon `node` between our next read and write.
    pub fn cordon_concurrently(&self, node: &str) {
        let mut inner = self.lock();
        *inner.conflicts.entry(node.to_string()).or_default() += 1;
        inner.foreign_cordons.insert(node.to_string());
    }

    /// Make drains of `node` run into their timeout with pods left behind.
    pub fn block_drain(&self, node: &str) {
        self.lock().blocked_drains.insert(node.to_string());
    }

    pub fn has_cordon_marker(&self, node: &str) -> bool {
        self.lock().nodes[node].cordon_marker
    }

    pub fn set_recreate_ready(&self, ready: bool) {
        self.lock().recreate_ready = ready;
    }

    pub fn set_pod_ready(&self, node: &str, ready: bool) {
        if let Some(pod) = self
            .lock()
            .nodes
            .get_mut(node)
            .and_then(|n| n.driver.as_mut())
        {
            pod.ready = ready;
        }
    }

    /// Cordon `node` the way an operator would, without our marker.
    pub fn set_unschedulable(&self, node: &str, unschedulable: bool) {
        if let Some(n) = self.lock().nodes.get_mut(node) {
            n.unschedulable = unschedulable;
        }
    }

    pub fn seed_record(&self, record: &NodeUpgradeRecord) {
        let (label, json) = record.to_metadata().unwrap();
        let mut inner = self.lock();
        let node = inner.nodes.get_mut(&record.node_name).unwrap();
        node.label = Some(label);
        node.record = Some(json);
    }

    /// Operator recovery: drop the label and annotation.
    pub fn clear_record(&self, node: &str) {
        let mut inner = self.lock();
        let n = inner.nodes.get_mut(node).unwrap();
        n.label = None;
        n.record = None;
    }

    pub fn record_of(&self, node: &str) -> NodeUpgradeRecord {
        let inner = self.lock();
        let n = &inner.nodes[node];
        NodeUpgradeRecord::from_metadata(node, n.label.as_deref(), n.record.as_deref())
    }

    pub fn state_of(&self, node: &str) -> UpgradeState {
        self.record_of(node).state
    }

    pub fn is_tracked(&self, node: &str) -> bool {
        self.lock().nodes[node].label.is_some()
    }

    pub fn is_unschedulable(&self, node: &str) -> bool {
        self.lock().nodes[node].unschedulable
    }

    pub fn driver_version(&self, node: &str) -> Option<String> {
        self.lock().nodes[node]
            .driver
            .as_ref()
            .map(|p| p.version.clone())
    }

    pub fn calls(&self, op: Op) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Nodes whose persisted state counts against the parallelism budget.
    pub fn in_flight(&self) -> usize {
        self.lock()
            .nodes
            .values()
            .filter_map(|n| n.label.as_deref())
            .filter_map(UpgradeState::from_label_value)
            .filter(|s| s.is_in_flight())
            .count()
    }

    async fn enter(&self, op: Op, node: &str) -> Result<(), UpgradeError> {
        let delay = {
            let mut inner = self.lock();
            *inner.calls.entry(op).or_default() += 1;
            inner.slow.get(&(op, node.to_string())).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        if let Some(remaining) = inner.failures.get_mut(&(op, node.to_string()))
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(injected(op, node));
        }
        Ok(())
    }

    async fn cordon_node(&self, node: &str) -> Result<CordonOutcome, UpgradeError> {
        retry_on_conflict(&format!("node {node}"), || {
            std::future::ready(self.guarded_schedulability(node, |current| {
                let current =
                    current.ok_or_else(|| UpgradeError::NotFound(format!("node {node}")))?;
                Ok(match (current.unschedulable, current.marker) {
                    (true, true) => (CordonOutcome::AlreadyCordoned, None),
                    (true, false) => (CordonOutcome::Preexisting, None),
                    (false, _) => (
                        CordonOutcome::Cordoned,
                        Some(Schedulability {
                            unschedulable: true,
                            marker: true,
                        }),
                    ),
                })
            }))
        })
        .await
    }

    /// Read-modify-write of the record guarded by the node's resource version.
    fn guarded_write(
        &self,
        node: &str,
        payload: Option<&(String, String)>,
    ) -> Result<(), UpgradeError> {
        let mut inner = self.lock();
        let read_version = inner
            .nodes
            .get(node)
            .ok_or_else(|| conflict(node, "deleted concurrently"))?
            .resource_version;

        inner.interleave(node);
        let n = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| conflict(node, "deleted concurrently"))?;
        if n.resource_version != read_version {
            return Err(conflict(node, "resourceVersion changed since read"));
        }
        n.label = payload.map(|(label, _)| label.clone());
        n.record = payload.map(|(_, json)| json.clone());
        n.resource_version += 1;
        Ok(())
    }

    /// Read-modify-write of the cordon fields guarded by the node's resource
    /// version. `plan` sees `None` for a missing node and returns the outcome
    /// plus the fields to write, if any.
    fn guarded_schedulability<T>(
        &self,
        node: &str,
        plan: impl Fn(Option<Schedulability>) -> Result<(T, Option<Schedulability>), UpgradeError>,
    ) -> Result<T, UpgradeError> {
        let mut inner = self.lock();
        let Some(n) = inner.nodes.get(node) else {
            return plan(None).map(|(outcome, _)| outcome);
        };
        let read_version = n.resource_version;
        let (outcome, write) = plan(Some(Schedulability {
            unschedulable: n.unschedulable,
            marker: n.cordon_marker,
        }))?;
        let Some(write) = write else {
            return Ok(outcome);
        };

        inner.interleave(node);
        let n = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| conflict(node, "deleted concurrently"))?;
        if n.resource_version != read_version {
            return Err(conflict(node, "resourceVersion changed since read"));
        }
        n.unschedulable = write.unschedulable;
        n.cordon_marker = write.marker;
        n.resource_version += 1;
        Ok(outcome)
    }
}

#[async_trait]
impl UpgradeStateStore for FakeCluster {
    async fn get(&self, node: &str) -> Result<NodeUpgradeRecord, UpgradeError> {
        let inner = self.lock();
        Ok(inner.nodes.get(node).map_or_else(
            || NodeUpgradeRecord::untracked(node),
            |n| NodeUpgradeRecord::from_metadata(node, n.label.as_deref(), n.record.as_deref()),
        ))
    }

    async fn set(&self, node: &str, record: &NodeUpgradeRecord) -> Result<(), UpgradeError> {
        self.enter(Op::Set, node).await?;
        let payload = record.to_metadata()?;
        retry_on_conflict(&format!("node {node}"), || {
            std::future::ready(self.guarded_write(node, Some(&payload)))
        })
        .await
    }

    async fn clear(&self, node: &str) -> Result<(), UpgradeError> {
        self.enter(Op::Clear, node).await?;
        retry_on_conflict(&format!("node {node}"), || {
            std::future::ready(self.guarded_write(node, None))
        })
        .await
    }

    async fn list_tracked(&self) -> Result<Vec<NodeUpgradeRecord>, UpgradeError> {
        self.enter(Op::List, "").await?;
        let inner = self.lock();
        Ok(inner
            .nodes
            .iter()
            .filter(|(_, n)| n.label.is_some())
            .map(|(name, n)| {
                NodeUpgradeRecord::from_metadata(name, n.label.as_deref(), n.record.as_deref())
            })
            .collect())
    }
}

#[async_trait]
impl DrainEngine for FakeCluster {
    async fn cordon(&self, node: &str) -> Result<CordonOutcome, UpgradeError> {
        self.enter(Op::Cordon, node).await?;
        self.cordon_node(node).await
    }

    async fn drain(&self, node: &str, policy: &DrainPolicy) -> Result<DrainResult, UpgradeError> {
        self.enter(Op::Drain, node).await?;
        self.cordon_node(node).await?;
        let blocked = self.lock().blocked_drains.contains(node);
        if blocked {
            tokio::time::sleep(policy.timeout).await;
            let remaining_pods = self.lock().nodes[node].workloads.clone();
            return Err(UpgradeError::Drain {
                node: node.to_string(),
                reason: DrainFailure::Timeout,
                message: format!(
                    "{} pod(s) still present after drain timeout",
                    remaining_pods.len()
                ),
                remaining_pods,
            });
        }
        let mut inner = self.lock();
        let n = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| UpgradeError::NotFound(format!("node {node}")))?;
        Ok(DrainResult {
            evicted: std::mem::take(&mut n.workloads),
            ..DrainResult::default()
        })
    }
}

#[async_trait]
impl PodDeleteEngine for FakeCluster {
    async fn delete_pod(
        &self,
        pod: &PodRef,
        _grace_period_seconds: Option<u32>,
    ) -> Result<DeleteOutcome, UpgradeError> {
        let host = self
            .lock()
            .nodes
            .iter()
            .find(|(_, n)| n.driver.as_ref().is_some_and(|p| p.name == pod.name))
            .map_or_else(|| pod.name.clone(), |(name, _)| name.clone());
        self.enter(Op::Delete, &host).await?;
        let mut inner = self.lock();
        let desired = inner.desired.clone();
        let ready = inner.recreate_ready;
        let found = inner.nodes.iter_mut().find(|(_, n)| {
            pod.namespace == DRIVER_NAMESPACE && n.driver.as_ref().is_some_and(|p| p.name == pod.name)
        });
        let Some((name, node)) = found else {
            return Ok(DeleteOutcome::NotFound);
        };
        // The DaemonSet controller recreates the pod at the desired revision.
        node.driver = Some(FakePod {
            name: pod_name(name, &desired),
            version: desired,
            ready,
        });
        Ok(DeleteOutcome::Deleted)
    }
}

#[async_trait]
impl UncordonEngine for FakeCluster {
    async fn uncordon(&self, node: &str) -> Result<UncordonOutcome, UpgradeError> {
        self.enter(Op::Uncordon, node).await?;
        retry_on_conflict(&format!("node {node}"), || {
            std::future::ready(self.guarded_schedulability(node, |current| {
                Ok(match current {
                    None => (UncordonOutcome::NotFound, None),
                    Some(_) => (
                        UncordonOutcome::Uncordoned,
                        Some(Schedulability {
                            unschedulable: false,
                            marker: false,
                        }),
                    ),
                })
            }))
        })
        .await
    }
}

#[async_trait]
impl VersionOracle for FakeCluster {
    async fn observe(&self) -> Result<Vec<NodeVersion>, UpgradeError> {
        self.enter(Op::Observe, "").await?;
        let inner = self.lock();
        Ok(inner
            .nodes
            .iter()
            .map(|(name, n)| NodeVersion {
                node_name: name.clone(),
                desired_version: inner.desired.clone(),
                pod: n.driver.as_ref().map(|p| DriverPod {
                    pod: PodRef::new(DRIVER_NAMESPACE, p.name.clone()),
                    version: p.version.clone(),
                    ready: p.ready,
                }),
            })
            .collect())
    }
}
