//! Cluster-wide upgrade cycle.
//!
//! A cycle rebuilds an ordered snapshot of every managed node, admits new
//! nodes up to the parallelism budget, gives each in-flight node exactly one
//! forward attempt (as independent tasks), then persists what changed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use super::engine::{CordonOutcome, DeleteOutcome, Engines, NodeVersion};
use super::policy::UpgradePolicy;
use super::record::{NodeUpgradeRecord, PRE_CORDONED};
use crate::crd::UpgradeState;
use crate::error::UpgradeError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub node: String,
    pub from: UpgradeState,
    pub to: UpgradeState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeError {
    pub node: String,
    pub state: UpgradeState,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedNode {
    pub name: String,
    pub last_error: Option<String>,
    pub attempts: u32,
}

/// Outcome of one cycle.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    /// Managed nodes per state after the cycle. Every state is present.
    pub counts: BTreeMap<UpgradeState, u32>,
    pub failed_nodes: Vec<FailedNode>,
    /// Errors raised by this cycle's steps and writes.
    pub node_errors: Vec<NodeError>,
    /// Nodes that ran out of attempts in this cycle.
    pub newly_failed: Vec<String>,
    pub transitions: Vec<Transition>,
    pub admitted: Vec<String>,
    /// Nodes whose step outlived the cycle deadline. Their state is kept.
    pub abandoned: Vec<String>,
    pub backing_off: Vec<String>,
}

impl CycleReport {
    pub fn count(&self, state: UpgradeState) -> u32 {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// Nodes cordoned, draining or waiting for the driver.
    pub fn in_progress(&self) -> u32 {
        self.counts
            .iter()
            .filter(|(s, _)| s.is_in_flight())
            .map(|(_, n)| n)
            .sum()
    }

    /// Nodes still waiting for admission.
    pub fn pending(&self) -> u32 {
        self.count(UpgradeState::UpgradeRequired)
    }

    /// No node is mid-rollout or waiting: everything is up to date or failed.
    pub fn is_settled(&self) -> bool {
        self.in_progress() == 0 && self.pending() == 0
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Persist {
    Keep,
    Set,
    Clear,
}

struct SnapshotEntry {
    record: NodeUpgradeRecord,
    /// Record as read at the start of the cycle.
    base: NodeUpgradeRecord,
    observed: Option<NodeVersion>,
    stored: bool,
    persist: Persist,
}

impl SnapshotEntry {
    fn new(node_name: &str) -> Self {
        let record = NodeUpgradeRecord::untracked(node_name);
        Self {
            base: record.clone(),
            record,
            observed: None,
            stored: false,
            persist: Persist::Keep,
        }
    }

    fn needs_upgrade(&self) -> bool {
        self.observed.as_ref().is_some_and(NodeVersion::needs_upgrade)
    }
}

/// Ordered node name -> record view, rebuilt every cycle.
type Snapshot = BTreeMap<String, SnapshotEntry>;

enum StepOutcome {
    Advanced {
        to: UpgradeState,
        pre_cordoned: bool,
    },
    Waiting,
    Failed(UpgradeError),
}

const fn advance(to: UpgradeState) -> StepOutcome {
    StepOutcome::Advanced {
        to,
        pre_cordoned: false,
    }
}

/// Steps must return this long before the cycle deadline so their outcome
/// is still collected.
fn step_deadline(cycle_deadline: Instant, cycle_timeout: Duration) -> Instant {
    cycle_deadline - cycle_timeout / 10
}

pub struct ClusterUpgradeCoordinator {
    engines: Engines,
}

impl ClusterUpgradeCoordinator {
    pub const fn new(engines: Engines) -> Self {
        Self { engines }
    }

    pub async fn run_cycle(&self, policy: &UpgradePolicy) -> Result<CycleReport, UpgradeError> {
        self.run_cycle_at(policy, Utc::now()).await
    }

    /// Run one cycle with `now` as the wall-clock time for records.
    pub async fn run_cycle_at(
        &self,
        policy: &UpgradePolicy,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, UpgradeError> {
        let deadline = Instant::now() + policy.cycle_timeout;
        let mut report = CycleReport::default();

        let mut snapshot = self.snapshot(now, &mut report).await?;
        admit(&mut snapshot, policy, now, &mut report);
        self.step_in_flight(&mut snapshot, policy, now, deadline, &mut report)
            .await;
        self.persist(&mut snapshot, &mut report).await;

        tally(&snapshot, &mut report);
        info!(
            nodes = report.total(),
            in_progress = report.in_progress(),
            pending = report.pending(),
            failed = report.count(UpgradeState::Failed),
            transitions = report.transitions.len(),
            errors = report.node_errors.len(),
            abandoned = report.abandoned.len(),
            "Upgrade cycle finished"
        );
        Ok(report)
    }

    /// Merge the oracle's view with persisted records.
    async fn snapshot(
        &self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<Snapshot, UpgradeError> {
        let (observed, tracked) =
            tokio::try_join!(self.engines.oracle.observe(), self.engines.store.list_tracked())
                .map_err(|e| match e {
                    UpgradeError::Snapshot(_) => e,
                    other => UpgradeError::Snapshot(other.to_string()),
                })?;

        let mut snapshot = Snapshot::new();
        for version in observed {
            let entry = snapshot
                .entry(version.node_name.clone())
                .or_insert_with(|| SnapshotEntry::new(&version.node_name));
            entry.observed = Some(version);
        }
        for record in tracked {
            let entry = snapshot
                .entry(record.node_name.clone())
                .or_insert_with(|| SnapshotEntry::new(&record.node_name));
            entry.base = record.clone();
            entry.record = record;
            entry.stored = true;
        }

        for (name, entry) in &mut snapshot {
            match entry.record.state {
                UpgradeState::UpToDate if entry.needs_upgrade() => {
                    entry.record = NodeUpgradeRecord::untracked(name.as_str());
                    transition(entry, UpgradeState::UpgradeRequired, now, report);
                }
                UpgradeState::UpToDate if entry.stored => entry.persist = Persist::Clear,
                UpgradeState::UpgradeRequired if !entry.needs_upgrade() => {
                    debug!(node = %name, "Driver version converged before admission");
                    transition(entry, UpgradeState::UpToDate, now, report);
                }
                _ => {}
            }
        }
        Ok(snapshot)
    }

    async fn step_in_flight(
        &self,
        snapshot: &mut Snapshot,
        policy: &UpgradePolicy,
        now: DateTime<Utc>,
        deadline: Instant,
        report: &mut CycleReport,
    ) {
        let policy = Arc::new(policy.clone());
        let mut tasks = Vec::new();

        for (name, entry) in snapshot.iter() {
            // Nodes admitted this cycle already made their move.
            if !entry.base.state.is_in_flight() || !entry.record.state.is_in_flight() {
                continue;
            }
            if entry.record.in_backoff(&policy.backoff, now) {
                debug!(
                    node = %name,
                    state = %entry.record.state,
                    attempt = entry.record.attempt_count,
                    "Node in backoff, skipping this cycle"
                );
                report.backing_off.push(name.clone());
                continue;
            }
            let handle = tokio::spawn(step_node(
                self.engines.clone(),
                Arc::clone(&policy),
                entry.record.clone(),
                entry.observed.clone(),
                now,
                step_deadline(deadline, policy.cycle_timeout),
            ));
            tasks.push((name.clone(), handle));
        }

        for (name, handle) in tasks {
            let outcome = match timeout_at(deadline, handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(node = %name, error = %e, "Node step task did not complete");
                    report.abandoned.push(name);
                    continue;
                }
                Err(_) => {
                    // Dropping the handle detaches the task; it keeps running.
                    warn!(node = %name, "Cycle deadline reached, abandoning node step");
                    report.abandoned.push(name);
                    continue;
                }
            };
            if let Some(entry) = snapshot.get_mut(&name) {
                apply_outcome(entry, outcome, &policy, now, report);
            }
        }
    }

    async fn persist(&self, snapshot: &mut Snapshot, report: &mut CycleReport) {
        let writes = snapshot
            .iter()
            .filter(|(_, e)| e.persist != Persist::Keep)
            .map(|(name, entry)| {
                let store = Arc::clone(&self.engines.store);
                async move {
                    let result = match entry.persist {
                        Persist::Clear => store.clear(name).await,
                        _ => store.set(name, &entry.record).await,
                    };
                    (name.clone(), result)
                }
            });
        let results = join_all(writes).await;

        for (name, result) in results {
            let Err(e) = result else { continue };
            warn!(node = %name, error = %e, "Failed to persist upgrade record");
            if let Some(entry) = snapshot.get_mut(&name) {
                report.node_errors.push(NodeError {
                    node: name.clone(),
                    state: entry.record.state,
                    error: e.to_string(),
                });
                entry.record = entry.base.clone();
                entry.persist = Persist::Keep;
            }
            report.transitions.retain(|t| t.node != name);
            report.newly_failed.retain(|n| *n != name);
            report.admitted.retain(|n| *n != name);
        }
    }
}

fn transition(
    entry: &mut SnapshotEntry,
    to: UpgradeState,
    now: DateTime<Utc>,
    report: &mut CycleReport,
) {
    let from = entry.record.state;
    debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
    entry.record.advance(to, now);
    entry.persist = if to == UpgradeState::UpToDate {
        Persist::Clear
    } else {
        Persist::Set
    };
    info!(node = %entry.record.node_name, %from, %to, "Node upgrade state changed");
    report.transitions.push(Transition {
        node: entry.record.node_name.clone(),
        from,
        to,
    });
}

/// Move `UpgradeRequired` nodes to `CordonRequired` in name order while the
/// parallelism budget allows.
fn admit(
    snapshot: &mut Snapshot,
    policy: &UpgradePolicy,
    now: DateTime<Utc>,
    report: &mut CycleReport,
) {
    let in_flight = snapshot
        .values()
        .filter(|e| e.record.state.is_in_flight())
        .count();
    let mut budget = policy.admission_budget(in_flight);

    for (name, entry) in snapshot.iter_mut() {
        if budget == 0 {
            break;
        }
        if entry.record.state != UpgradeState::UpgradeRequired {
            continue;
        }
        entry.record.tracked_pod = entry
            .observed
            .as_ref()
            .and_then(|o| o.pod.as_ref())
            .map(|p| p.pod.clone());
        transition(entry, UpgradeState::CordonRequired, now, report);
        report.admitted.push(name.clone());
        budget -= 1;
    }
}

fn apply_outcome(
    entry: &mut SnapshotEntry,
    outcome: StepOutcome,
    policy: &UpgradePolicy,
    now: DateTime<Utc>,
    report: &mut CycleReport,
) {
    match outcome {
        StepOutcome::Advanced { to, pre_cordoned } => {
            if pre_cordoned {
                entry
                    .record
                    .annotations
                    .insert(PRE_CORDONED.to_string(), "true".to_string());
            }
            transition(entry, to, now, report);
        }
        StepOutcome::Waiting => {}
        StepOutcome::Failed(e) => {
            let from = entry.record.state;
            let node = entry.record.node_name.clone();
            let failed = entry.record.record_failure(e.to_string(), now, policy.max_attempts);
            entry.persist = Persist::Set;
            warn!(
                node = %node,
                state = %from,
                attempt = entry.record.attempt_count,
                error = %e,
                "Node upgrade step failed"
            );
            report.node_errors.push(NodeError {
                node: node.clone(),
                state: from,
                error: e.to_string(),
            });
            if failed {
                warn!(node = %node, state = %from, "Retry budget exhausted, node marked Failed");
                report.transitions.push(Transition {
                    node: node.clone(),
                    from,
                    to: UpgradeState::Failed,
                });
                report.newly_failed.push(node);
            }
        }
    }
}

fn tally(snapshot: &Snapshot, report: &mut CycleReport) {
    report.counts = UpgradeState::ALL.iter().map(|s| (*s, 0)).collect();
    for entry in snapshot.values() {
        *report.counts.entry(entry.record.state).or_default() += 1;
        if entry.record.state == UpgradeState::Failed {
            report.failed_nodes.push(FailedNode {
                name: entry.record.node_name.clone(),
                last_error: entry.record.last_error.clone(),
                attempts: entry.record.attempt_count,
            });
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    operation: &str,
    node: &str,
    call: impl Future<Output = Result<T, UpgradeError>>,
) -> Result<T, UpgradeError> {
    timeout(limit, call)
        .await
        .map_err(|_| UpgradeError::Timeout {
            operation: format!("{operation} {node}"),
            after: limit,
        })?
}

/// One forward attempt for one node.
async fn step_node(
    engines: Engines,
    policy: Arc<UpgradePolicy>,
    record: NodeUpgradeRecord,
    observed: Option<NodeVersion>,
    now: DateTime<Utc>,
    deadline: Instant,
) -> StepOutcome {
    let node = record.node_name.as_str();
    let result = match record.state {
        UpgradeState::CordonRequired => {
            bounded(policy.step_timeout, "cordon", node, engines.drain.cordon(node))
                .await
                .map(|outcome| {
                    if outcome == CordonOutcome::Preexisting {
                        info!(node, "Node was already cordoned, it will be left cordoned");
                    }
                    StepOutcome::Advanced {
                        to: UpgradeState::PodDeletionRequired,
                        pre_cordoned: outcome == CordonOutcome::Preexisting,
                    }
                })
        }
        UpgradeState::PodDeletionRequired => {
            let pod = record.tracked_pod.clone().or_else(|| {
                observed
                    .as_ref()
                    .and_then(|o| o.pod.as_ref())
                    .map(|p| p.pod.clone())
            });
            match pod {
                None => Ok(advance(UpgradeState::DrainRequired)),
                Some(pod) => bounded(
                    policy.step_timeout,
                    "delete driver pod on",
                    node,
                    engines.pod_delete.delete_pod(&pod, policy.pod_delete_grace),
                )
                .await
                .map(|outcome| {
                    if outcome == DeleteOutcome::NotFound {
                        debug!(node, pod = %pod, "Driver pod already gone");
                    }
                    advance(UpgradeState::DrainRequired)
                }),
            }
        }
        UpgradeState::DrainRequired if !policy.drain_enabled => {
            Ok(advance(UpgradeState::WaitForPodReady))
        }
        UpgradeState::DrainRequired => {
            let (drain, limit) =
                policy.drain_within(deadline.saturating_duration_since(Instant::now()));
            if drain.timeout < policy.drain.timeout {
                debug!(
                    node,
                    timeout_secs = drain.timeout.as_secs(),
                    "Drain timeout shortened to fit the cycle"
                );
            }
            bounded(limit, "drain", node, engines.drain.drain(node, &drain))
                .await
                .map(|drained| {
                    info!(
                        node,
                        evicted = drained.evicted.len(),
                        force_deleted = drained.force_deleted.len(),
                        skipped = drained.skipped,
                        "Node drained"
                    );
                    advance(UpgradeState::WaitForPodReady)
                })
        }
        UpgradeState::WaitForPodReady => wait_for_pod_ready(&record, observed.as_ref(), &policy, now),
        UpgradeState::UncordonRequired if record.pre_cordoned() => {
            debug!(node, "Skipping uncordon for a node cordoned by someone else");
            Ok(advance(UpgradeState::UpToDate))
        }
        UpgradeState::UncordonRequired => {
            bounded(policy.step_timeout, "uncordon", node, engines.uncordon.uncordon(node))
                .await
                .map(|_| advance(UpgradeState::UpToDate))
        }
        UpgradeState::UpToDate | UpgradeState::UpgradeRequired | UpgradeState::Failed => {
            Ok(StepOutcome::Waiting)
        }
    };
    result.unwrap_or_else(StepOutcome::Failed)
}

fn wait_for_pod_ready(
    record: &NodeUpgradeRecord,
    observed: Option<&NodeVersion>,
    policy: &UpgradePolicy,
    now: DateTime<Utc>,
) -> Result<StepOutcome, UpgradeError> {
    if observed.is_some_and(NodeVersion::is_upgraded_and_ready) {
        return Ok(advance(UpgradeState::UncordonRequired));
    }
    let waited = record.time_in_state(now);
    if waited >= policy.wait_for_ready_timeout {
        return Err(UpgradeError::Timeout {
            operation: format!("waiting for driver pod on {}", record.node_name),
            after: policy.wait_for_ready_timeout,
        });
    }
    debug!(
        node = %record.node_name,
        waited_secs = waited.as_secs(),
        "Driver pod not ready yet"
    );
    Ok(StepOutcome::Waiting)
}
