//! Policy status derived from cycle reports, status patching and events.

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Resource};
use tracing::{debug, warn};

use crate::crd::{
    DriverUpgradePolicy, DriverUpgradePolicyStatus, FailedNodeStatus, PolicyCondition,
    UpgradeState,
};
use crate::upgrade::CycleReport;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_ROLLOUT_COMPLETE: &str = "RolloutComplete";

const FIELD_MANAGER: &str = "duo";

/// Patch the status subresource of a `DriverUpgradePolicy`.
pub async fn patch_status(
    api: &Api<DriverUpgradePolicy>,
    name: &str,
    status: &DriverUpgradePolicyStatus,
) -> Result<DriverUpgradePolicy> {
    debug!(policy = name, in_progress = status.in_progress, "Patching status");
    let patch = serde_json::json!({ "status": status });
    let result = api
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(result)
}

/// Set a condition. `lastTransitionTime` only moves when `status` flips.
pub fn set_condition(
    status: &mut DriverUpgradePolicyStatus,
    condition_type: &str,
    condition_status: &str,
    reason: &str,
    message: Option<String>,
    now: DateTime<Utc>,
) {
    let last_transition_time = status
        .conditions
        .iter()
        .find(|c| c.r#type == condition_type && c.status == condition_status)
        .map_or(now, |c| c.last_transition_time);

    status.conditions.retain(|c| c.r#type != condition_type);
    status.conditions.push(PolicyCondition {
        r#type: condition_type.to_string(),
        status: condition_status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    });
}

pub fn condition_is_true(status: &DriverUpgradePolicyStatus, condition_type: &str) -> bool {
    status
        .conditions
        .iter()
        .any(|c| c.r#type == condition_type && c.status == "True")
}

fn summary(report: &CycleReport) -> String {
    format!(
        "{} node(s): {} up to date, {} in progress, {} pending, {} failed",
        report.total(),
        report.count(UpgradeState::UpToDate),
        report.in_progress(),
        report.pending(),
        report.count(UpgradeState::Failed),
    )
}

/// Fold a finished cycle into the policy status.
pub fn apply_report(
    status: &mut DriverUpgradePolicyStatus,
    report: &CycleReport,
    generation: i64,
    now: DateTime<Utc>,
) {
    status.observed_generation = generation;
    status.last_cycle_time = Some(now);
    status.node_counts = report
        .counts
        .iter()
        .map(|(state, count)| (state.to_string(), *count))
        .collect();
    status.in_progress = report.in_progress();
    status.failed_nodes = report
        .failed_nodes
        .iter()
        .map(|f| FailedNodeStatus {
            name: f.name.clone(),
            last_error: f.last_error.clone(),
            attempts: f.attempts,
        })
        .collect();

    let message = summary(report);
    set_condition(status, CONDITION_READY, "True", "CycleSucceeded", None, now);

    let failed = report.count(UpgradeState::Failed);
    if !report.is_settled() {
        set_condition(
            status,
            CONDITION_ROLLOUT_COMPLETE,
            "False",
            "InProgress",
            Some(message.clone()),
            now,
        );
    } else if failed > 0 {
        set_condition(
            status,
            CONDITION_ROLLOUT_COMPLETE,
            "False",
            "NodesFailed",
            Some(format!("{failed} node(s) need operator attention")),
            now,
        );
    } else {
        set_condition(
            status,
            CONDITION_ROLLOUT_COMPLETE,
            "True",
            "AllNodesUpToDate",
            None,
            now,
        );
    }
    status.message = Some(message);
}

/// Record a cycle that could not run (snapshot failure, invalid policy).
pub fn apply_cycle_error(
    status: &mut DriverUpgradePolicyStatus,
    reason: &str,
    message: String,
    generation: i64,
    now: DateTime<Utc>,
) {
    status.observed_generation = generation;
    status.last_cycle_time = Some(now);
    set_condition(status, CONDITION_READY, "False", reason, Some(message.clone()), now);
    status.message = Some(message);
}

fn rollout_condition(status: &DriverUpgradePolicyStatus) -> Option<&PolicyCondition> {
    status
        .conditions
        .iter()
        .find(|c| c.r#type == CONDITION_ROLLOUT_COMPLETE)
}

/// True when `next` settles a rollout that `prev` recorded as in progress.
pub fn rollout_finished(prev: &DriverUpgradePolicyStatus, next: &DriverUpgradePolicyStatus) -> bool {
    let was_in_progress = rollout_condition(prev).is_some_and(|c| c.reason == "InProgress");
    let is_in_progress = rollout_condition(next).is_none_or(|c| c.reason == "InProgress");
    was_in_progress && !is_in_progress
}

/// Whether `next` must be written over `prev`.
///
/// A status that only differs in `lastCycleTime` is written at most once per
/// `refresh_after`, so the write does not retrigger the policy watch forever.
pub fn needs_patch(
    prev: &DriverUpgradePolicyStatus,
    next: &DriverUpgradePolicyStatus,
    refresh_after: std::time::Duration,
    now: DateTime<Utc>,
) -> bool {
    let stale = prev.last_cycle_time.is_none_or(|t| {
        (now - t).to_std().unwrap_or_default() >= refresh_after
    });
    if stale {
        return true;
    }
    let mut prev = prev.clone();
    prev.last_cycle_time.clone_from(&next.last_cycle_time);
    prev != *next
}

/// Event recorder bound to one policy object.
pub struct EventRecorder {
    recorder: Recorder,
    obj_ref: ObjectReference,
}

impl EventRecorder {
    pub fn new(client: kube::Client, obj: &DriverUpgradePolicy) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            obj_ref: obj.object_ref(&()),
        }
    }

    async fn emit(&self, type_: EventType, reason: &str, message: &str) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(message.into()),
            action: reason.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &self.obj_ref).await {
            warn!(reason, error = %e, "Failed to publish event");
        }
    }

    pub async fn publish(&self, reason: &str, message: &str) {
        self.emit(EventType::Normal, reason, message).await;
    }

    pub async fn publish_warning(&self, reason: &str, message: &str) {
        self.emit(EventType::Warning, reason, message).await;
    }
}
