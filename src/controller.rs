//! DriverUpgradePolicy controller: one upgrade cycle per reconcile.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::crd::{DriverUpgradePolicy, DriverUpgradePolicyStatus};
use crate::error::UpgradeError;
use crate::health::HealthState;
use crate::k8s::build_engines;
use crate::metrics::Metrics;
use crate::notify::{self, SlackNotifier};
use crate::status::{self, CONDITION_READY, EventRecorder};
use crate::upgrade::{ClusterUpgradeCoordinator, CycleReport, UpgradePolicy};

/// Requeue delay for a trigger that arrived while a cycle was running.
const GATE_BUSY_REQUEUE: Duration = Duration::from_secs(5);
const TRANSIENT_ERROR_REQUEUE: Duration = Duration::from_secs(30);
const PERMANENT_ERROR_REQUEUE: Duration = Duration::from_secs(300);

/// Shared context for the controller.
pub struct Context {
    pub kube_client: kube::Client,
    pub settings: Settings,
    pub metrics: Arc<Metrics>,
    pub slack: Option<Arc<SlackNotifier>>,
    pub health: HealthState,
    /// Serializes cycles. Triggers that find it held are coalesced into a requeue.
    cycle_gate: tokio::sync::Mutex<()>,
}

impl Context {
    pub fn new(
        kube_client: kube::Client,
        settings: Settings,
        metrics: Arc<Metrics>,
        slack: Option<Arc<SlackNotifier>>,
        health: HealthState,
    ) -> Self {
        Self {
            kube_client,
            settings,
            metrics,
            slack,
            health,
            cycle_gate: tokio::sync::Mutex::new(()),
        }
    }
}

/// Delay until the next cycle once `report` is known.
pub fn requeue_after(report: &CycleReport, settings: &Settings) -> Duration {
    if report.is_settled() {
        settings.requeue_stable
    } else {
        settings.requeue_in_progress
    }
}

async fn write_status(
    api: &Api<DriverUpgradePolicy>,
    name: &str,
    prev: &DriverUpgradePolicyStatus,
    next: &DriverUpgradePolicyStatus,
    settings: &Settings,
) {
    if !status::needs_patch(prev, next, settings.requeue_in_progress, Utc::now()) {
        debug!(policy = name, "Status unchanged, skipping patch");
        return;
    }
    if let Err(e) = status::patch_status(api, name, next).await {
        warn!(policy = name, error = %e, "Failed to patch status");
    }
}

/// Run one upgrade cycle for the configured policy.
pub async fn reconcile(
    obj: Arc<DriverUpgradePolicy>,
    ctx: Arc<Context>,
) -> Result<Action, UpgradeError> {
    let name = obj.name_any();
    let api: Api<DriverUpgradePolicy> = Api::all(ctx.kube_client.clone());
    let generation = obj.metadata.generation.unwrap_or(0);
    let current_status = obj.status.clone().unwrap_or_default();
    let now = Utc::now();

    if name != ctx.settings.policy_name {
        let mut new_status = current_status.clone();
        status::set_condition(
            &mut new_status,
            CONDITION_READY,
            "False",
            "Ignored",
            Some(format!(
                "this operator reconciles DriverUpgradePolicy/{} only",
                ctx.settings.policy_name
            )),
            now,
        );
        new_status.observed_generation = generation;
        if new_status != current_status {
            debug!(policy = %name, "Ignoring policy not managed by this instance");
            write_status(&api, &name, &current_status, &new_status, &ctx.settings).await;
        }
        return Ok(Action::await_change());
    }

    if !obj.spec.auto_upgrade {
        let mut new_status = current_status.clone();
        status::set_condition(
            &mut new_status,
            CONDITION_READY,
            "True",
            "AutoUpgradeDisabled",
            Some("autoUpgrade is false, no node is touched".to_string()),
            now,
        );
        new_status.observed_generation = generation;
        if new_status != current_status {
            info!(policy = %name, "Auto upgrade disabled");
            write_status(&api, &name, &current_status, &new_status, &ctx.settings).await;
        }
        return Ok(Action::await_change());
    }

    let recorder = EventRecorder::new(ctx.kube_client.clone(), &obj);

    let policy = match UpgradePolicy::from_spec(
        &obj.spec,
        ctx.settings.step_timeout,
        ctx.settings.cycle_timeout,
    ) {
        Ok(p) => p,
        Err(e) => {
            error!(policy = %name, error = %e, "Invalid policy");
            ctx.metrics.record_cycle_result(&name, "invalid");
            let mut new_status = current_status.clone();
            status::apply_cycle_error(&mut new_status, "InvalidPolicy", e.to_string(), generation, now);
            write_status(&api, &name, &current_status, &new_status, &ctx.settings).await;
            recorder.publish_warning("InvalidPolicy", &e.to_string()).await;
            return Ok(Action::await_change());
        }
    };

    let Ok(_gate) = ctx.cycle_gate.try_lock() else {
        debug!(policy = %name, "Cycle already running, coalescing trigger");
        return Ok(Action::requeue(GATE_BUSY_REQUEUE));
    };

    let coordinator =
        ClusterUpgradeCoordinator::new(build_engines(&ctx.kube_client, obj.spec.driver.clone()));
    let started = Instant::now();
    let report = match coordinator.run_cycle(&policy).await {
        Ok(report) => report,
        Err(e) => {
            error!(policy = %name, error = %e, "Upgrade cycle aborted");
            ctx.metrics.record_cycle_result(&name, "error");
            let mut new_status = current_status.clone();
            status::apply_cycle_error(&mut new_status, "SnapshotFailed", e.to_string(), generation, now);
            write_status(&api, &name, &current_status, &new_status, &ctx.settings).await;
            return Err(e);
        }
    };
    ctx.metrics
        .record_report(&name, &report, started.elapsed().as_secs_f64());
    ctx.health.record_cycle(now);

    let mut new_status = current_status.clone();
    status::apply_report(&mut new_status, &report, generation, now);
    write_status(&api, &name, &current_status, &new_status, &ctx.settings).await;

    for node in report
        .failed_nodes
        .iter()
        .filter(|f| report.newly_failed.contains(&f.name))
    {
        let message = format!(
            "node {} failed after {} attempt(s): {}",
            node.name,
            node.attempts,
            node.last_error.as_deref().unwrap_or("unknown error")
        );
        recorder.publish_warning("NodeUpgradeFailed", &message).await;
        if let Some(slack) = &ctx.slack {
            slack
                .send(&name, &notify::build_node_failed_message(&name, node))
                .await;
        }
    }

    if status::rollout_finished(&current_status, &new_status) {
        let message = new_status.message.as_deref().unwrap_or("rollout settled");
        if status::condition_is_true(&new_status, status::CONDITION_ROLLOUT_COMPLETE) {
            recorder.publish("RolloutComplete", message).await;
        } else {
            recorder.publish_warning("RolloutSettledWithFailures", message).await;
        }
        if let Some(slack) = &ctx.slack {
            slack
                .send(&name, &notify::build_rollout_completed_message(&name, &report))
                .await;
        }
    }

    let requeue = requeue_after(&report, &ctx.settings);
    debug!(policy = %name, requeue_seconds = requeue.as_secs(), "Cycle finished");
    Ok(Action::requeue(requeue))
}

/// Error policy for the controller.
pub fn error_policy(
    obj: Arc<DriverUpgradePolicy>,
    err: &UpgradeError,
    _ctx: Arc<Context>,
) -> Action {
    let delay = error_requeue(err);
    warn!(
        policy = %obj.name_any(),
        error = %err,
        transient = err.is_transient(),
        requeue_seconds = delay.as_secs(),
        "Reconcile failed"
    );
    Action::requeue(delay)
}

fn error_requeue(err: &UpgradeError) -> Duration {
    if err.is_transient() {
        TRANSIENT_ERROR_REQUEUE
    } else {
        PERMANENT_ERROR_REQUEUE
    }
}
