//! Validated upgrade policy used by one coordinator cycle.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::Selector;

use super::backoff::BackoffPolicy;
use crate::crd::DriverUpgradePolicySpec;
use crate::error::UpgradeError;

/// Drain knobs handed to the drain engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainPolicy {
    pub timeout: Duration,
    pub force: bool,
    pub delete_empty_dir: bool,
    /// Sent to the API server when listing the node's pods.
    pub pod_selector: Option<Selector>,
    pub skip_selector: Option<Selector>,
}

/// Everything the coordinator needs to decide and bound one cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradePolicy {
    /// 0 means unlimited.
    pub max_parallel_upgrades: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub drain_enabled: bool,
    pub drain: DrainPolicy,
    pub pod_delete_grace: Option<u32>,
    pub wait_for_ready_timeout: Duration,
    /// Bound on a single engine call.
    pub step_timeout: Duration,
    /// Bound on joining all per-node tasks of a cycle.
    pub cycle_timeout: Duration,
}

impl Default for UpgradePolicy {
    fn default() -> Self {
        Self {
            max_parallel_upgrades: 1,
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            drain_enabled: true,
            drain: DrainPolicy {
                timeout: Duration::from_secs(300),
                ..DrainPolicy::default()
            },
            pod_delete_grace: None,
            wait_for_ready_timeout: Duration::from_secs(600),
            step_timeout: Duration::from_secs(60),
            cycle_timeout: Duration::from_secs(120),
        }
    }
}

impl UpgradePolicy {
    pub fn from_spec(
        spec: &DriverUpgradePolicySpec,
        step_timeout: Duration,
        cycle_timeout: Duration,
    ) -> Result<Self, UpgradeError> {
        if spec.retry.max_attempts == 0 {
            return Err(UpgradeError::InvalidPolicy(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if spec.driver.namespace.is_empty() {
            return Err(UpgradeError::InvalidPolicy(
                "driver.namespace must not be empty".to_string(),
            ));
        }
        let pod_selector = selector("podSelector", spec.drain.pod_selector.as_ref())?;
        let skip_selector = selector("skipSelector", spec.drain.skip_selector.as_ref())?;

        Ok(Self {
            max_parallel_upgrades: spec.max_parallel_upgrades,
            max_attempts: spec.retry.max_attempts,
            backoff: BackoffPolicy::from(&spec.retry.backoff),
            drain_enabled: spec.drain.enable,
            drain: DrainPolicy {
                timeout: Duration::from_secs(spec.drain.timeout_seconds),
                force: spec.drain.force,
                delete_empty_dir: spec.drain.delete_empty_dir,
                pod_selector,
                skip_selector,
            },
            pod_delete_grace: spec.pod_deletion.grace_period_seconds,
            wait_for_ready_timeout: Duration::from_secs(spec.wait_for_ready.timeout_seconds),
            step_timeout,
            cycle_timeout,
        })
    }

    /// How many more nodes may be admitted given `in_flight` already running.
    pub fn admission_budget(&self, in_flight: usize) -> usize {
        if self.max_parallel_upgrades == 0 {
            return usize::MAX;
        }
        (self.max_parallel_upgrades as usize).saturating_sub(in_flight)
    }

    /// Drain knobs and call bound for a drain that must return within `remaining`.
    ///
    /// The eviction timeout shrinks to fit, so a drain held up by a disruption
    /// budget reports its own timeout while the cycle is still collecting
    /// outcomes. With time to spare the call gets the full drain timeout plus
    /// one step timeout.
    pub fn drain_within(&self, remaining: Duration) -> (DrainPolicy, Duration) {
        let slack = self.step_timeout.min(remaining / 4);
        let mut drain = self.drain.clone();
        drain.timeout = drain.timeout.min(remaining.saturating_sub(slack));
        let limit = drain.timeout + slack;
        (drain, limit)
    }
}

/// Converts a CRD label selector. An empty selector is treated as unset.
fn selector(field: &str, raw: Option<&LabelSelector>) -> Result<Option<Selector>, UpgradeError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let selector = Selector::try_from(raw.clone())
        .map_err(|e| UpgradeError::InvalidPolicy(format!("drain.{field}: {e}")))?;
    Ok((!selector.selects_all()).then_some(selector))
}
