//! Per-node upgrade record and its encoding as node metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::backoff::BackoffPolicy;
use crate::crd::UpgradeState;
use crate::error::UpgradeError;

/// Node label carrying the upgrade state.
pub const STATE_LABEL: &str = "duo.io/upgrade-state";

/// Node annotation carrying the rest of the record as JSON.
pub const RECORD_ANNOTATION: &str = "duo.io/upgrade-record";

/// Record annotation set when the node was already unschedulable before we
/// cordoned it. Such nodes are left cordoned when their upgrade finishes.
pub const PRE_CORDONED: &str = "duo.io/pre-cordoned";

/// Namespaced reference to a pod.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Upgrade bookkeeping for one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeUpgradeRecord {
    pub node_name: String,
    pub state: UpgradeState,
    pub tracked_pod: Option<PodRef>,
    pub attempt_count: u32,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

/// The part of a record stored in [`RECORD_ANNOTATION`].
#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RecordBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tracked_pod: Option<PodRef>,
    #[serde(default)]
    attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

impl NodeUpgradeRecord {
    /// The "no state" record: node is not tracked.
    pub fn untracked(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            state: UpgradeState::UpToDate,
            tracked_pod: None,
            attempt_count: 0,
            last_transition_time: None,
            last_attempt_time: None,
            last_error: None,
            annotations: BTreeMap::new(),
        }
    }

    /// A freshly detected version mismatch.
    pub fn upgrade_required(node_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            state: UpgradeState::UpgradeRequired,
            last_transition_time: Some(now),
            ..Self::untracked(node_name)
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.state != UpgradeState::UpToDate
    }

    pub fn pre_cordoned(&self) -> bool {
        self.annotations.get(PRE_CORDONED).is_some_and(|v| v == "true")
    }

    /// Move to `to` after a successful step. Attempt bookkeeping resets.
    pub fn advance(&mut self, to: UpgradeState, now: DateTime<Utc>) {
        self.state = to;
        self.attempt_count = 0;
        self.last_error = None;
        self.last_attempt_time = None;
        self.last_transition_time = Some(now);
        if to == UpgradeState::UpToDate {
            self.tracked_pod = None;
        }
    }

    /// Count a failed attempt. Returns true when this exhausted the budget
    /// and the node moved to `Failed`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> bool {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_attempt_time = Some(now);
        if self.attempt_count >= max_attempts.max(1) {
            self.state = UpgradeState::Failed;
            self.last_transition_time = Some(now);
            return true;
        }
        false
    }

    /// Whether the node must sit out this cycle after a recent failure.
    pub fn in_backoff(&self, backoff: &BackoffPolicy, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_attempt_time else {
            return false;
        };
        if self.attempt_count == 0 {
            return false;
        }
        let delay = backoff.delay(self.attempt_count);
        let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
        elapsed < delay
    }

    /// Time spent in the current state.
    pub fn time_in_state(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.last_transition_time
            .and_then(|t| now.signed_duration_since(t).to_std().ok())
            .unwrap_or_default()
    }

    /// Encode as (state label value, record annotation JSON).
    pub fn to_metadata(&self) -> Result<(String, String), UpgradeError> {
        let body = RecordBody {
            tracked_pod: self.tracked_pod.clone(),
            attempt_count: self.attempt_count,
            last_transition_time: self.last_transition_time,
            last_attempt_time: self.last_attempt_time,
            last_error: self.last_error.clone(),
            annotations: self.annotations.clone(),
        };
        let json = serde_json::to_string(&body).map_err(|e| UpgradeError::Store {
            node: self.node_name.clone(),
            message: format!("failed to encode record: {e}"),
        })?;
        Ok((self.state.label_value().to_string(), json))
    }

    /// Decode from node metadata. A node without the state label is untracked.
    ///
    /// Unknown label values are reported and treated as untracked so one bad
    /// node cannot stall the whole rollout; an unreadable body keeps the state
    /// and starts bookkeeping from scratch.
    pub fn from_metadata(node_name: &str, label: Option<&str>, annotation: Option<&str>) -> Self {
        let Some(label) = label else {
            return Self::untracked(node_name);
        };
        let Some(state) = UpgradeState::from_label_value(label) else {
            warn!(node = node_name, label, "Unknown upgrade state label, ignoring");
            return Self::untracked(node_name);
        };
        let body = match annotation.map(serde_json::from_str::<RecordBody>) {
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                warn!(node = node_name, error = %e, "Unreadable upgrade record annotation");
                RecordBody::default()
            }
            None => RecordBody::default(),
        };
        Self {
            node_name: node_name.to_string(),
            state,
            tracked_pod: body.tracked_pod,
            attempt_count: body.attempt_count,
            last_transition_time: body.last_transition_time,
            last_attempt_time: body.last_attempt_time,
            last_error: body.last_error,
            annotations: body.annotations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_untracked_default() {
        let record = NodeUpgradeRecord::untracked("worker-1");
        assert_eq!(record.state, UpgradeState::UpToDate);
        assert!(!record.is_tracked());
        assert!(record.tracked_pod.is_none());
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn test_advance_resets_attempts() {
        let t = now();
        let mut record = NodeUpgradeRecord::upgrade_required("worker-1", t);
        record.record_failure("boom", t, 5);
        assert_eq!(record.attempt_count, 1);

        record.advance(UpgradeState::CordonRequired, t);
        assert_eq!(record.state, UpgradeState::CordonRequired);
        assert_eq!(record.attempt_count, 0);
        assert!(record.last_error.is_none());
        assert!(record.last_attempt_time.is_none());
    }

    #[test]
    fn test_advance_to_up_to_date_clears_tracked_pod() {
        let t = now();
        let mut record = NodeUpgradeRecord::upgrade_required("worker-1", t);
        record.tracked_pod = Some(PodRef::new("drivers", "mofed-abc"));
        record.advance(UpgradeState::UpToDate, t);
        assert!(record.tracked_pod.is_none());
    }

    #[test]
    fn test_record_failure_reaches_failed_at_budget() {
        let t = now();
        let mut record = NodeUpgradeRecord::upgrade_required("worker-1", t);
        record.advance(UpgradeState::DrainRequired, t);

        assert!(!record.record_failure("e1", t, 3));
        assert!(!record.record_failure("e2", t, 3));
        assert!(record.record_failure("e3", t, 3));
        assert_eq!(record.state, UpgradeState::Failed);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.last_error.as_deref(), Some("e3"));
    }

    #[test]
    fn test_in_backoff() {
        let t = now();
        let backoff = BackoffPolicy::Fixed(Duration::from_secs(60));
        let mut record = NodeUpgradeRecord::upgrade_required("worker-1", t);
        record.advance(UpgradeState::CordonRequired, t);
        assert!(!record.in_backoff(&backoff, t));

        record.record_failure("boom", t, 5);
        assert!(record.in_backoff(&backoff, t + chrono::Duration::seconds(30)));
        assert!(!record.in_backoff(&backoff, t + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let t = now();
        let mut record = NodeUpgradeRecord::upgrade_required("worker-1", t);
        record.advance(UpgradeState::PodDeletionRequired, t);
        record.tracked_pod = Some(PodRef::new("drivers", "mofed-abc"));
        record
            .annotations
            .insert(PRE_CORDONED.to_string(), "true".to_string());

        let (label, json) = record.to_metadata().unwrap();
        assert_eq!(label, "pod-deletion-required");

        let decoded = NodeUpgradeRecord::from_metadata("worker-1", Some(&label), Some(&json));
        assert_eq!(decoded, record);
        assert!(decoded.pre_cordoned());
    }

    #[test]
    fn test_from_metadata_without_label_is_untracked() {
        let record = NodeUpgradeRecord::from_metadata("worker-1", None, Some("{}"));
        assert!(!record.is_tracked());
    }

    #[test]
    fn test_from_metadata_unknown_label_is_untracked() {
        let record = NodeUpgradeRecord::from_metadata("worker-1", Some("half-done"), None);
        assert!(!record.is_tracked());
    }

    #[test]
    fn test_from_metadata_bad_body_keeps_state() {
        let record =
            NodeUpgradeRecord::from_metadata("worker-1", Some("upgrade-failed"), Some("{not json"));
        assert_eq!(record.state, UpgradeState::Failed);
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn test_time_in_state() {
        let t = now();
        let mut record = NodeUpgradeRecord::upgrade_required("worker-1", t);
        record.advance(UpgradeState::WaitForPodReady, t - chrono::Duration::seconds(90));
        assert!(record.time_in_state(t) >= Duration::from_secs(90));
        assert_eq!(
            NodeUpgradeRecord::untracked("x").time_in_state(t),
            Duration::ZERO
        );
    }
}
