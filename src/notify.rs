//! Notification messages for rollout events.

pub mod slack;

pub use slack::{SlackMessage, SlackNotifier};

use crate::crd::UpgradeState;
use crate::upgrade::CycleReport;
use crate::upgrade::coordinator::FailedNode;

/// Build the message for a node that just exhausted its retry budget.
pub fn build_node_failed_message(policy: &str, node: &FailedNode) -> SlackMessage {
    SlackMessage {
        header: "Driver Upgrade Failed on Node".to_string(),
        fields: vec![
            ("Node".to_string(), node.name.clone()),
            ("Attempts".to_string(), node.attempts.to_string()),
            (
                "Last Error".to_string(),
                node.last_error
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
            (
                "Recovery".to_string(),
                format!("`duo reset-node {}`", node.name),
            ),
        ],
        context: format!("Sent by duo via DriverUpgradePolicy/{policy}"),
    }
}

/// Build the message for a rollout where every node settled.
pub fn build_rollout_completed_message(policy: &str, report: &CycleReport) -> SlackMessage {
    let failed = report.count(UpgradeState::Failed);
    let header = if failed == 0 {
        "Driver Rollout Completed"
    } else {
        "Driver Rollout Settled with Failures"
    };
    SlackMessage {
        header: header.to_string(),
        fields: vec![
            ("Nodes".to_string(), report.total().to_string()),
            (
                "Up To Date".to_string(),
                report.count(UpgradeState::UpToDate).to_string(),
            ),
            ("Failed".to_string(), failed.to_string()),
        ],
        context: format!("Sent by duo via DriverUpgradePolicy/{policy}"),
    }
}
