//! Per-node upgrade states and their transition edges.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Upgrade state of a single node.
///
/// The forward path is linear: every non-terminal state has exactly one
/// successor, and any non-terminal state may drop to [`UpgradeState::Failed`]
/// once its retry budget is spent.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
pub enum UpgradeState {
    UpToDate,
    UpgradeRequired,
    CordonRequired,
    PodDeletionRequired,
    DrainRequired,
    WaitForPodReady,
    UncordonRequired,
    Failed,
}

impl UpgradeState {
    pub const ALL: [Self; 8] = [
        Self::UpToDate,
        Self::UpgradeRequired,
        Self::CordonRequired,
        Self::PodDeletionRequired,
        Self::DrainRequired,
        Self::WaitForPodReady,
        Self::UncordonRequired,
        Self::Failed,
    ];

    /// Value stored in the node's state label.
    pub const fn label_value(self) -> &'static str {
        match self {
            Self::UpToDate => "upgrade-done",
            Self::UpgradeRequired => "upgrade-required",
            Self::CordonRequired => "cordon-required",
            Self::PodDeletionRequired => "pod-deletion-required",
            Self::DrainRequired => "drain-required",
            Self::WaitForPodReady => "wait-for-pod-ready",
            Self::UncordonRequired => "uncordon-required",
            Self::Failed => "upgrade-failed",
        }
    }

    pub fn from_label_value(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.label_value() == value)
    }

    /// Successor on the forward path, `None` for terminal states.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::UpgradeRequired => Some(Self::CordonRequired),
            Self::CordonRequired => Some(Self::PodDeletionRequired),
            Self::PodDeletionRequired => Some(Self::DrainRequired),
            Self::DrainRequired => Some(Self::WaitForPodReady),
            Self::WaitForPodReady => Some(Self::UncordonRequired),
            Self::UncordonRequired => Some(Self::UpToDate),
            Self::UpToDate | Self::Failed => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::UpToDate | Self::Failed)
    }

    /// States that count against the parallel upgrade budget.
    pub const fn is_in_flight(self) -> bool {
        !matches!(self, Self::UpToDate | Self::UpgradeRequired | Self::Failed)
    }

    /// Whether the coordinator may move a node from `self` to `to`.
    ///
    /// Besides the forward edges this admits detection of a version mismatch
    /// (`UpToDate -> UpgradeRequired`), dropping a not-yet-admitted node whose
    /// version converged on its own (`UpgradeRequired -> UpToDate`) and the
    /// retry budget running out.
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.next() == Some(to) {
            return true;
        }
        match (self, to) {
            (Self::UpToDate, Self::UpgradeRequired) | (Self::UpgradeRequired, Self::UpToDate) => {
                true
            }
            (from, Self::Failed) => !from.is_terminal() && from != Self::UpgradeRequired,
            _ => false,
        }
    }
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpToDate => write!(f, "UpToDate"),
            Self::UpgradeRequired => write!(f, "UpgradeRequired"),
            Self::CordonRequired => write!(f, "CordonRequired"),
            Self::PodDeletionRequired => write!(f, "PodDeletionRequired"),
            Self::DrainRequired => write!(f, "DrainRequired"),
            Self::WaitForPodReady => write!(f, "WaitForPodReady"),
            Self::UncordonRequired => write!(f, "UncordonRequired"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
