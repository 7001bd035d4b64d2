//! Error types for duo.

use std::time::Duration;

use thiserror::Error;

/// Why a drain did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainFailure {
    /// Cordoning the node failed.
    Cordon,
    /// Listing the pods on the node failed.
    ListPods,
    /// Pods with local storage are present and `deleteEmptyDir` is off.
    LocalStorage,
    /// Pods were still present when the drain timeout fired.
    Timeout,
}

impl std::fmt::Display for DrainFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cordon => write!(f, "Cordon"),
            Self::ListPods => write!(f, "ListPods"),
            Self::LocalStorage => write!(f, "LocalStorage"),
            Self::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Errors raised while orchestrating node upgrades.
#[derive(Error, Debug)]
pub enum UpgradeError {
    /// The resource changed between read and write, or vanished under us.
    #[error("Conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("State store error for node {node}: {message}")]
    Store { node: String, message: String },

    #[error("Drain of node {node} failed ({reason}): {message}")]
    Drain {
        node: String,
        reason: DrainFailure,
        message: String,
        remaining_pods: Vec<String>,
    },

    #[error("Failed to delete pod {pod}: {message}")]
    Delete { pod: String, message: String },

    #[error("Failed to uncordon node {node}: {message}")]
    Uncordon { node: String, message: String },

    /// Building the cluster snapshot failed; the whole cycle is skipped.
    #[error("Failed to build cluster snapshot: {0}")]
    Snapshot(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// HTTP status code of a Kubernetes API error response, if any.
pub fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

impl UpgradeError {
    /// Classify the error of a guarded write against `resource`.
    pub fn from_write(resource: &str, err: kube::Error) -> Self {
        Self::conflict_for_code(resource, api_code(&err)).unwrap_or(Self::Kube(err))
    }

    /// 409 means our `resourceVersion` precondition failed; 404 means the
    /// object was deleted after we read it. Both are conflicts from the
    /// caller's point of view.
    fn conflict_for_code(resource: &str, code: Option<u16>) -> Option<Self> {
        let message = match code {
            Some(409) => "resourceVersion changed since read",
            Some(404) => "deleted concurrently",
            _ => return None,
        };
        Some(Self::Conflict {
            resource: resource.to_string(),
            message: message.to_string(),
        })
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(e) => api_code(e) == Some(404),
            _ => false,
        }
    }

    /// Returns true if a later cycle may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube(e) => {
                matches!(api_code(e), Some(code) if code >= 500 || code == 429)
                    || matches!(e, kube::Error::Service(_))
            }
            Self::InvalidPolicy(_) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_for_409() {
        let err = UpgradeError::conflict_for_code("node worker-1", Some(409)).unwrap();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("node worker-1"));
    }

    #[test]
    fn test_conflict_for_404() {
        let err = UpgradeError::conflict_for_code("node worker-1", Some(404)).unwrap();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("deleted concurrently"));
    }

    #[test]
    fn test_other_codes_are_not_conflicts() {
        assert!(UpgradeError::conflict_for_code("node worker-1", Some(403)).is_none());
        assert!(UpgradeError::conflict_for_code("node worker-1", Some(500)).is_none());
        assert!(UpgradeError::conflict_for_code("node worker-1", None).is_none());
    }

    #[test]
    fn test_display_timeout() {
        let err = UpgradeError::Timeout {
            operation: "drain worker-2".to_string(),
            after: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "drain worker-2 timed out after 300s");
    }

    #[test]
    fn test_display_drain() {
        let err = UpgradeError::Drain {
            node: "worker-2".to_string(),
            reason: DrainFailure::Timeout,
            message: "2 pod(s) still present".to_string(),
            remaining_pods: vec!["a/x".to_string(), "b/y".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Drain of node worker-2 failed (Timeout): 2 pod(s) still present"
        );
    }

    #[test]
    fn test_is_not_found() {
        assert!(UpgradeError::NotFound("pod a/b".into()).is_not_found());
        assert!(!UpgradeError::Snapshot("x".into()).is_not_found());
    }

    #[test]
    fn test_is_transient() {
        assert!(UpgradeError::Snapshot("lost connection".into()).is_transient());
        assert!(
            UpgradeError::Conflict {
                resource: "node a".into(),
                message: "changed".into()
            }
            .is_transient()
        );
        assert!(!UpgradeError::InvalidPolicy("bad selector".into()).is_transient());
    }
}
