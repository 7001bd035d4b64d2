//! Bounded re-read-and-retry for resourceVersion-guarded writes.

use std::future::Future;

use tracing::debug;

use crate::error::UpgradeError;

/// Attempts made before a conflict is surfaced to the caller.
pub const CONFLICT_RETRIES: u32 = 3;

/// Run `op` until it stops failing with [`UpgradeError::Conflict`].
///
/// `op` must re-read the object on every call so each attempt patches
/// against a fresh `resourceVersion`.
pub async fn retry_on_conflict<T, F, Fut>(resource: &str, mut op: F) -> Result<T, UpgradeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpgradeError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                debug!(resource, attempt, "Write conflict, re-reading");
                attempt += 1;
            }
            result => return result,
        }
    }
}
