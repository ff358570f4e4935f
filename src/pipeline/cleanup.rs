//! Cleanup: delete everything the job created in storage.
//!
//! Runs on every terminal path and never fails. Each target gets its own
//! time bound; missing objects count as deleted, so a second run over the
//! same [`JobContext`] is harmless.

use crate::job::{CleanupTarget, JobContext};
use crate::storage::{ObjectStore, StoreError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a cleanup run achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub targets: usize,
    pub failed: usize,
}

async fn delete_target(store: &dyn ObjectStore, target: &CleanupTarget) -> Result<(), StoreError> {
    match target {
        CleanupTarget::Object(key) => match store.delete(key).await {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        },
        CleanupTarget::Prefix(prefix) => store.delete_prefix(prefix).await.map(|n| {
            debug!("Deleted {} objects under {}", n, prefix);
        }),
    }
}

/// Delete every recorded target, each under `limit`.
pub async fn cleanup(ctx: &JobContext, store: &dyn ObjectStore, limit: Duration) -> CleanupReport {
    let targets = ctx.cleanup_targets();
    let mut report = CleanupReport {
        targets: targets.len(),
        failed: 0,
    };
    for target in &targets {
        let result = match tokio::time::timeout(limit, delete_target(store, target)).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout {
                secs: limit.as_secs(),
            }),
        };
        if let Err(e) = result {
            warn!("Cleanup of {:?} failed: {}", target, e);
            report.failed += 1;
        }
    }
    info!(
        "Cleanup for job {}: {} targets, {} failed",
        ctx.job_id, report.targets, report.failed
    );
    report
}
