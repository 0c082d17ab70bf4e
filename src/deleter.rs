//! Cascading deletion of historic batches

use crate::error::Result;
use crate::store::BatchHistoryStore;
use serde::Serialize;
use tracing::debug;

/// Rows removed while deleting a set of historic batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchDeletion {
    pub incidents: u64,
    pub job_logs: u64,
    pub batches: u64,
}

/// Deletes historic batches after the incidents and job logs that reference them.
///
/// Nothing is retried and nothing is rolled back here: a failing step aborts the
/// remaining ones and atomicity comes from the caller's transaction.
pub struct CascadingBatchDeleter<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> CascadingBatchDeleter<'a, S>
where
    S: BatchHistoryStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn delete_batches(&self, ids: &[String]) -> Result<BatchDeletion> {
        if ids.is_empty() {
            return Ok(BatchDeletion::default());
        }

        let incidents = self.store.delete_incidents_by_batch_ids(ids).await?;
        let job_logs = self.store.delete_job_logs_by_batch_ids(ids).await?;
        let batches = self.store.delete_batches_preserving_order(ids).await?;

        debug!(
            requested = ids.len(),
            incidents = incidents,
            job_logs = job_logs,
            batches = batches,
            "Deleted historic batches"
        );

        Ok(BatchDeletion {
            incidents,
            job_logs,
            batches,
        })
    }
}
