//! Storage seams the cleanup services query and delete through

use crate::error::Result;
use crate::models::{FinishedBatchCount, RetentionPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Lookup of historic records whose retention has expired.
///
/// Every method returns at most `limit` ids ordered by completion time,
/// oldest first.
#[async_trait]
pub trait CleanableHistory: Send + Sync {
    async fn find_process_instance_ids_for_cleanup(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn find_decision_instance_ids_for_cleanup(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn find_case_instance_ids_for_cleanup(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Batches of the operation types in `retention` that ended more than
    /// their type's time-to-live before `now`.
    async fn find_batch_ids_for_cleanup(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        retention: &RetentionPolicy,
    ) -> Result<Vec<String>>;
}

/// Deletion of historic instances together with their dependent history.
#[async_trait]
pub trait InstanceHistoryStore: Send + Sync {
    async fn delete_process_instances(&self, ids: &[String]) -> Result<u64>;
    async fn delete_decision_instances(&self, ids: &[String]) -> Result<u64>;
    async fn delete_case_instances(&self, ids: &[String]) -> Result<u64>;
}

/// Deletion of historic batches and the records that reference them.
#[async_trait]
pub trait BatchHistoryStore: Send + Sync {
    async fn delete_incidents_by_batch_ids(&self, ids: &[String]) -> Result<u64>;
    async fn delete_job_logs_by_batch_ids(&self, ids: &[String]) -> Result<u64>;
    /// Remove the batch rows one after another in the order given.
    async fn delete_batches_preserving_order(&self, ids: &[String]) -> Result<u64>;
}

/// Aggregates over finished historic batches.
#[async_trait]
pub trait BatchReportSource: Send + Sync {
    /// Finished batches per operation type, with how many of them the
    /// retention map makes cleanable at `now`.
    async fn count_finished_batches(
        &self,
        now: DateTime<Utc>,
        retention: &RetentionPolicy,
    ) -> Result<Vec<FinishedBatchCount>>;
}

/// A store that can serve a whole cleanup cycle.
pub trait HistoryStore: CleanableHistory + InstanceHistoryStore + BatchHistoryStore {}

impl<T> HistoryStore for T where T: CleanableHistory + InstanceHistoryStore + BatchHistoryStore {}
