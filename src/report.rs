//! Report of finished historic batches and how many of them cleanup may remove

use crate::error::Result;
use crate::models::{CleanableBatchReport, RetentionPolicy};
use crate::store::BatchReportSource;
use chrono::{DateTime, Utc};

/// One row per operation type with finished batches, ordered by type.
///
/// Types missing from `retention` carry no time-to-live and are never cleanable.
pub async fn cleanable_batch_report<S: BatchReportSource + ?Sized>(
    source: &S,
    now: DateTime<Utc>,
    retention: &RetentionPolicy,
) -> Result<Vec<CleanableBatchReport>> {
    let counts = source.count_finished_batches(now, retention).await?;

    let mut report: Vec<CleanableBatchReport> = counts
        .into_iter()
        .map(|count| {
            let history_time_to_live = retention.get(&count.batch_type).copied();
            CleanableBatchReport {
                cleanable_batches: if history_time_to_live.is_some() {
                    count.cleanable
                } else {
                    0
                },
                history_time_to_live,
                finished_batches: count.finished,
                batch_type: count.batch_type,
            }
        })
        .collect();
    report.sort_by(|a, b| a.batch_type.cmp(&b.batch_type));

    Ok(report)
}
