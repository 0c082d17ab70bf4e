//! Assembly of bounded cleanup batches across record kinds

use crate::clock::Clock;
use crate::config::CleanupSettings;
use crate::error::Result;
use crate::models::{CleanupBatch, RecordKind};
use crate::store::CleanableHistory;
use std::sync::Arc;
use tracing::{debug, warn};

/// Selects the next unit of cleanup work.
///
/// Record kinds are served in strict priority: process instances, then
/// decision instances, case instances and finally historic batches. Each
/// kind only gets the budget the kinds before it left over, so a backlog of
/// process instances is always drained first.
#[derive(Clone)]
pub struct CleanupBatchBuilder {
    settings: Arc<CleanupSettings>,
    clock: Arc<dyn Clock>,
}

impl CleanupBatchBuilder {
    pub fn new(settings: Arc<CleanupSettings>, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    pub fn settings(&self) -> &CleanupSettings {
        &self.settings
    }

    /// Build a batch using the configured batch size as budget.
    pub async fn next_batch(&self, source: &dyn CleanableHistory) -> Result<CleanupBatch> {
        self.build_next_batch(self.settings.batch_size, source).await
    }

    /// Build a batch holding at most `budget` ids in total.
    ///
    /// An empty batch means there is nothing to clean up this cycle.
    pub async fn build_next_batch(
        &self,
        budget: usize,
        source: &dyn CleanableHistory,
    ) -> Result<CleanupBatch> {
        let now = self.clock.now();
        let mut batch = CleanupBatch::default();

        for kind in RecordKind::PRIORITY {
            let remaining = budget.saturating_sub(batch.size());
            if remaining == 0 {
                break;
            }

            let ids = match kind {
                RecordKind::ProcessInstance => {
                    source.find_process_instance_ids_for_cleanup(remaining, now).await?
                }
                RecordKind::DecisionInstance if self.settings.dmn_enabled => {
                    source.find_decision_instance_ids_for_cleanup(remaining, now).await?
                }
                RecordKind::CaseInstance if self.settings.cmmn_enabled => {
                    source.find_case_instance_ids_for_cleanup(remaining, now).await?
                }
                RecordKind::Batch if !self.settings.batch_retention.is_empty() => {
                    source
                        .find_batch_ids_for_cleanup(remaining, now, &self.settings.batch_retention)
                        .await?
                }
                _ => continue,
            };

            add_ids(&mut batch, kind, ids, remaining);
        }

        debug!(
            budget = budget,
            size = batch.size(),
            process_instances = batch.process_instance_ids.len(),
            decision_instances = batch.decision_instance_ids.len(),
            case_instances = batch.case_instance_ids.len(),
            batches = batch.batch_ids.len(),
            "Assembled history cleanup batch"
        );

        Ok(batch)
    }
}

fn add_ids(batch: &mut CleanupBatch, kind: RecordKind, mut ids: Vec<String>, remaining: usize) {
    if ids.len() > remaining {
        warn!(
            kind = %kind,
            returned = ids.len(),
            limit = remaining,
            "Cleanup query returned more ids than requested, truncating"
        );
        ids.truncate(remaining);
    }
    if !ids.is_empty() {
        batch.ids_mut(kind).extend(ids);
    }
}
