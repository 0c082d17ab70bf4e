//! Core domain models for history cleanup

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Historic record kinds, in the order cleanup serves them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Finished process instances
    ProcessInstance,
    /// Decision evaluations
    DecisionInstance,
    /// Closed case instances
    CaseInstance,
    /// Completed batch operations
    Batch,
}

impl RecordKind {
    pub const PRIORITY: [RecordKind; 4] = [
        RecordKind::ProcessInstance,
        RecordKind::DecisionInstance,
        RecordKind::CaseInstance,
        RecordKind::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::ProcessInstance => "process_instance",
            RecordKind::DecisionInstance => "decision_instance",
            RecordKind::CaseInstance => "case_instance",
            RecordKind::Batch => "batch",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Days a finished batch is kept, keyed by batch operation type
pub type RetentionPolicy = HashMap<String, i32>;

/// Identifiers selected for deletion in one cleanup cycle.
///
/// Never holds more ids in total than the budget it was built with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupBatch {
    pub process_instance_ids: Vec<String>,
    pub decision_instance_ids: Vec<String>,
    pub case_instance_ids: Vec<String>,
    pub batch_ids: Vec<String>,
}

impl CleanupBatch {
    /// Total number of ids across all record kinds
    pub fn size(&self) -> usize {
        self.process_instance_ids.len()
            + self.decision_instance_ids.len()
            + self.case_instance_ids.len()
            + self.batch_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn ids(&self, kind: RecordKind) -> &[String] {
        match kind {
            RecordKind::ProcessInstance => &self.process_instance_ids,
            RecordKind::DecisionInstance => &self.decision_instance_ids,
            RecordKind::CaseInstance => &self.case_instance_ids,
            RecordKind::Batch => &self.batch_ids,
        }
    }

    pub(crate) fn ids_mut(&mut self, kind: RecordKind) -> &mut Vec<String> {
        match kind {
            RecordKind::ProcessInstance => &mut self.process_instance_ids,
            RecordKind::DecisionInstance => &mut self.decision_instance_ids,
            RecordKind::CaseInstance => &mut self.case_instance_ids,
            RecordKind::Batch => &mut self.batch_ids,
        }
    }
}

/// Rows removed for each record kind during one cleanup cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletionCounts {
    pub process_instances: u64,
    pub decision_instances: u64,
    pub case_instances: u64,
    pub batches: u64,
    /// Incidents and job logs removed along with batches
    pub batch_dependents: u64,
}

impl DeletionCounts {
    pub fn total(&self) -> u64 {
        self.process_instances
            + self.decision_instances
            + self.case_instances
            + self.batches
            + self.batch_dependents
    }
}

/// Finished batches of one operation type, as counted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedBatchCount {
    pub batch_type: String,
    pub finished: u64,
    /// Finished batches whose time-to-live has expired
    pub cleanable: u64,
}

/// One row of the cleanable batch report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanableBatchReport {
    pub batch_type: String,
    /// `None` when the retention map has no entry for this type
    pub history_time_to_live: Option<i32>,
    pub finished_batches: u64,
    pub cleanable_batches: u64,
}
