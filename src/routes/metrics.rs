//! Prometheus metrics endpoint

use axum::extract::State;
use axum::response::IntoResponse;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::AppState;
use crate::tasks::history_cleanup::CycleReport;

/// Cleanup counters exported to Prometheus
#[derive(Default)]
pub struct Metrics {
    /// Completed cleanup cycles
    pub cycles_total: AtomicU64,
    /// Cycles rolled back because of an error
    pub cycle_failures_total: AtomicU64,
    /// Ids selected across all cycles
    pub ids_selected_total: AtomicU64,
    process_instances_deleted: AtomicU64,
    decision_instances_deleted: AtomicU64,
    case_instances_deleted: AtomicU64,
    batches_deleted: AtomicU64,
    batch_dependents_deleted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, report: &CycleReport) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        self.ids_selected_total
            .fetch_add(report.selected as u64, Ordering::Relaxed);

        let deleted = &report.deleted;
        self.process_instances_deleted
            .fetch_add(deleted.process_instances, Ordering::Relaxed);
        self.decision_instances_deleted
            .fetch_add(deleted.decision_instances, Ordering::Relaxed);
        self.case_instances_deleted
            .fetch_add(deleted.case_instances, Ordering::Relaxed);
        self.batches_deleted.fetch_add(deleted.batches, Ordering::Relaxed);
        self.batch_dependents_deleted
            .fetch_add(deleted.batch_dependents, Ordering::Relaxed);
    }

    pub fn inc_failures(&self) {
        self.cycle_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycle_failures_total: self.cycle_failures_total.load(Ordering::Relaxed),
            ids_selected_total: self.ids_selected_total.load(Ordering::Relaxed),
            process_instances_deleted: self.process_instances_deleted.load(Ordering::Relaxed),
            decision_instances_deleted: self.decision_instances_deleted.load(Ordering::Relaxed),
            case_instances_deleted: self.case_instances_deleted.load(Ordering::Relaxed),
            batches_deleted: self.batches_deleted.load(Ordering::Relaxed),
            batch_dependents_deleted: self.batch_dependents_deleted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cycles_total: u64,
    pub cycle_failures_total: u64,
    pub ids_selected_total: u64,
    pub process_instances_deleted: u64,
    pub decision_instances_deleted: u64,
    pub case_instances_deleted: u64,
    pub batches_deleted: u64,
    pub batch_dependents_deleted: u64,
}

impl MetricsSnapshot {
    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        format!(
            r#"# HELP history_cleanup_cycles_total Total number of completed cleanup cycles
# TYPE history_cleanup_cycles_total counter
history_cleanup_cycles_total {}

# HELP history_cleanup_cycle_failures_total Total number of cleanup cycles that failed
# TYPE history_cleanup_cycle_failures_total counter
history_cleanup_cycle_failures_total {}

# HELP history_cleanup_ids_selected_total Total number of ids selected for cleanup
# TYPE history_cleanup_ids_selected_total counter
history_cleanup_ids_selected_total {}

# HELP history_cleanup_deleted_total Total number of history rows deleted by record kind
# TYPE history_cleanup_deleted_total counter
history_cleanup_deleted_total{{kind="process_instance"}} {}
history_cleanup_deleted_total{{kind="decision_instance"}} {}
history_cleanup_deleted_total{{kind="case_instance"}} {}
history_cleanup_deleted_total{{kind="batch"}} {}
history_cleanup_deleted_total{{kind="batch_dependent"}} {}

# HELP history_cleanup_info Build information
# TYPE history_cleanup_info gauge
history_cleanup_info{{version="{}"}} 1
"#,
            self.cycles_total,
            self.cycle_failures_total,
            self.ids_selected_total,
            self.process_instances_deleted,
            self.decision_instances_deleted,
            self.case_instances_deleted,
            self.batches_deleted,
            self.batch_dependents_deleted,
            env!("CARGO_PKG_VERSION"),
        )
    }
}

/// GET /metrics
///
/// Returns Prometheus-format metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let output = state.metrics.get_metrics().render();

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeletionCounts;
    use chrono::Utc;
    use uuid::Uuid;

    fn report(selected: usize, deleted: DeletionCounts) -> CycleReport {
        CycleReport {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            budget: 10,
            selected,
            deleted,
        }
    }

    #[test]
    fn test_record_cycle_accumulates() {
        let metrics = Metrics::new();
        let deleted = DeletionCounts {
            process_instances: 3,
            batches: 2,
            batch_dependents: 5,
            ..DeletionCounts::default()
        };
        metrics.record_cycle(&report(5, deleted));
        metrics.record_cycle(&report(5, deleted));
        metrics.inc_failures();

        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.cycles_total, 2);
        assert_eq!(snapshot.cycle_failures_total, 1);
        assert_eq!(snapshot.ids_selected_total, 10);
        assert_eq!(snapshot.process_instances_deleted, 6);
        assert_eq!(snapshot.batches_deleted, 4);
        assert_eq!(snapshot.batch_dependents_deleted, 10);
        assert_eq!(snapshot.case_instances_deleted, 0);
    }

    #[test]
    fn test_render_labels_kinds() {
        let metrics = Metrics::new();
        metrics.record_cycle(&report(
            1,
            DeletionCounts {
                case_instances: 1,
                ..DeletionCounts::default()
            },
        ));

        let output = metrics.get_metrics().render();
        assert!(output.contains("history_cleanup_cycles_total 1\n"));
        assert!(output.contains("history_cleanup_deleted_total{kind=\"case_instance\"} 1\n"));
        assert!(output.contains("history_cleanup_deleted_total{kind=\"batch\"} 0\n"));
    }
}
