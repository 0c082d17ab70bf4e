//! History cleanup task - purges expired history inside the batch window

use crate::builder::CleanupBatchBuilder;
use crate::clock::Clock;
use crate::db::Database;
use crate::deleter::CascadingBatchDeleter;
use crate::error::Result;
use crate::models::DeletionCounts;
use crate::routes::metrics::Metrics;
use crate::state::{AppState, CleanupStatus};
use crate::store::HistoryStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delay before re-checking after a cycle that did not fill its batch
const MIN_IDLE_DELAY: Duration = Duration::from_secs(10);
/// Upper bound for the idle delay while inside the window
const MAX_IDLE_DELAY: Duration = Duration::from_secs(60 * 60);
/// Delay before retrying a failed cycle
const FAILURE_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Outcome of one cleanup cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub budget: usize,
    /// Ids the batch builder selected
    pub selected: usize,
    pub deleted: DeletionCounts,
}

impl CycleReport {
    /// A full batch suggests more expired history is waiting.
    pub fn batch_was_full(&self) -> bool {
        self.budget > 0 && self.selected >= self.budget
    }
}

/// Doubling delay used while cycles keep coming back short.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    current: Duration,
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self {
            current: MIN_IDLE_DELAY,
        }
    }
}

impl IdleBackoff {
    /// The delay to wait now; the following one is twice as long, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_IDLE_DELAY);
        delay
    }

    pub fn reset(&mut self) {
        self.current = MIN_IDLE_DELAY;
    }
}

/// Select one batch and delete it, kind by kind in priority order.
pub async fn run_cleanup_cycle<S: HistoryStore>(
    builder: &CleanupBatchBuilder,
    store: &S,
    started_at: DateTime<Utc>,
) -> Result<CycleReport> {
    let budget = builder.settings().batch_size;
    let batch = builder.build_next_batch(budget, store).await?;
    let mut deleted = DeletionCounts::default();

    if !batch.process_instance_ids.is_empty() {
        deleted.process_instances = store
            .delete_process_instances(&batch.process_instance_ids)
            .await?;
    }
    if !batch.decision_instance_ids.is_empty() {
        deleted.decision_instances = store
            .delete_decision_instances(&batch.decision_instance_ids)
            .await?;
    }
    if !batch.case_instance_ids.is_empty() {
        deleted.case_instances = store.delete_case_instances(&batch.case_instance_ids).await?;
    }

    let batches = CascadingBatchDeleter::new(store)
        .delete_batches(&batch.batch_ids)
        .await?;
    deleted.batches = batches.batches;
    deleted.batch_dependents = batches.incidents + batches.job_logs;

    Ok(CycleReport {
        cycle_id: Uuid::new_v4(),
        started_at,
        budget,
        selected: batch.size(),
        deleted,
    })
}

/// Runs one cleanup cycle as a single unit of work.
#[async_trait]
pub trait CleanupCycleRunner: Send + Sync {
    async fn run_cycle(
        &self,
        builder: &CleanupBatchBuilder,
        started_at: DateTime<Utc>,
    ) -> Result<CycleReport>;
}

/// Each cycle runs in its own transaction; a failed cycle is rolled back.
#[async_trait]
impl CleanupCycleRunner for Database {
    async fn run_cycle(
        &self,
        builder: &CleanupBatchBuilder,
        started_at: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let tx = self.begin_cleanup().await?;
        match run_cleanup_cycle(builder, &tx, started_at).await {
            Ok(report) => {
                tx.commit().await?;
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back cleanup transaction");
                }
                Err(e)
            }
        }
    }
}

/// What the cleanup task does after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Sleep, then step again
    Wait(Duration),
    /// The window cannot be evaluated, the task ends
    Stop,
}

/// Decides, one step at a time, whether to run a cleanup cycle now or how long to wait.
pub struct CleanupScheduler<R> {
    runner: Arc<R>,
    builder: CleanupBatchBuilder,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    status: Arc<CleanupStatus>,
    backoff: IdleBackoff,
}

impl CleanupScheduler<Database> {
    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            Arc::clone(&state.db),
            state.builder.clone(),
            Arc::clone(&state.clock),
            Arc::clone(&state.metrics),
            Arc::clone(&state.status),
        )
    }
}

impl<R: CleanupCycleRunner> CleanupScheduler<R> {
    pub fn new(
        runner: Arc<R>,
        builder: CleanupBatchBuilder,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        status: Arc<CleanupStatus>,
    ) -> Self {
        Self {
            runner,
            builder,
            clock,
            metrics,
            status,
            backoff: IdleBackoff::default(),
        }
    }

    /// Check the window and, when it is open, run one cycle.
    ///
    /// Outside the window the wait lasts until it next opens. A full batch
    /// is followed by another cycle at once; short batches back off from 10s
    /// up to an hour. A failed cycle is retried after a minute.
    pub async fn step(&mut self) -> NextStep {
        let window = &self.builder.settings().batch_window;
        let now = self.clock.now();

        let within = match window.is_within(now) {
            Ok(within) => within,
            Err(e) => {
                error!(error = %e, "Cannot evaluate batch window, stopping history cleanup");
                return NextStep::Stop;
            }
        };

        if !within {
            self.backoff.reset();
            return match window.next_run_at_or_after(now) {
                Ok(next) => {
                    debug!(next_run = %next, "Outside batch window");
                    self.status.set_next_run(Some(next));
                    NextStep::Wait((next - now).to_std().unwrap_or(Duration::ZERO))
                }
                Err(e) => {
                    error!(error = %e, "Cannot schedule next history cleanup");
                    NextStep::Stop
                }
            };
        }

        self.status.set_next_run(None);

        let delay = match self.runner.run_cycle(&self.builder, now).await {
            Ok(report) => {
                self.metrics.record_cycle(&report);
                if report.selected > 0 {
                    info!(
                        cycle_id = %report.cycle_id,
                        selected = report.selected,
                        process_instances = report.deleted.process_instances,
                        decision_instances = report.deleted.decision_instances,
                        case_instances = report.deleted.case_instances,
                        batches = report.deleted.batches,
                        batch_dependents = report.deleted.batch_dependents,
                        "History cleanup cycle complete"
                    );
                } else {
                    debug!("No history ready for cleanup");
                }

                let full = report.batch_was_full();
                self.status.set_last_cycle(report);
                if full {
                    self.backoff.reset();
                    Duration::ZERO
                } else {
                    self.backoff.next_delay()
                }
            }
            Err(e) => {
                self.metrics.inc_failures();
                error!(error = %e, "History cleanup cycle failed");
                FAILURE_RETRY_DELAY
            }
        };

        // measured after the cycle, which may have taken a while
        let finished = self.clock.now();
        self.status
            .set_next_run(chrono::Duration::from_std(delay).ok().map(|d| finished + d));
        NextStep::Wait(delay)
    }

    /// Step until the window can no longer be evaluated.
    pub async fn run(mut self) {
        while let NextStep::Wait(delay) = self.step().await {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Background task that removes expired history while the batch window is open.
///
/// Without a configured window the task exits.
pub async fn history_cleanup_task(state: AppState) {
    let window = &state.settings().batch_window;
    let (Some(start), Some(end)) = (window.start(), window.end()) else {
        warn!("Batch window not configured, history cleanup task disabled");
        return;
    };

    if window.is_always_open(state.clock.now()) {
        warn!(start = %start, end = %end, "Batch window start equals end, cleanup may run at any time");
    }

    info!(
        start = %start,
        end = %end,
        zone = %window.zone(),
        batch_size = state.settings().batch_size,
        "History cleanup task started"
    );

    CleanupScheduler::from_state(&state).run().await;
}
