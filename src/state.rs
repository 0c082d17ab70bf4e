//! Application state shared between the cleanup task and HTTP handlers

use crate::builder::CleanupBatchBuilder;
use crate::clock::Clock;
use crate::config::CleanupSettings;
use crate::db::Database;
use crate::routes::metrics::Metrics;
use crate::tasks::history_cleanup::CycleReport;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: Arc<Database>,
    /// Batch builder holding the read-only cleanup settings
    pub builder: CleanupBatchBuilder,
    /// Time source for window evaluation
    pub clock: Arc<dyn Clock>,
    /// Application metrics for Prometheus
    pub metrics: Arc<Metrics>,
    /// What the cleanup task did last and plans next
    pub status: Arc<CleanupStatus>,
}

impl AppState {
    /// Create new application state
    ///
    /// # Arguments
    /// * `db` - Database connection
    /// * `settings` - Cleanup settings loaded at startup
    /// * `clock` - Time source shared by the window and the batch builder
    pub fn new(db: Database, settings: CleanupSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            db: Arc::new(db),
            builder: CleanupBatchBuilder::new(Arc::new(settings), Arc::clone(&clock)),
            clock,
            metrics: Arc::new(Metrics::new()),
            status: Arc::new(CleanupStatus::default()),
        }
    }

    pub fn settings(&self) -> &CleanupSettings {
        self.builder.settings()
    }
}

/// Progress of the history cleanup task
#[derive(Debug, Default)]
pub struct CleanupStatus {
    last_cycle: RwLock<Option<CycleReport>>,
    next_run: RwLock<Option<DateTime<Utc>>>,
}

impl CleanupStatus {
    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.last_cycle.read().clone()
    }

    pub fn set_last_cycle(&self, report: CycleReport) {
        *self.last_cycle.write() = Some(report);
    }

    /// `None` while a cycle is running
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        *self.next_run.read()
    }

    pub fn set_next_run(&self, next_run: Option<DateTime<Utc>>) {
        *self.next_run.write() = next_run;
    }
}
