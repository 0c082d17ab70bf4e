//! History cleanup status endpoint

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::error::Result;
use crate::models::CleanableBatchReport;
use crate::report::cleanable_batch_report;
use crate::state::AppState;

/// GET /api/v1/history-cleanup/status
///
/// Reports the configured window, whether it is open right now, the last
/// cycle's outcome and when the task plans to run next.
pub async fn cleanup_status(State(state): State<AppState>) -> Json<Value> {
    Json(status_body(&state))
}

/// GET /api/v1/history-cleanup/report
///
/// Finished historic batches per operation type and how many of them are
/// cleanable under the configured retention map.
pub async fn batch_report(
    State(state): State<AppState>,
) -> Result<Json<Vec<CleanableBatchReport>>> {
    let report = cleanable_batch_report(
        state.db.as_ref(),
        state.clock.now(),
        &state.settings().batch_retention,
    )
    .await?;
    Ok(Json(report))
}

fn status_body(state: &AppState) -> Value {
    let settings = state.settings();
    let window = &settings.batch_window;
    let now = state.clock.now();

    let window_json = match (window.start(), window.end()) {
        (Some(start), Some(end)) => json!({
            "start": start.to_string(),
            "end": end.to_string(),
            "zone": window.zone().to_string(),
            "open": window.is_within(now).unwrap_or(false),
            "next_opening": window.next_run_at_or_after(now).ok(),
        }),
        _ => Value::Null,
    };

    json!({
        "now": now,
        "batch_size": settings.batch_size,
        "dmn_enabled": settings.dmn_enabled,
        "cmmn_enabled": settings.cmmn_enabled,
        "batch_retention_days": settings.batch_retention,
        "batch_window": window_json,
        "last_cycle": state.status.last_cycle(),
        "next_run": state.status.next_run(),
    })
}
