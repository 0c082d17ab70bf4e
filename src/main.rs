//! History cleanup daemon - purges expired process engine history inside a batch window

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use history_cleanup::clock::SystemClock;
use history_cleanup::config::AppConfig;
use history_cleanup::db::Database;
use history_cleanup::routes::{health, metrics, status};
use history_cleanup::state::AppState;
use history_cleanup::tasks::history_cleanup::history_cleanup_task;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "history_cleanup=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    // Connect to database
    let db = match Database::new(&config.database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            std::process::exit(1);
        }
    };

    let state = AppState::new(db, config.cleanup, Arc::new(SystemClock));

    // Cleanup task - runs batches while the window is open
    let cleanup_state = state.clone();
    tokio::spawn(async move {
        history_cleanup_task(cleanup_state).await;
    });

    // Build router
    let app = Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/api/v1/history-cleanup/status", get(status::cleanup_status))
        .route("/api/v1/history-cleanup/report", get(status::batch_report))
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http());

    let settings = state.settings();
    info!(
        "History cleanup v{} starting on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr
    );
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );
    info!(
        batch_size = settings.batch_size,
        dmn_enabled = settings.dmn_enabled,
        cmmn_enabled = settings.cmmn_enabled,
        batch_operation_types = settings.batch_retention.len(),
        "History cleanup settings"
    );

    // Start server
    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.listen_addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
