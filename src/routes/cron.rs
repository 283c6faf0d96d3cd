//! Trigger endpoints for an external cron

use axum::{Json, Router, extract::State, routing::post};
use chrono::Utc;

use slotbook_core::orchestrator::{CompletionReport, DispatchReport};
use slotbook_core::scheduler::ExtensionReport;

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cron/extend-series", post(extend_series))
        .route("/cron/send-bills", post(send_bills))
        .route("/cron/complete", post(complete))
}

/// POST /cron/extend-series - Materialize the next occurrence of every active series
async fn extend_series(State(state): State<AppState>) -> Result<Json<ExtensionReport>, AppError> {
    Ok(Json(state.scheduler().run_once().await?))
}

/// POST /cron/send-bills - Send payment requests that have come due
async fn send_bills(State(state): State<AppState>) -> Result<Json<DispatchReport>, AppError> {
    Ok(Json(state.orchestrator().send_due_bills(Utc::now()).await?))
}

/// POST /cron/complete - Complete bookings that have ended
async fn complete(State(state): State<AppState>) -> Result<Json<CompletionReport>, AppError> {
    Ok(Json(state.orchestrator().complete_elapsed(Utc::now()).await?))
}
