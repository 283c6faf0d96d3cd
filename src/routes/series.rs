//! Recurring series endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use chrono::{Datelike, NaiveDateTime, Weekday};
use serde::Deserialize;

use slotbook_core::BookingError;
use slotbook_core::booking::{BookingSeries, Money, SeriesStatus};
use slotbook_core::orchestrator::{NewSeries, SeriesOutcome};

use crate::routes::{AppError, Owner};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/series", post(create_series))
        .route("/series/{id}/status", post(set_series_status))
}

/// Request body for creating a series
#[derive(Deserialize)]
pub struct CreateSeriesRequest {
    pub client_id: String,
    pub client_email: String,
    pub timezone: String,
    /// Local start of the first occurrence, e.g. "2025-03-17T10:00".
    pub anchor: String,
    /// Defaults to the anchor's weekday.
    pub weekday: Option<String>,
    #[serde(default = "default_interval")]
    pub interval_weeks: u32,
    pub duration_minutes: u32,
    pub amount_minor: i64,
    pub first_session_amount_minor: Option<i64>,
    pub currency: Option<String>,
}

fn default_interval() -> u32 {
    1
}

fn parse_anchor(raw: &str) -> Result<NaiveDateTime, BookingError> {
    ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw.trim(), fmt).ok())
        .ok_or_else(|| BookingError::Validation(format!("anchor '{}' is not a local date-time", raw)))
}

/// POST /series - Create a recurring series and its first occurrence
async fn create_series(
    State(state): State<AppState>,
    owner: Owner,
    Json(req): Json<CreateSeriesRequest>,
) -> Result<(StatusCode, Json<SeriesOutcome>), AppError> {
    let anchor_local = parse_anchor(&req.anchor)?;
    let weekday = match &req.weekday {
        Some(raw) => raw
            .parse::<Weekday>()
            .map_err(|_| BookingError::Validation(format!("unknown weekday '{}'", raw)))?,
        None => anchor_local.weekday(),
    };
    let currency = req.currency.as_deref().unwrap_or(state.currency());

    let outcome = state
        .orchestrator()
        .create_series(NewSeries {
            owner_id: owner.0,
            client_id: req.client_id,
            client_email: req.client_email,
            timezone: req.timezone,
            anchor_local,
            weekday,
            interval_weeks: req.interval_weeks,
            duration_minutes: req.duration_minutes,
            price: Money::new(req.amount_minor, currency),
            first_session_price: req
                .first_session_amount_minor
                .map(|amount| Money::new(amount, currency)),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

/// POST /series/:id/status - Pause, resume or end a series
async fn set_series_status(
    State(state): State<AppState>,
    owner: Owner,
    Path(series_id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<BookingSeries>, AppError> {
    let status: SeriesStatus = req
        .status
        .parse()
        .map_err(|_| BookingError::Validation(format!("unknown series status '{}'", req.status)))?;
    let series = state
        .orchestrator()
        .set_series_status(&series_id, &owner.0, status)
        .await?;
    Ok(Json(series))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use slotbook_core::testing::Harness;

    use crate::routes::test_support::{app, post};

    #[test]
    fn test_parse_anchor_formats() {
        assert!(parse_anchor("2025-03-17T10:00").is_ok());
        assert!(parse_anchor("2025-03-17 10:00").is_ok());
        assert!(parse_anchor("2025-03-17").is_err());
    }

    #[tokio::test]
    async fn test_create_series_and_end_it() {
        let h = Harness::new();
        let (status, created) = post(
            app(&h),
            "/series",
            Some("owner-1"),
            json!({
                "client_id": "client-1",
                "client_email": "client@example.com",
                "timezone": "Europe/Berlin",
                "anchor": "2025-03-17T10:00",
                "duration_minutes": 50,
                "amount_minor": 8000,
                "first_session_amount_minor": 12000,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", created);
        assert_eq!(created["series"]["weekday"], "Mon");
        assert_eq!(created["first"]["booking"]["start"], "2025-03-17T09:00:00Z");
        assert_eq!(created["first"]["bill"]["amount"]["amount_minor"], 12000);

        let id = created["series"]["id"].as_str().unwrap();
        let (status, ended) = post(
            app(&h),
            &format!("/series/{}/status", id),
            Some("owner-1"),
            json!({ "status": "ended" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["status"], "ended");

        let (status, _) = post(
            app(&h),
            &format!("/series/{}/status", id),
            Some("owner-1"),
            json!({ "status": "active" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_weekday_mismatch_is_rejected() {
        let h = Harness::new();
        let (status, _) = post(
            app(&h),
            "/series",
            Some("owner-1"),
            json!({
                "client_id": "client-1",
                "client_email": "client@example.com",
                "timezone": "Europe/Berlin",
                "anchor": "2025-03-17T10:00",
                "weekday": "tue",
                "duration_minutes": 50,
                "amount_minor": 8000,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
