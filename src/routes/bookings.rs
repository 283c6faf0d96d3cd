//! Booking endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use serde::Deserialize;

use slotbook_core::BookingError;
use slotbook_core::booking::{Money, TimeRange};
use slotbook_core::orchestrator::{
    CancelOutcome, CreateOutcome, NewBooking, PaymentOutcome, RescheduleOutcome, ResendOutcome,
};

use crate::routes::{AppError, Owner};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/bookings/{id}/reschedule", post(reschedule_booking))
        .route("/bookings/{id}/payment-request", post(resend_payment_request))
        .route("/bookings/{id}/payments", post(record_payment))
}

/// Request body for creating a one-off booking
#[derive(Deserialize)]
pub struct CreateBookingRequest {
    pub client_id: String,
    pub client_email: String,
    pub start: String,
    pub end: String,
    /// Price in minor units; zero books without payment.
    #[serde(default)]
    pub amount_minor: i64,
    pub currency: Option<String>,
    pub timezone: Option<String>,
    /// Create the payment session without emailing the link.
    #[serde(default)]
    pub suppress_payment_request: bool,
}

/// POST /bookings - Create a booking
async fn create_booking(
    State(state): State<AppState>,
    owner: Owner,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<CreateOutcome>), AppError> {
    let range = TimeRange::parse(&req.start, &req.end)?;
    if req.amount_minor < 0 {
        return Err(BookingError::Validation("amount must not be negative".into()).into());
    }
    if req.client_email.trim().is_empty() {
        return Err(BookingError::Validation("client_email is required".into()).into());
    }
    let currency = req.currency.as_deref().unwrap_or(state.currency());

    let outcome = state
        .orchestrator()
        .create(NewBooking {
            owner_id: owner.0,
            client_id: req.client_id,
            client_email: req.client_email,
            range,
            price: Money::new(req.amount_minor, currency),
            payment_required: req.amount_minor > 0,
            series: None,
            suppress_invite: false,
            suppress_payment_request: req.suppress_payment_request,
            bill_send_at: None,
            timezone: req.timezone,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

/// POST /bookings/:id/cancel - Cancel a booking, refunding any payment
async fn cancel_booking(
    State(state): State<AppState>,
    owner: Owner,
    Path(booking_id): Path<String>,
) -> Result<Json<CancelOutcome>, AppError> {
    let outcome = state.orchestrator().cancel(&booking_id, &owner.0).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct RescheduleRequest {
    pub start: String,
    pub end: String,
}

/// POST /bookings/:id/reschedule - Move a booking
async fn reschedule_booking(
    State(state): State<AppState>,
    owner: Owner,
    Path(booking_id): Path<String>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<RescheduleOutcome>, AppError> {
    let range = TimeRange::parse(&req.start, &req.end)?;
    let outcome = state
        .orchestrator()
        .reschedule(&booking_id, &owner.0, range)
        .await?;
    Ok(Json(outcome))
}

/// POST /bookings/:id/payment-request - Send a fresh payment link
async fn resend_payment_request(
    State(state): State<AppState>,
    owner: Owner,
    Path(booking_id): Path<String>,
) -> Result<Json<ResendOutcome>, AppError> {
    let outcome = state
        .orchestrator()
        .resend_payment_request(&booking_id, &owner.0)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct PaymentRequest {
    pub bill_id: String,
}

/// POST /bookings/:id/payments - Payment captured (processor webhook)
async fn record_payment(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    Json(req): Json<PaymentRequest>,
) -> Result<Json<PaymentOutcome>, AppError> {
    let outcome = state
        .orchestrator()
        .record_payment(&booking_id, &req.bill_id)
        .await?;
    Ok(Json(outcome))
}
