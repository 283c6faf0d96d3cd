//! Booking lifecycle orchestration.
//!
//! Each operation runs its side effects in a fixed order and declares per
//! step whether a failure aborts the request or degrades it. Degraded steps
//! are logged and reported back as [`Warning`]s; the authoritative booking
//! state change is still committed.

mod cancel;
mod create;
mod payments;
mod reschedule;

pub use cancel::CancelOutcome;
pub use create::{CreateOutcome, NewBooking, NewSeries, SeriesOutcome};
pub use payments::{CompletionReport, DispatchReport, PaymentOutcome, ResendOutcome};
pub use reschedule::RescheduleOutcome;

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::warn;

use crate::booking::{Bill, Booking, BookingSeries, CalendarEventRecord};
use crate::calendar::CalendarAdapter;
use crate::error::{BookingError, BookingResult};
use crate::exceptions::SeriesExceptions;
use crate::notify::Notifier;
use crate::payment::PaymentAdapter;
use crate::store::Store;

/// Tunables for the orchestrator, normally taken from [`crate::settings::Settings`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Maximum distance between a series occurrence and the calendar
    /// instance taken to represent it.
    pub instance_tolerance: Duration,
    /// How far around the occurrence to list calendar instances.
    pub instance_search_window: Duration,
    /// How long before a series occurrence its bill is sent.
    pub bill_lead_time: Duration,
    pub bill_batch_size: usize,
    pub claim_stale_after: Duration,
    /// Title of calendar events.
    pub event_summary: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions {
            instance_tolerance: Duration::minutes(1),
            instance_search_window: Duration::hours(12),
            bill_lead_time: Duration::hours(48),
            bill_batch_size: 50,
            claim_stale_after: Duration::minutes(15),
            event_summary: "Appointment".to_string(),
        }
    }
}

/// A degraded step of an otherwise successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", content = "message", rename_all = "snake_case")]
pub enum Warning {
    Calendar(String),
    Payment(String),
    Notification(String),
}

/// Collects degraded steps, logging each one as it is recorded.
#[derive(Debug, Default)]
pub(crate) struct Warnings {
    items: Vec<Warning>,
}

impl Warnings {
    pub(crate) fn calendar(&mut self, booking_id: &str, step: &str, err: &BookingError) {
        warn!(booking_id, step, error = %err, "Calendar step failed");
        self.items.push(Warning::Calendar(format!("{}: {}", step, err)));
    }

    pub(crate) fn payment(&mut self, booking_id: &str, step: &str, err: &BookingError) {
        warn!(booking_id, step, error = %err, "Payment step failed");
        self.items.push(Warning::Payment(format!("{}: {}", step, err)));
    }

    pub(crate) fn notification(&mut self, booking_id: &str, step: &str, err: &BookingError) {
        warn!(booking_id, step, error = %err, "Notification failed");
        self.items.push(Warning::Notification(format!("{}: {}", step, err)));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn into_vec(self) -> Vec<Warning> {
        self.items
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    calendar: Arc<dyn CalendarAdapter>,
    payments: Arc<dyn PaymentAdapter>,
    notifier: Arc<dyn Notifier>,
    exceptions: SeriesExceptions,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        calendar: Arc<dyn CalendarAdapter>,
        payments: Arc<dyn PaymentAdapter>,
        notifier: Arc<dyn Notifier>,
        options: OrchestratorOptions,
    ) -> Self {
        Orchestrator {
            exceptions: SeriesExceptions::new(store.clone()),
            store,
            calendar,
            payments,
            notifier,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    async fn booking(&self, booking_id: &str) -> BookingResult<Booking> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("booking {}", booking_id)))
    }

    /// Load a booking on behalf of `owner_id`.
    async fn load_owned(&self, booking_id: &str, owner_id: &str) -> BookingResult<Booking> {
        let booking = self.booking(booking_id).await?;
        if !booking.is_owned_by(owner_id) {
            return Err(BookingError::Unauthorized(format!(
                "booking {} belongs to another practitioner",
                booking_id
            )));
        }
        Ok(booking)
    }

    async fn series(&self, series_id: &str) -> BookingResult<BookingSeries> {
        self.store
            .get_series(series_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("series {}", series_id)))
    }

    /// Cancel every bill of `bills` still in a cancelable state.
    async fn cancel_open_bills(&self, bills: &[Bill], warnings: &mut Warnings) {
        for bill in bills.iter().filter(|b| b.status.is_cancelable()) {
            let mut canceled = bill.clone();
            canceled.status = crate::booking::BillStatus::Canceled;
            canceled.claimed_at = None;
            if let Err(e) = self.store.update_bill(&canceled).await {
                warnings.payment(&bill.booking_id, "cancel bill", &e);
            }
        }
    }

    /// Record a provider event in the calendar mirror.
    async fn mirror_event(&self, record: CalendarEventRecord, warnings: &mut Warnings) {
        if let Err(e) = self.store.insert_calendar_event(&record).await {
            warnings.calendar(&record.booking_id, "record calendar event", &e);
        }
    }
}
