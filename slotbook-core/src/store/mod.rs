//! Persistence for bookings, series, bills and the calendar mirror.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::booking::{
    Bill, Booking, BookingSeries, BookingStatus, CalendarEventRecord, SeriesStatus,
};
use crate::error::BookingResult;

/// Datastore operations the orchestrator and schedulers need.
///
/// Implementations must enforce two uniqueness rules and report violations
/// as `BookingError::Conflict`: one booking per `(series_id, index)` slot,
/// and one active calendar record per booking.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_booking(&self, booking: &Booking) -> BookingResult<()>;
    async fn get_booking(&self, id: &str) -> BookingResult<Option<Booking>>;
    async fn update_booking(&self, booking: &Booking) -> BookingResult<()>;
    async fn bookings_ending_before(
        &self,
        status: BookingStatus,
        before: DateTime<Utc>,
    ) -> BookingResult<Vec<Booking>>;

    async fn insert_series(&self, series: &BookingSeries) -> BookingResult<()>;
    async fn get_series(&self, id: &str) -> BookingResult<Option<BookingSeries>>;
    async fn active_series(&self) -> BookingResult<Vec<BookingSeries>>;
    async fn set_series_status(&self, id: &str, status: SeriesStatus) -> BookingResult<()>;
    async fn set_master_event(&self, id: &str, event_id: &str) -> BookingResult<()>;
    /// Add one date to the series' exclusions in a single atomic step and
    /// return the complete set. Concurrent calls for different dates must
    /// all survive.
    async fn add_excluded_date(
        &self,
        series_id: &str,
        date: NaiveDate,
    ) -> BookingResult<BTreeSet<NaiveDate>>;
    /// Map occurrence `index` to its standalone event, atomically.
    async fn add_override(&self, series_id: &str, index: u32, event_id: &str)
    -> BookingResult<()>;
    /// Highest occurrence index materialized as a booking, if any.
    async fn max_occurrence_index(&self, series_id: &str) -> BookingResult<Option<u32>>;

    async fn insert_bill(&self, bill: &Bill) -> BookingResult<()>;
    async fn bills_for_booking(&self, booking_id: &str) -> BookingResult<Vec<Bill>>;
    async fn update_bill(&self, bill: &Bill) -> BookingResult<()>;
    /// Atomically claim up to `batch_size` scheduled bills whose `send_at` has
    /// passed and that are unclaimed or whose claim is older than `stale_after`.
    async fn claim_due_bills(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        stale_after: Duration,
    ) -> BookingResult<Vec<Bill>>;
    async fn release_bill_claim(&self, bill_id: &str) -> BookingResult<()>;

    async fn insert_calendar_event(&self, record: &CalendarEventRecord) -> BookingResult<()>;
    async fn active_calendar_event(
        &self,
        booking_id: &str,
    ) -> BookingResult<Option<CalendarEventRecord>>;
    async fn calendar_events_for_booking(
        &self,
        booking_id: &str,
    ) -> BookingResult<Vec<CalendarEventRecord>>;
    async fn mark_calendar_event_canceled(&self, record_id: &str) -> BookingResult<()>;
}

/// Whether a bill can be claimed for notification at `now`.
pub(crate) fn is_claimable(bill: &Bill, now: DateTime<Utc>, stale_after: Duration) -> bool {
    use crate::booking::BillStatus;

    let due = bill.status == BillStatus::Scheduled && bill.send_at.is_some_and(|at| at <= now);
    let free = match bill.claimed_at {
        None => true,
        Some(claimed) => claimed < now - stale_after,
    };
    due && free
}
