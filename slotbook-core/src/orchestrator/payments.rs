use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::{Orchestrator, Warning, Warnings};
use crate::booking::{
    Bill, BillStatus, Booking, BookingSeries, BookingStatus, CalendarEventRecord, EventKind,
    SeriesStatus,
};
use crate::error::{BookingError, BookingResult};
use crate::notify::Notification;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub booking: Booking,
    pub bill: Bill,
    /// The bill was already marked paid; nothing changed.
    pub already_paid: bool,
    pub conference_url: Option<String>,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendOutcome {
    pub bill: Bill,
    pub payment_url: Option<String>,
    pub warnings: Vec<Warning>,
}

/// Result of one bill notification run.
#[derive(Debug, Default, Serialize)]
pub struct DispatchReport {
    pub sent: Vec<String>,
    /// Bills dropped because their booking was canceled.
    pub withdrawn: Vec<String>,
    pub failed: Vec<(String, String)>,
}

enum Dispatched {
    Sent,
    Withdrawn,
}

#[derive(Debug, Default, Serialize)]
pub struct CompletionReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl Orchestrator {
    /// Record a captured payment for `bill_id`.
    ///
    /// A pending booking becomes scheduled and its placeholder is replaced
    /// by a full invitation. Repeated deliveries of the same payment are
    /// no-ops.
    pub async fn record_payment(
        &self,
        booking_id: &str,
        bill_id: &str,
    ) -> BookingResult<PaymentOutcome> {
        let mut booking = self.booking(booking_id).await?;
        let bills = self.store.bills_for_booking(booking_id).await?;
        let mut bill = bills
            .iter()
            .find(|b| b.id == bill_id)
            .cloned()
            .ok_or_else(|| BookingError::NotFound(format!("bill {}", bill_id)))?;

        if bill.status == BillStatus::Paid {
            return Ok(PaymentOutcome {
                booking,
                bill,
                already_paid: true,
                conference_url: None,
                warnings: Vec::new(),
            });
        }
        if bills.iter().any(|b| b.status == BillStatus::Paid) {
            return Err(BookingError::Conflict(format!(
                "booking {} already has a paid bill",
                booking_id
            )));
        }
        if !bill.status.is_cancelable() {
            return Err(BookingError::Conflict(format!(
                "bill {} is {} and cannot be paid",
                bill_id, bill.status
            )));
        }
        if booking.status == BookingStatus::Canceled {
            return Err(BookingError::Conflict(format!(
                "booking {} is canceled",
                booking_id
            )));
        }

        let now = Utc::now();
        bill.status = BillStatus::Paid;
        bill.paid_at = Some(now);
        self.store.update_bill(&bill).await?;
        info!(booking_id, bill_id, amount = %bill.amount, "Payment recorded");

        let mut warnings = Warnings::default();
        let mut conference_url = None;

        if booking.status == BookingStatus::Pending {
            booking.status = BookingStatus::Scheduled;
            booking.updated_at = now;
            self.store.update_booking(&booking).await?;
            conference_url = self.upgrade_placeholder(&booking, &mut warnings).await;
        }

        Ok(PaymentOutcome {
            booking,
            bill,
            already_paid: false,
            conference_url,
            warnings: warnings.into_vec(),
        })
    }

    /// Replace the placeholder with a full invitation. Silent delete first,
    /// so the client only ever receives the real invite.
    async fn upgrade_placeholder(
        &self,
        booking: &Booking,
        warnings: &mut Warnings,
    ) -> Option<String> {
        let placeholder = match self.store.active_calendar_event(&booking.id).await {
            Ok(record) => record,
            Err(e) => {
                warnings.calendar(&booking.id, "load calendar event", &e);
                return None;
            }
        };

        if let Some(record) = placeholder {
            if record.kind != EventKind::Placeholder {
                return None;
            }
            if let Err(e) = self.calendar.delete_event(&record.provider_event_id).await {
                warnings.calendar(&booking.id, "delete placeholder", &e);
                return None;
            }
            if let Err(e) = self.store.mark_calendar_event_canceled(&record.id).await {
                warnings.calendar(&booking.id, "record deleted placeholder", &e);
            }
        }

        let range = crate::booking::TimeRange {
            start: booking.start,
            end: booking.end,
        };
        let spec = self.event_spec(
            EventKind::Full,
            vec![booking.client_email.clone()],
            booking,
            range,
        );
        match self.calendar.create_event(&spec).await {
            Ok(created) => {
                self.mirror_event(
                    CalendarEventRecord::new(&booking.id, &created.id, EventKind::Full),
                    warnings,
                )
                .await;
                created.conference_url
            }
            Err(e) => {
                warnings.calendar(&booking.id, "create invitation", &e);
                None
            }
        }
    }

    /// Issue a fresh bill and payment link for an unpaid booking.
    pub async fn resend_payment_request(
        &self,
        booking_id: &str,
        owner_id: &str,
    ) -> BookingResult<ResendOutcome> {
        let booking = self.load_owned(booking_id, owner_id).await?;
        if booking.status.is_terminal() {
            return Err(BookingError::Conflict(format!(
                "booking {} is {}",
                booking_id, booking.status
            )));
        }

        let bills = self.store.bills_for_booking(booking_id).await?;
        if bills.iter().any(|b| b.status == BillStatus::Paid) {
            return Err(BookingError::Conflict(format!(
                "booking {} is already paid",
                booking_id
            )));
        }
        let amount = bills
            .iter()
            .max_by_key(|b| b.created_at)
            .map(|b| b.amount.clone())
            .ok_or_else(|| BookingError::NotFound(format!("bill for booking {}", booking_id)))?;

        let mut warnings = Warnings::default();
        if let Err(e) = self.payments.cancel_sessions_for_booking(booking_id).await {
            warnings.payment(booking_id, "cancel payment sessions", &e);
        }
        self.cancel_open_bills(&bills, &mut warnings).await;

        let mut bill = Bill::new(booking_id, amount, BillStatus::Pending, None);
        self.store.insert_bill(&bill).await?;
        let payment_url = self.open_payment(&booking, &mut bill, true, &mut warnings).await;

        Ok(ResendOutcome {
            bill,
            payment_url,
            warnings: warnings.into_vec(),
        })
    }

    /// Send payment requests for scheduled bills that have come due.
    ///
    /// Bills are claimed atomically before sending and every claim is
    /// released afterwards, so concurrent runs never send the same bill twice
    /// and failed bills are retried on the next run.
    pub async fn send_due_bills(&self, now: DateTime<Utc>) -> BookingResult<DispatchReport> {
        let claimed = self
            .store
            .claim_due_bills(now, self.options.bill_batch_size, self.options.claim_stale_after)
            .await?;

        let mut report = DispatchReport::default();
        for bill in claimed {
            let bill_id = bill.id.clone();
            match self.dispatch_bill(bill).await {
                Ok(Dispatched::Sent) => report.sent.push(bill_id.clone()),
                Ok(Dispatched::Withdrawn) => report.withdrawn.push(bill_id.clone()),
                Err(e) => {
                    warn!(bill_id = %bill_id, error = %e, "Bill notification failed");
                    report.failed.push((bill_id.clone(), e.to_string()));
                }
            }
            if let Err(e) = self.store.release_bill_claim(&bill_id).await {
                error!(bill_id = %bill_id, error = %e, "Failed to release bill claim");
            }
        }

        info!(
            sent = report.sent.len(),
            withdrawn = report.withdrawn.len(),
            failed = report.failed.len(),
            "Bill notification run done"
        );
        Ok(report)
    }

    /// Completed bookings are still billed. A bill whose booking was canceled
    /// is closed instead, so it is never claimed again.
    async fn dispatch_bill(&self, mut bill: Bill) -> BookingResult<Dispatched> {
        let booking = self.booking(&bill.booking_id).await?;
        if booking.status == BookingStatus::Canceled {
            bill.status = BillStatus::Canceled;
            bill.claimed_at = None;
            self.store.update_bill(&bill).await?;
            info!(bill_id = %bill.id, booking_id = %booking.id, "Withdrew bill of canceled booking");
            return Ok(Dispatched::Withdrawn);
        }

        // A session opened by an earlier, failed attempt is reused.
        let url = match bill.session_url.clone() {
            Some(url) => url,
            None => {
                let url = self
                    .payments
                    .create_session(&booking.id, &bill.amount, &booking.client_email)
                    .await?;
                bill.session_url = Some(url.clone());
                self.store.update_bill(&bill).await?;
                url
            }
        };

        self.notifier
            .send(&Notification::PaymentRequest {
                booking_id: booking.id.clone(),
                to: booking.client_email.clone(),
                amount: bill.amount.clone(),
                session_url: url,
                start: booking.start,
            })
            .await?;

        bill.status = BillStatus::Sent;
        self.store.update_bill(&bill).await?;
        Ok(Dispatched::Sent)
    }

    /// Mark scheduled bookings that ended before `now` as completed.
    pub async fn complete_elapsed(&self, now: DateTime<Utc>) -> BookingResult<CompletionReport> {
        let elapsed = self
            .store
            .bookings_ending_before(BookingStatus::Scheduled, now)
            .await?;

        let mut report = CompletionReport::default();
        for mut booking in elapsed {
            booking.status = BookingStatus::Completed;
            booking.updated_at = now;
            match self.store.update_booking(&booking).await {
                Ok(()) => report.completed.push(booking.id),
                Err(e) => {
                    warn!(booking_id = %booking.id, error = %e, "Failed to complete booking");
                    report.failed.push((booking.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Pause, resume or end a series on behalf of its owner.
    pub async fn set_series_status(
        &self,
        series_id: &str,
        owner_id: &str,
        status: SeriesStatus,
    ) -> BookingResult<BookingSeries> {
        let mut series = self.series(series_id).await?;
        if series.owner_id != owner_id {
            return Err(BookingError::Unauthorized(format!(
                "series {} belongs to another practitioner",
                series_id
            )));
        }
        if !series.status.can_transition_to(status) {
            return Err(BookingError::Conflict(format!(
                "series {} cannot go from {} to {}",
                series_id, series.status, status
            )));
        }

        self.store.set_series_status(series_id, status).await?;
        info!(series_id, from = %series.status, to = %status, "Series status changed");
        series.status = status;
        Ok(series)
    }
}
