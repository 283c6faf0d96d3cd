use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, Utc, Weekday};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Orchestrator, Warning, Warnings};
use crate::booking::{
    Bill, BillStatus, Booking, BookingSeries, BookingStatus, CalendarEventRecord, EventKind, Money,
    SeriesSlot, SeriesStatus, TimeRange,
};
use crate::calendar::EventSpec;
use crate::error::{BookingError, BookingResult};
use crate::ics::recurrence_lines;
use crate::notify::Notification;
use crate::recurrence::{RecurrenceRule, generate};

/// Input of [`Orchestrator::create`].
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub owner_id: String,
    pub client_id: String,
    pub client_email: String,
    pub range: TimeRange,
    pub price: Money,
    /// Booking stays `pending` until the payment is captured.
    pub payment_required: bool,
    pub series: Option<SeriesSlot>,
    /// Skip the calendar event entirely (the series master already shows it).
    pub suppress_invite: bool,
    pub suppress_payment_request: bool,
    /// Queue the bill for notification at this time instead of billing now.
    pub bill_send_at: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub booking: Booking,
    pub bill: Option<Bill>,
    pub calendar_event_id: Option<String>,
    pub conference_url: Option<String>,
    pub payment_url: Option<String>,
    pub warnings: Vec<Warning>,
}

/// Input of [`Orchestrator::create_series`].
#[derive(Debug, Clone)]
pub struct NewSeries {
    pub owner_id: String,
    pub client_id: String,
    pub client_email: String,
    pub timezone: String,
    pub anchor_local: NaiveDateTime,
    pub weekday: Weekday,
    pub interval_weeks: u32,
    pub duration_minutes: u32,
    pub price: Money,
    pub first_session_price: Option<Money>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesOutcome {
    pub series: BookingSeries,
    pub first: CreateOutcome,
    pub warnings: Vec<Warning>,
}

impl Orchestrator {
    /// Create one booking: row, calendar event, bill, payment session.
    ///
    /// Only the booking insert is fatal. Everything after it degrades into
    /// warnings, leaving a valid booking that the resend flow can complete.
    pub async fn create(&self, new: NewBooking) -> BookingResult<CreateOutcome> {
        let now = Utc::now();
        let status = if new.payment_required {
            BookingStatus::Pending
        } else {
            BookingStatus::Scheduled
        };

        let booking = Booking {
            id: Uuid::new_v4().to_string(),
            owner_id: new.owner_id.clone(),
            client_id: new.client_id.clone(),
            client_email: new.client_email.clone(),
            start: new.range.start,
            end: new.range.end,
            status,
            series: new.series.clone(),
            standalone_event_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_booking(&booking).await?;
        info!(booking_id = %booking.id, status = %booking.status, "Created booking");

        let mut warnings = Warnings::default();

        let mut calendar_event_id = None;
        let mut conference_url = None;
        if new.suppress_invite {
            debug!(booking_id = %booking.id, "Calendar invite suppressed");
        } else {
            // A placeholder only blocks the practitioner's slot; attendees are
            // invited once the payment is in.
            let (kind, attendees) = if new.payment_required {
                (EventKind::Placeholder, Vec::new())
            } else {
                (EventKind::Full, vec![booking.client_email.clone()])
            };
            let mut spec = self.event_spec(kind, attendees, &booking, new.range);
            spec.timezone = new.timezone.clone();

            match self.calendar.create_event(&spec).await {
                Ok(created) => {
                    self.mirror_event(
                        CalendarEventRecord::new(&booking.id, &created.id, kind),
                        &mut warnings,
                    )
                    .await;
                    calendar_event_id = Some(created.id);
                    conference_url = created.conference_url;
                }
                Err(e) => warnings.calendar(&booking.id, "create event", &e),
            }
        }

        let bill_status = match (new.payment_required, new.bill_send_at) {
            (false, Some(_)) => BillStatus::Scheduled,
            _ => BillStatus::Pending,
        };
        let mut bill = Bill::new(&booking.id, new.price.clone(), bill_status, new.bill_send_at);

        if let Err(e) = self.store.insert_bill(&bill).await {
            warnings.payment(&booking.id, "create bill", &e);
            return Ok(CreateOutcome {
                booking,
                bill: None,
                calendar_event_id,
                conference_url,
                payment_url: None,
                warnings: warnings.into_vec(),
            });
        }

        let mut payment_url = None;
        if new.payment_required {
            payment_url = self
                .open_payment(&booking, &mut bill, !new.suppress_payment_request, &mut warnings)
                .await;
        }

        Ok(CreateOutcome {
            booking,
            bill: Some(bill),
            calendar_event_id,
            conference_url,
            payment_url,
            warnings: warnings.into_vec(),
        })
    }

    /// Open a payment session for `bill` and optionally email the link.
    /// Returns the session URL when one was created.
    pub(super) async fn open_payment(
        &self,
        booking: &Booking,
        bill: &mut Bill,
        notify: bool,
        warnings: &mut Warnings,
    ) -> Option<String> {
        let url = match self
            .payments
            .create_session(&booking.id, &bill.amount, &booking.client_email)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                warnings.payment(&booking.id, "create payment session", &e);
                return None;
            }
        };

        bill.session_url = Some(url.clone());
        if let Err(e) = self.store.update_bill(bill).await {
            warnings.payment(&booking.id, "store payment session", &e);
        }

        if notify {
            let notification = Notification::PaymentRequest {
                booking_id: booking.id.clone(),
                to: booking.client_email.clone(),
                amount: bill.amount.clone(),
                session_url: url.clone(),
                start: booking.start,
            };
            if let Err(e) = self.notifier.send(&notification).await {
                warnings.notification(&booking.id, "payment request", &e);
            }
        }

        Some(url)
    }

    pub(super) fn event_spec(
        &self,
        kind: EventKind,
        attendees: Vec<String>,
        booking: &Booking,
        range: TimeRange,
    ) -> EventSpec {
        let mut spec = EventSpec::new(kind, &self.options.event_summary, attendees, range)
            .with_metadata("booking_id", &booking.id);
        spec.conference = matches!(kind, EventKind::Full | EventKind::Standalone);
        if let Some(slot) = &booking.series {
            spec = spec
                .with_metadata("series_id", &slot.series_id)
                .with_metadata("occurrence_index", &slot.index.to_string());
        }
        spec
    }

    /// Create a recurring series, its master calendar event, and its first
    /// occurrence.
    pub async fn create_series(&self, new: NewSeries) -> BookingResult<SeriesOutcome> {
        let rule = RecurrenceRule::new(
            &new.timezone,
            new.anchor_local,
            new.interval_weeks,
            new.weekday,
            new.duration_minutes,
        )?;
        if new.price.amount_minor < 0 {
            return Err(BookingError::Validation("price must not be negative".into()));
        }

        let mut series = BookingSeries {
            id: Uuid::new_v4().to_string(),
            owner_id: new.owner_id,
            client_id: new.client_id,
            client_email: new.client_email,
            timezone: new.timezone,
            anchor_local: new.anchor_local,
            duration_minutes: new.duration_minutes,
            interval_weeks: new.interval_weeks,
            weekday: new.weekday,
            status: SeriesStatus::Active,
            master_event_id: None,
            excluded_dates: BTreeSet::new(),
            overrides: BTreeMap::new(),
            price: new.price,
            first_session_price: new.first_session_price,
            created_at: Utc::now(),
        };
        self.store.insert_series(&series).await?;
        info!(series_id = %series.id, rule = %rule.rrule_line(), "Created series");

        let mut warnings = Warnings::default();

        let first = rule.occurrence_at(0);
        let mut spec = EventSpec::new(
            EventKind::Master,
            &self.options.event_summary,
            vec![series.client_email.clone()],
            first.range(),
        )
        .with_metadata("series_id", &series.id);
        spec.timezone = Some(series.timezone.clone());
        spec.conference = true;
        spec.recurrence = recurrence_lines(&rule, &series.excluded_dates);

        match self.calendar.create_event(&spec).await {
            Ok(created) => match self.store.set_master_event(&series.id, &created.id).await {
                Ok(()) => series.master_event_id = Some(created.id),
                Err(e) => warnings.calendar(&series.id, "record master event", &e),
            },
            Err(e) => warnings.calendar(&series.id, "create master event", &e),
        }

        let first = self.materialize_next(&series).await?;

        Ok(SeriesOutcome {
            series,
            first,
            warnings: warnings.into_vec(),
        })
    }

    /// Create the booking for the series' next unmaterialized occurrence.
    pub async fn materialize_next(&self, series: &BookingSeries) -> BookingResult<CreateOutcome> {
        let rule = series.rule()?;
        let next = match self.store.max_occurrence_index(&series.id).await? {
            Some(max) => max + 1,
            None => 0,
        };

        let target = rule.occurrence_at(next);
        let occurrence = generate(&rule, target.start_local, target.end_local, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BookingError::Recurrence(format!(
                    "series {} produced no occurrence {}",
                    series.id, next
                ))
            })?;

        debug!(
            series_id = %series.id,
            index = occurrence.index,
            start = %occurrence.start_local,
            "Materializing occurrence"
        );

        self.create(NewBooking {
            owner_id: series.owner_id.clone(),
            client_id: series.client_id.clone(),
            client_email: series.client_email.clone(),
            range: occurrence.range(),
            price: series.price_for(occurrence.index),
            payment_required: false,
            series: Some(SeriesSlot {
                series_id: series.id.clone(),
                index: occurrence.index,
            }),
            suppress_invite: series.master_event_id.is_some(),
            suppress_payment_request: false,
            bill_send_at: Some(occurrence.start_utc - self.options.bill_lead_time),
            timezone: Some(series.timezone.clone()),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::{Harness, new_booking};

    #[tokio::test]
    async fn test_paid_booking_starts_pending_with_placeholder() {
        let h = Harness::new();
        let outcome = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap();

        assert_eq!(outcome.booking.status, BookingStatus::Pending);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert_eq!(outcome.payment_url.as_deref(), Some("https://pay.test/session/1"));

        let created = h.calendar.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].kind, EventKind::Placeholder);
        assert!(created[0].attendees.is_empty());

        let bills = h.store.bills_for_booking(&outcome.booking.id).await.unwrap();
        assert_eq!(bills.len(), 1);
        assert_eq!(bills[0].status, BillStatus::Pending);
        assert_eq!(bills[0].session_url.as_deref(), Some("https://pay.test/session/1"));
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_calendar_failure_degrades() {
        let h = Harness::new();
        h.calendar.fail_on("create_event");

        let outcome = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap();
        assert!(matches!(outcome.warnings.as_slice(), [Warning::Calendar(_)]));
        assert!(outcome.calendar_event_id.is_none());
        assert!(h.store.get_booking(&outcome.booking.id).await.unwrap().is_some());
        // Payment still goes out.
        assert!(outcome.payment_url.is_some());
    }

    #[tokio::test]
    async fn test_payment_and_notification_failures_degrade() {
        let h = Harness::new();
        h.payments.fail_on("create_session");

        let outcome = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap();
        assert_eq!(outcome.booking.status, BookingStatus::Pending);
        assert!(matches!(outcome.warnings.as_slice(), [Warning::Payment(_)]));
        assert!(h.notifier.sent().is_empty());

        let h = Harness::new();
        h.notifier.fail_on("send");
        let outcome = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap();
        assert!(matches!(outcome.warnings.as_slice(), [Warning::Notification(_)]));
    }

    #[tokio::test]
    async fn test_booking_insert_failure_is_fatal() {
        let h = Harness::new();
        h.store.fail_on("insert_booking");

        let err = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap_err();
        assert!(matches!(err, BookingError::Store(_)));
        assert!(h.calendar.created().is_empty());
        assert!(h.payments.calls().is_empty());
    }

    #[tokio::test]
    async fn test_free_booking_is_scheduled_with_full_invite() {
        let h = Harness::new();
        let mut new = new_booking("owner-1", 0);
        new.payment_required = false;

        let outcome = h.orchestrator.create(new).await.unwrap();
        assert_eq!(outcome.booking.status, BookingStatus::Scheduled);
        assert_eq!(h.calendar.created()[0].kind, EventKind::Full);
        assert!(h.calendar.created()[0].conference);
        assert!(h.payments.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_series_materializes_first_occurrence() {
        let h = Harness::new();
        let outcome = h
            .orchestrator
            .create_series(crate::testing::new_series("owner-1"))
            .await
            .unwrap();

        assert!(outcome.series.master_event_id.is_some());
        let master = &h.calendar.created()[0];
        assert_eq!(master.kind, EventKind::Master);
        assert_eq!(master.recurrence, vec!["RRULE:FREQ=WEEKLY;INTERVAL=1;BYDAY=MO".to_string()]);

        let first = &outcome.first;
        assert_eq!(first.booking.series.as_ref().map(|s| s.index), Some(0));
        assert_eq!(first.booking.status, BookingStatus::Scheduled);
        // The master event represents the occurrence; no second invite.
        assert_eq!(h.calendar.created().len(), 1);

        let bill = first.bill.as_ref().unwrap();
        assert_eq!(bill.status, BillStatus::Scheduled);
        // First consultation price applies to index 0.
        assert_eq!(bill.amount, Money::new(12000, "EUR"));
        assert_eq!(
            bill.send_at,
            Some(first.booking.start - h.orchestrator.options().bill_lead_time)
        );
    }

    #[tokio::test]
    async fn test_create_series_rejects_invalid_rule() {
        let h = Harness::new();
        let mut new = crate::testing::new_series("owner-1");
        new.interval_weeks = 3;
        let err = h.orchestrator.create_series(new).await.unwrap_err();
        assert!(matches!(err, BookingError::Recurrence(_)));
        assert!(h.calendar.created().is_empty());
    }
}
