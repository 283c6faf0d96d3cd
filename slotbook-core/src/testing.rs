//! Recording fakes and fixtures for orchestrator, scheduler and route tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc, Weekday};

use crate::booking::{
    Booking, BookingSeries, BookingStatus, Money, SeriesStatus, TimeRange,
};
use crate::calendar::{CalendarAdapter, CreatedEvent, EventInstance, EventSpec, Exclusions};
use crate::error::{BookingError, BookingResult};
use crate::notify::{Notification, Notifier};
use crate::orchestrator::{NewBooking, NewSeries, Orchestrator, OrchestratorOptions};
use crate::payment::{PaymentAdapter, Refund, RefundStatus};
use crate::store::MemoryStore;

/// Operations a fake has been told to fail.
#[derive(Default)]
struct Failures(Mutex<HashSet<&'static str>>);

impl Failures {
    fn add(&self, op: &'static str) {
        self.0.lock().unwrap().insert(op);
    }

    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn check(&self, op: &'static str) -> BookingResult<()> {
        if self.0.lock().unwrap().contains(op) {
            return Err(BookingError::Provider(format!("{} unavailable", op)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalendarCall {
    Create(EventSpec),
    Cancel(String),
    Delete(String),
    PatchExclusions {
        master_event_id: String,
        exclusions: Exclusions,
    },
    ListInstances(String),
    Reschedule {
        event_id: String,
        range: TimeRange,
    },
}

#[derive(Default)]
pub struct RecordingCalendar {
    calls: Mutex<Vec<CalendarCall>>,
    instances: Mutex<Vec<EventInstance>>,
    next_id: AtomicUsize,
    failures: Failures,
}

impl RecordingCalendar {
    pub fn fail_on(&self, op: &'static str) {
        self.failures.add(op);
    }

    pub fn recover(&self) {
        self.failures.clear();
    }

    /// Instances returned by `list_instances`.
    pub fn set_instances(&self, instances: Vec<EventInstance>) {
        *self.instances.lock().unwrap() = instances;
    }

    pub fn calls(&self) -> Vec<CalendarCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<EventSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                CalendarCall::Create(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: CalendarCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CalendarAdapter for RecordingCalendar {
    async fn create_event(&self, spec: &EventSpec) -> BookingResult<CreatedEvent> {
        self.failures.check("create_event")?;
        self.record(CalendarCall::Create(spec.clone()));
        let id = format!("evt-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(CreatedEvent {
            conference_url: spec.conference.then(|| format!("https://meet.test/{}", id)),
            id,
        })
    }

    async fn cancel_event(&self, event_id: &str) -> BookingResult<()> {
        self.failures.check("cancel_event")?;
        self.record(CalendarCall::Cancel(event_id.to_string()));
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> BookingResult<()> {
        self.failures.check("delete_event")?;
        self.record(CalendarCall::Delete(event_id.to_string()));
        Ok(())
    }

    async fn patch_recurrence_exclusions(
        &self,
        master_event_id: &str,
        exclusions: &Exclusions,
    ) -> BookingResult<()> {
        self.failures.check("patch_recurrence_exclusions")?;
        self.record(CalendarCall::PatchExclusions {
            master_event_id: master_event_id.to_string(),
            exclusions: exclusions.clone(),
        });
        Ok(())
    }

    async fn list_instances(
        &self,
        master_event_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BookingResult<Vec<EventInstance>> {
        self.failures.check("list_instances")?;
        self.record(CalendarCall::ListInstances(master_event_id.to_string()));
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.start >= from && i.start <= to)
            .cloned()
            .collect())
    }

    async fn reschedule_event(&self, event_id: &str, range: &TimeRange) -> BookingResult<()> {
        self.failures.check("reschedule_event")?;
        self.record(CalendarCall::Reschedule {
            event_id: event_id.to_string(),
            range: *range,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentCall {
    CreateSession { booking_id: String, amount: Money },
    CancelSessions(String),
    Refund(String),
}

pub struct RecordingPayments {
    calls: Mutex<Vec<PaymentCall>>,
    refund_status: Mutex<RefundStatus>,
    next_id: AtomicUsize,
    failures: Failures,
}

impl Default for RecordingPayments {
    fn default() -> Self {
        RecordingPayments {
            calls: Mutex::default(),
            refund_status: Mutex::new(RefundStatus::Succeeded),
            next_id: AtomicUsize::new(0),
            failures: Failures::default(),
        }
    }
}

impl RecordingPayments {
    pub fn fail_on(&self, op: &'static str) {
        self.failures.add(op);
    }

    pub fn set_refund_status(&self, status: RefundStatus) {
        *self.refund_status.lock().unwrap() = status;
    }

    pub fn calls(&self) -> Vec<PaymentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn refunds(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, PaymentCall::Refund(_)))
            .count()
    }

    fn next(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl PaymentAdapter for RecordingPayments {
    async fn create_session(
        &self,
        booking_id: &str,
        amount: &Money,
        _payer_email: &str,
    ) -> BookingResult<String> {
        self.failures.check("create_session")?;
        self.calls.lock().unwrap().push(PaymentCall::CreateSession {
            booking_id: booking_id.to_string(),
            amount: amount.clone(),
        });
        Ok(format!("https://pay.test/session/{}", self.next()))
    }

    async fn cancel_sessions_for_booking(&self, booking_id: &str) -> BookingResult<()> {
        self.failures.check("cancel_sessions")?;
        self.calls
            .lock()
            .unwrap()
            .push(PaymentCall::CancelSessions(booking_id.to_string()));
        Ok(())
    }

    async fn refund(&self, booking_id: &str, _reason: &str) -> BookingResult<Refund> {
        self.failures.check("refund")?;
        self.calls
            .lock()
            .unwrap()
            .push(PaymentCall::Refund(booking_id.to_string()));
        Ok(Refund {
            id: format!("re_{}", self.next()),
            status: *self.refund_status.lock().unwrap(),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failures: Failures,
}

impl RecordingNotifier {
    pub fn fail_on(&self, op: &'static str) {
        self.failures.add(op);
    }

    pub fn recover(&self) {
        self.failures.clear();
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> BookingResult<()> {
        self.failures.check("send")?;
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// An orchestrator wired to a memory store and recording fakes.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub calendar: Arc<RecordingCalendar>,
    pub payments: Arc<RecordingPayments>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(OrchestratorOptions::default())
    }

    pub fn with_options(options: OrchestratorOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        let calendar = Arc::new(RecordingCalendar::default());
        let payments = Arc::new(RecordingPayments::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            calendar.clone(),
            payments.clone(),
            notifier.clone(),
            options,
        ));
        Harness {
            store,
            calendar,
            payments,
            notifier,
            orchestrator,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn local(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
}

/// A pending, non-series booking on 2025-04-07 08:00-08:50 UTC.
pub fn booking_fixture(owner_id: &str) -> Booking {
    let now = Utc::now();
    Booking {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        client_id: "client-1".to_string(),
        client_email: "client@example.com".to_string(),
        start: utc("2025-04-07T08:00:00Z"),
        end: utc("2025-04-07T08:50:00Z"),
        status: BookingStatus::Pending,
        series: None,
        standalone_event_id: None,
        created_at: now,
        updated_at: now,
    }
}

/// Weekly Monday 10:00 Europe/Berlin series anchored on 2025-03-17.
pub fn series_fixture(owner_id: &str) -> BookingSeries {
    BookingSeries {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        client_id: "client-1".to_string(),
        client_email: "client@example.com".to_string(),
        timezone: "Europe/Berlin".to_string(),
        anchor_local: local("2025-03-17 10:00"),
        duration_minutes: 50,
        interval_weeks: 1,
        weekday: Weekday::Mon,
        status: SeriesStatus::Active,
        master_event_id: None,
        excluded_dates: Default::default(),
        overrides: Default::default(),
        price: Money::new(8000, "EUR"),
        first_session_price: Some(Money::new(12000, "EUR")),
        created_at: Utc::now(),
    }
}

/// A one-off booking request; payment is required when `amount_minor > 0`.
pub fn new_booking(owner_id: &str, amount_minor: i64) -> NewBooking {
    NewBooking {
        owner_id: owner_id.to_string(),
        client_id: "client-1".to_string(),
        client_email: "client@example.com".to_string(),
        range: TimeRange::new(utc("2025-04-07T08:00:00Z"), utc("2025-04-07T08:50:00Z")).unwrap(),
        price: Money::new(amount_minor, "EUR"),
        payment_required: amount_minor > 0,
        series: None,
        suppress_invite: false,
        suppress_payment_request: false,
        bill_send_at: None,
        timezone: Some("Europe/Berlin".to_string()),
    }
}

/// Same rule as [`series_fixture`], as a creation request.
pub fn new_series(owner_id: &str) -> NewSeries {
    NewSeries {
        owner_id: owner_id.to_string(),
        client_id: "client-1".to_string(),
        client_email: "client@example.com".to_string(),
        timezone: "Europe/Berlin".to_string(),
        anchor_local: local("2025-03-17 10:00"),
        weekday: Weekday::Mon,
        interval_weeks: 1,
        duration_minutes: 50,
        price: Money::new(8000, "EUR"),
        first_session_price: Some(Money::new(12000, "EUR")),
    }
}
