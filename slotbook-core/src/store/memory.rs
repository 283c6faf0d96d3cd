use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use super::{Store, is_claimable};
use crate::booking::{
    Bill, Booking, BookingSeries, BookingStatus, CalendarEventRecord, EventRecordStatus,
    SeriesStatus,
};
use crate::error::{BookingError, BookingResult};

#[derive(Default)]
struct State {
    bookings: HashMap<String, Booking>,
    series: HashMap<String, BookingSeries>,
    bills: Vec<Bill>,
    calendar_events: Vec<CalendarEventRecord>,
}

/// In-process store. Every operation takes one lock, so each is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation (e.g. `"insert_booking"`) fail from now on.
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_on(&self, op: &'static str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(op);
        }
    }

    fn state(&self) -> BookingResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BookingError::Store("memory store lock poisoned".into()))
    }

    fn check(&self, op: &'static str) -> BookingResult<()> {
        let failing = self
            .failing
            .lock()
            .map_err(|_| BookingError::Store("memory store lock poisoned".into()))?;
        if failing.contains(op) {
            return Err(BookingError::Store(format!("{} failed", op)));
        }
        Ok(())
    }
}

fn series_mut<'a>(state: &'a mut State, id: &str) -> BookingResult<&'a mut BookingSeries> {
    state
        .series
        .get_mut(id)
        .ok_or_else(|| BookingError::NotFound(format!("series {}", id)))
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_booking(&self, booking: &Booking) -> BookingResult<()> {
        self.check("insert_booking")?;
        let mut state = self.state()?;

        if let Some(slot) = &booking.series {
            let taken = state.bookings.values().any(|b| b.series.as_ref() == Some(slot));
            if taken {
                return Err(BookingError::Conflict(format!(
                    "occurrence {} of series {} is already booked",
                    slot.index, slot.series_id
                )));
            }
        }
        if state.bookings.contains_key(&booking.id) {
            return Err(BookingError::Conflict(format!("booking {} exists", booking.id)));
        }

        state.bookings.insert(booking.id.clone(), booking.clone());
        Ok(())
    }

    async fn get_booking(&self, id: &str) -> BookingResult<Option<Booking>> {
        Ok(self.state()?.bookings.get(id).cloned())
    }

    async fn update_booking(&self, booking: &Booking) -> BookingResult<()> {
        self.check("update_booking")?;
        let mut state = self.state()?;
        match state.bookings.get_mut(&booking.id) {
            Some(existing) => {
                *existing = booking.clone();
                Ok(())
            }
            None => Err(BookingError::NotFound(format!("booking {}", booking.id))),
        }
    }

    async fn bookings_ending_before(
        &self,
        status: BookingStatus,
        before: DateTime<Utc>,
    ) -> BookingResult<Vec<Booking>> {
        let state = self.state()?;
        let mut found: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.status == status && b.end < before)
            .cloned()
            .collect();
        found.sort_by_key(|b| b.end);
        Ok(found)
    }

    async fn insert_series(&self, series: &BookingSeries) -> BookingResult<()> {
        self.check("insert_series")?;
        let mut state = self.state()?;
        if state.series.contains_key(&series.id) {
            return Err(BookingError::Conflict(format!("series {} exists", series.id)));
        }
        state.series.insert(series.id.clone(), series.clone());
        Ok(())
    }

    async fn get_series(&self, id: &str) -> BookingResult<Option<BookingSeries>> {
        Ok(self.state()?.series.get(id).cloned())
    }

    async fn active_series(&self) -> BookingResult<Vec<BookingSeries>> {
        let state = self.state()?;
        let mut active: Vec<BookingSeries> = state
            .series
            .values()
            .filter(|s| s.status == SeriesStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn set_series_status(&self, id: &str, status: SeriesStatus) -> BookingResult<()> {
        self.check("set_series_status")?;
        let mut state = self.state()?;
        series_mut(&mut state, id)?.status = status;
        Ok(())
    }

    async fn set_master_event(&self, id: &str, event_id: &str) -> BookingResult<()> {
        let mut state = self.state()?;
        series_mut(&mut state, id)?.master_event_id = Some(event_id.to_string());
        Ok(())
    }

    async fn add_excluded_date(
        &self,
        series_id: &str,
        date: NaiveDate,
    ) -> BookingResult<BTreeSet<NaiveDate>> {
        self.check("add_excluded_date")?;
        let mut state = self.state()?;
        let series = series_mut(&mut state, series_id)?;
        series.excluded_dates.insert(date);
        Ok(series.excluded_dates.clone())
    }

    async fn add_override(
        &self,
        series_id: &str,
        index: u32,
        event_id: &str,
    ) -> BookingResult<()> {
        self.check("add_override")?;
        let mut state = self.state()?;
        series_mut(&mut state, series_id)?
            .overrides
            .insert(index, event_id.to_string());
        Ok(())
    }

    async fn max_occurrence_index(&self, series_id: &str) -> BookingResult<Option<u32>> {
        let state = self.state()?;
        Ok(state
            .bookings
            .values()
            .filter_map(|b| b.series.as_ref())
            .filter(|slot| slot.series_id == series_id)
            .map(|slot| slot.index)
            .max())
    }

    async fn insert_bill(&self, bill: &Bill) -> BookingResult<()> {
        self.check("insert_bill")?;
        self.state()?.bills.push(bill.clone());
        Ok(())
    }

    async fn bills_for_booking(&self, booking_id: &str) -> BookingResult<Vec<Bill>> {
        let state = self.state()?;
        Ok(state
            .bills
            .iter()
            .filter(|b| b.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn update_bill(&self, bill: &Bill) -> BookingResult<()> {
        self.check("update_bill")?;
        let mut state = self.state()?;
        match state.bills.iter_mut().find(|b| b.id == bill.id) {
            Some(existing) => {
                *existing = bill.clone();
                Ok(())
            }
            None => Err(BookingError::NotFound(format!("bill {}", bill.id))),
        }
    }

    async fn claim_due_bills(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        stale_after: Duration,
    ) -> BookingResult<Vec<Bill>> {
        let mut state = self.state()?;

        let mut due: Vec<&mut Bill> = state
            .bills
            .iter_mut()
            .filter(|b| is_claimable(b, now, stale_after))
            .collect();
        due.sort_by_key(|b| b.send_at);

        let mut claimed = Vec::new();
        for bill in due.into_iter().take(batch_size) {
            bill.claimed_at = Some(now);
            claimed.push(bill.clone());
        }
        Ok(claimed)
    }

    async fn release_bill_claim(&self, bill_id: &str) -> BookingResult<()> {
        let mut state = self.state()?;
        if let Some(bill) = state.bills.iter_mut().find(|b| b.id == bill_id) {
            bill.claimed_at = None;
        }
        Ok(())
    }

    async fn insert_calendar_event(&self, record: &CalendarEventRecord) -> BookingResult<()> {
        self.check("insert_calendar_event")?;
        let mut state = self.state()?;
        if record.status == EventRecordStatus::Active {
            let has_active = state.calendar_events.iter().any(|r| {
                r.booking_id == record.booking_id && r.status == EventRecordStatus::Active
            });
            if has_active {
                return Err(BookingError::Conflict(format!(
                    "booking {} already has an active calendar event",
                    record.booking_id
                )));
            }
        }
        state.calendar_events.push(record.clone());
        Ok(())
    }

    async fn active_calendar_event(
        &self,
        booking_id: &str,
    ) -> BookingResult<Option<CalendarEventRecord>> {
        let state = self.state()?;
        Ok(state
            .calendar_events
            .iter()
            .find(|r| r.booking_id == booking_id && r.status == EventRecordStatus::Active)
            .cloned())
    }

    async fn calendar_events_for_booking(
        &self,
        booking_id: &str,
    ) -> BookingResult<Vec<CalendarEventRecord>> {
        let state = self.state()?;
        Ok(state
            .calendar_events
            .iter()
            .filter(|r| r.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn mark_calendar_event_canceled(&self, record_id: &str) -> BookingResult<()> {
        self.check("mark_calendar_event_canceled")?;
        let mut state = self.state()?;
        match state.calendar_events.iter_mut().find(|r| r.id == record_id) {
            Some(record) => {
                record.status = EventRecordStatus::Canceled;
                Ok(())
            }
            None => Err(BookingError::NotFound(format!("calendar event {}", record_id))),
        }
    }
}
