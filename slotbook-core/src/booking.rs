//! Booking, series, bill and calendar-mirror records.
//!
//! Statuses are closed enums with their transitions spelled out here, so the
//! orchestrator matches on them exhaustively instead of comparing strings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BookingError, BookingResult};

/// Stable string form for status enums (datastore columns, logs).
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BookingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BookingError::Serialization(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Waiting for the payment to be captured.
    Pending,
    Scheduled,
    Completed,
    Canceled,
}

string_enum!(BookingStatus {
    Pending => "pending",
    Scheduled => "scheduled",
    Completed => "completed",
    Canceled => "canceled",
});

impl BookingStatus {
    /// Completed and canceled bookings accept no further reschedule or cancel.
    pub fn is_terminal(self) -> bool {
        match self {
            BookingStatus::Pending | BookingStatus::Scheduled => false,
            BookingStatus::Completed | BookingStatus::Canceled => true,
        }
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        match (self, next) {
            (Pending, Scheduled) | (Pending, Canceled) => true,
            (Scheduled, Canceled) | (Scheduled, Completed) => true,
            (Pending, _) | (Scheduled, _) | (Completed, _) | (Canceled, _) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesStatus {
    Active,
    Paused,
    Ended,
}

string_enum!(SeriesStatus {
    Active => "active",
    Paused => "paused",
    Ended => "ended",
});

impl SeriesStatus {
    pub fn can_transition_to(self, next: SeriesStatus) -> bool {
        use SeriesStatus::*;
        match (self, next) {
            (Active, Paused) | (Paused, Active) => true,
            (Active, Ended) | (Paused, Ended) => true,
            (Active, Active) | (Paused, Paused) => false,
            (Ended, _) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Pending,
    /// Waiting in the notification queue until `send_at`.
    Scheduled,
    Sent,
    Paid,
    Disputed,
    Canceled,
    Refunded,
}

string_enum!(BillStatus {
    Pending => "pending",
    Scheduled => "scheduled",
    Sent => "sent",
    Paid => "paid",
    Disputed => "disputed",
    Canceled => "canceled",
    Refunded => "refunded",
});

impl BillStatus {
    pub fn is_cancelable(self) -> bool {
        match self {
            BillStatus::Pending | BillStatus::Scheduled | BillStatus::Sent | BillStatus::Disputed => {
                true
            }
            BillStatus::Paid | BillStatus::Canceled | BillStatus::Refunded => false,
        }
    }
}

/// What a calendar artifact represents to the attendees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Holds the slot while payment is outstanding; never sends invitations.
    Placeholder,
    /// A confirmed appointment with invitations.
    Full,
    /// Replaces one occurrence of a recurring series that was moved off cadence.
    Standalone,
    /// The recurring event representing a whole series.
    Master,
}

string_enum!(EventKind {
    Placeholder => "placeholder",
    Full => "full",
    Standalone => "standalone",
    Master => "master",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRecordStatus {
    Active,
    Canceled,
}

string_enum!(EventRecordStatus {
    Active => "active",
    Canceled => "canceled",
});

/// An amount in minor currency units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: i64,
    pub currency: String,
}

impl Money {
    pub fn new(amount_minor: i64, currency: &str) -> Self {
        Money {
            amount_minor,
            currency: currency.to_uppercase(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount_minor == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sign = if self.amount_minor < 0 { "-" } else { "" };
        let abs = self.amount_minor.unsigned_abs();
        write!(f, "{}{}.{:02} {}", sign, abs / 100, abs % 100, self.currency)
    }
}

/// A validated appointment window in UTC (`start < end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> BookingResult<Self> {
        if start >= end {
            return Err(BookingError::Validation(format!(
                "start ({}) must be before end ({})",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(TimeRange { start, end })
    }

    /// Parse RFC 3339 timestamps, e.g. `2025-03-20T15:00:00+01:00`.
    pub fn parse(start: &str, end: &str) -> BookingResult<Self> {
        Self::new(parse_timestamp("start", start)?, parse_timestamp("end", end)?)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

fn parse_timestamp(field: &str, value: &str) -> BookingResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BookingError::Validation(format!("{} '{}' is not a valid timestamp: {}", field, value, e)))
}

/// Position of a booking inside its recurring series.
///
/// `(series_id, index)` is the stable key of an occurrence slot: it is unique
/// across bookings and never changes once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesSlot {
    pub series_id: String,
    pub index: u32,
}

/// One concrete appointment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub owner_id: String,
    pub client_id: String,
    pub client_email: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: BookingStatus,
    pub series: Option<SeriesSlot>,
    /// Set once this occurrence has been moved off its series cadence.
    pub standalone_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    pub fn series_id(&self) -> Option<&str> {
        self.series.as_ref().map(|slot| slot.series_id.as_str())
    }
}

/// A weekly or bi-weekly recurring appointment rule plus its exception overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingSeries {
    pub id: String,
    pub owner_id: String,
    pub client_id: String,
    pub client_email: String,
    /// IANA timezone name the anchor is expressed in.
    pub timezone: String,
    /// Local start of occurrence 0.
    pub anchor_local: NaiveDateTime,
    pub duration_minutes: u32,
    pub interval_weeks: u32,
    pub weekday: Weekday,
    pub status: SeriesStatus,
    pub master_event_id: Option<String>,
    /// EXDATE-equivalent: local dates removed from the series.
    pub excluded_dates: BTreeSet<NaiveDate>,
    /// Occurrence index -> standalone calendar event that replaced it.
    pub overrides: BTreeMap<u32, String>,
    pub price: Money,
    /// Price of the first consultation (index 0), when it differs.
    pub first_session_price: Option<Money>,
    pub created_at: DateTime<Utc>,
}

impl BookingSeries {
    pub fn price_for(&self, index: u32) -> Money {
        match (&self.first_session_price, index) {
            (Some(first), 0) => first.clone(),
            _ => self.price.clone(),
        }
    }
}

/// The amount owed for a booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: String,
    pub booking_id: String,
    pub amount: Money,
    pub status: BillStatus,
    pub send_at: Option<DateTime<Utc>>,
    pub session_url: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Bill {
    pub fn new(
        booking_id: &str,
        amount: Money,
        status: BillStatus,
        send_at: Option<DateTime<Utc>>,
    ) -> Self {
        Bill {
            id: Uuid::new_v4().to_string(),
            booking_id: booking_id.to_string(),
            amount,
            status,
            send_at,
            session_url: None,
            claimed_at: None,
            paid_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Datastore mirror of a calendar event created for a booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEventRecord {
    pub id: String,
    pub booking_id: String,
    pub provider_event_id: String,
    pub kind: EventKind,
    pub status: EventRecordStatus,
    pub created_at: DateTime<Utc>,
}

impl CalendarEventRecord {
    pub fn new(booking_id: &str, provider_event_id: &str, kind: EventKind) -> Self {
        CalendarEventRecord {
            id: Uuid::new_v4().to_string(),
            booking_id: booking_id.to_string(),
            provider_event_id: provider_event_id.to_string(),
            kind,
            status: EventRecordStatus::Active,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_accept_no_transition() {
        use BookingStatus::*;
        for next in [Pending, Scheduled, Completed, Canceled] {
            assert!(!Completed.can_transition_to(next), "completed -> {}", next);
            assert!(!Canceled.can_transition_to(next), "canceled -> {}", next);
        }
        assert!(Pending.can_transition_to(Scheduled));
        assert!(Pending.can_transition_to(Canceled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Scheduled.can_transition_to(Completed));
        assert!(!Scheduled.can_transition_to(Pending));
    }

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in [BillStatus::Pending, BillStatus::Disputed, BillStatus::Refunded] {
            assert_eq!(status.as_str().parse::<BillStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn test_cancelable_bills() {
        let cancelable: Vec<_> = [
            BillStatus::Pending,
            BillStatus::Scheduled,
            BillStatus::Sent,
            BillStatus::Paid,
            BillStatus::Disputed,
            BillStatus::Canceled,
            BillStatus::Refunded,
        ]
        .into_iter()
        .filter(|s| s.is_cancelable())
        .collect();
        assert_eq!(
            cancelable,
            vec![
                BillStatus::Pending,
                BillStatus::Scheduled,
                BillStatus::Sent,
                BillStatus::Disputed
            ]
        );
    }

    #[test]
    fn test_time_range_rejects_inverted_and_malformed_input() {
        assert!(TimeRange::parse("2025-03-20T16:00:00Z", "2025-03-20T15:00:00Z").is_err());
        assert!(TimeRange::parse("2025-03-20T15:00:00Z", "2025-03-20T15:00:00Z").is_err());
        assert!(TimeRange::parse("tomorrow", "2025-03-20T15:00:00Z").is_err());

        let range = TimeRange::parse("2025-03-20T15:00:00+01:00", "2025-03-20T16:00:00+01:00").unwrap();
        assert_eq!(range.start.to_rfc3339(), "2025-03-20T14:00:00+00:00");
        assert_eq!(range.duration(), Duration::hours(1));
    }

    #[test]
    fn test_money_display() {
        assert_eq!(Money::new(8000, "eur").to_string(), "80.00 EUR");
        assert_eq!(Money::new(-5, "USD").to_string(), "-0.05 USD");
    }

    #[test]
    fn test_series_ended_is_final() {
        assert!(SeriesStatus::Active.can_transition_to(SeriesStatus::Paused));
        assert!(SeriesStatus::Paused.can_transition_to(SeriesStatus::Ended));
        assert!(!SeriesStatus::Ended.can_transition_to(SeriesStatus::Active));
    }
}
