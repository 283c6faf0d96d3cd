//! SQLite persistence through sqlx.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text, which sorts and
//! compares correctly as strings. Series exceptions are JSON columns, and
//! each addition is a single `UPDATE` so concurrent writers never drop keys.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc, Weekday};
use sqlx::{FromRow, SqlitePool};

use super::Store;
use crate::booking::{
    Bill, Booking, BookingSeries, BookingStatus, CalendarEventRecord, EventRecordStatus, Money,
    SeriesSlot, SeriesStatus,
};
use crate::error::{BookingError, BookingResult};

const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct SqliteStore {
    db: SqlitePool,
}

#[derive(FromRow)]
struct BookingRow {
    id: String,
    owner_id: String,
    client_id: String,
    client_email: String,
    start_at: String,
    end_at: String,
    status: String,
    series_id: Option<String>,
    occurrence_index: Option<i64>,
    standalone_event_id: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(FromRow)]
struct SeriesRow {
    id: String,
    owner_id: String,
    client_id: String,
    client_email: String,
    timezone: String,
    anchor_local: String,
    duration_minutes: i64,
    interval_weeks: i64,
    weekday: String,
    status: String,
    master_event_id: Option<String>,
    excluded_dates: String,
    overrides: String,
    price_minor: i64,
    first_session_price_minor: Option<i64>,
    currency: String,
    created_at: String,
}

#[derive(FromRow)]
struct BillRow {
    id: String,
    booking_id: String,
    amount_minor: i64,
    currency: String,
    status: String,
    send_at: Option<String>,
    session_url: Option<String>,
    claimed_at: Option<String>,
    paid_at: Option<String>,
    created_at: String,
}

#[derive(FromRow)]
struct CalendarEventRow {
    id: String,
    booking_id: String,
    provider_event_id: String,
    kind: String,
    status: String,
    created_at: String,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the database at `url` and initialize tables.
    pub async fn connect(url: &str) -> BookingResult<Self> {
        let options: sqlx::sqlite::SqliteConnectOptions = url
            .parse()
            .map_err(|e: sqlx::Error| BookingError::Config(format!("database.url: {}", e)))?;
        let db = SqlitePool::connect_with(options.create_if_missing(true)).await?;
        let store = Self::new(db);
        store.init_db().await?;
        Ok(store)
    }

    pub async fn init_db(&self) -> BookingResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookings (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                client_email TEXT NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                status TEXT NOT NULL,
                series_id TEXT,
                occurrence_index INTEGER,
                standalone_event_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((series_id IS NULL) = (occurrence_index IS NULL))
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS booking_series (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                client_email TEXT NOT NULL,
                timezone TEXT NOT NULL,
                anchor_local TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                interval_weeks INTEGER NOT NULL,
                weekday TEXT NOT NULL,
                status TEXT NOT NULL,
                master_event_id TEXT,
                excluded_dates TEXT NOT NULL DEFAULT '[]',
                overrides TEXT NOT NULL DEFAULT '{}',
                price_minor INTEGER NOT NULL,
                first_session_price_minor INTEGER,
                currency TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bills (
                id TEXT PRIMARY KEY,
                booking_id TEXT NOT NULL,
                amount_minor INTEGER NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                send_at TEXT,
                session_url TEXT,
                claimed_at TEXT,
                paid_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calendar_events (
                id TEXT PRIMARY KEY,
                booking_id TEXT NOT NULL,
                provider_event_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_bookings_slot ON bookings(series_id, occurrence_index)",
        )
        .execute(&self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bookings_status_end ON bookings(status, end_at)")
            .execute(&self.db)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bills_booking ON bills(booking_id)")
            .execute(&self.db)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bills_due ON bills(status, send_at)")
            .execute(&self.db)
            .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_calendar_events_active ON calendar_events(booking_id) WHERE status = 'active'",
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> BookingResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BookingError::Serialization(format!("bad timestamp '{}': {}", value, e)))
}

fn parse_opt_ts(value: Option<String>) -> BookingResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

/// Map unique-index violations to `Conflict`.
fn conflict_on_unique(err: sqlx::Error, what: String) -> BookingError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return BookingError::Conflict(what);
        }
    }
    err.into()
}

fn row_to_booking(row: BookingRow) -> BookingResult<Booking> {
    let series = match (row.series_id, row.occurrence_index) {
        (Some(series_id), Some(index)) => Some(SeriesSlot {
            series_id,
            index: u32::try_from(index).map_err(|_| {
                BookingError::Serialization(format!("bad occurrence index {}", index))
            })?,
        }),
        _ => None,
    };

    Ok(Booking {
        id: row.id,
        owner_id: row.owner_id,
        client_id: row.client_id,
        client_email: row.client_email,
        start: parse_ts(&row.start_at)?,
        end: parse_ts(&row.end_at)?,
        status: row.status.parse()?,
        series,
        standalone_event_id: row.standalone_event_id,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

fn row_to_series(row: SeriesRow) -> BookingResult<BookingSeries> {
    let anchor_local = NaiveDateTime::parse_from_str(&row.anchor_local, LOCAL_FORMAT)
        .map_err(|e| BookingError::Serialization(format!("bad anchor '{}': {}", row.anchor_local, e)))?;
    let weekday: Weekday = row
        .weekday
        .parse()
        .map_err(|_| BookingError::Serialization(format!("bad weekday '{}'", row.weekday)))?;
    let to_u32 = |v: i64, field: &str| {
        u32::try_from(v).map_err(|_| BookingError::Serialization(format!("bad {} {}", field, v)))
    };

    Ok(BookingSeries {
        timezone: row.timezone,
        anchor_local,
        duration_minutes: to_u32(row.duration_minutes, "duration")?,
        interval_weeks: to_u32(row.interval_weeks, "interval")?,
        weekday,
        status: row.status.parse()?,
        master_event_id: row.master_event_id,
        excluded_dates: serde_json::from_str(&row.excluded_dates)?,
        overrides: serde_json::from_str(&row.overrides)?,
        price: Money::new(row.price_minor, &row.currency),
        first_session_price: row
            .first_session_price_minor
            .map(|minor| Money::new(minor, &row.currency)),
        created_at: parse_ts(&row.created_at)?,
        id: row.id,
        owner_id: row.owner_id,
        client_id: row.client_id,
        client_email: row.client_email,
    })
}

fn row_to_bill(row: BillRow) -> BookingResult<Bill> {
    Ok(Bill {
        id: row.id,
        booking_id: row.booking_id,
        amount: Money::new(row.amount_minor, &row.currency),
        status: row.status.parse()?,
        send_at: parse_opt_ts(row.send_at)?,
        session_url: row.session_url,
        claimed_at: parse_opt_ts(row.claimed_at)?,
        paid_at: parse_opt_ts(row.paid_at)?,
        created_at: parse_ts(&row.created_at)?,
    })
}

fn row_to_calendar_event(row: CalendarEventRow) -> BookingResult<CalendarEventRecord> {
    Ok(CalendarEventRecord {
        id: row.id,
        booking_id: row.booking_id,
        provider_event_id: row.provider_event_id,
        kind: row.kind.parse()?,
        status: row.status.parse()?,
        created_at: parse_ts(&row.created_at)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_booking(&self, booking: &Booking) -> BookingResult<()> {
        let (series_id, index) = match &booking.series {
            Some(slot) => (Some(slot.series_id.as_str()), Some(i64::from(slot.index))),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO bookings (id, owner_id, client_id, client_email, start_at, end_at, status,
                                  series_id, occurrence_index, standalone_event_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&booking.id)
        .bind(&booking.owner_id)
        .bind(&booking.client_id)
        .bind(&booking.client_email)
        .bind(ts(booking.start))
        .bind(ts(booking.end))
        .bind(booking.status.as_str())
        .bind(series_id)
        .bind(index)
        .bind(&booking.standalone_event_id)
        .bind(ts(booking.created_at))
        .bind(ts(booking.updated_at))
        .execute(&self.db)
        .await
        .map_err(|e| {
            let what = match &booking.series {
                Some(slot) => format!(
                    "occurrence {} of series {} is already booked",
                    slot.index, slot.series_id
                ),
                None => format!("booking {} exists", booking.id),
            };
            conflict_on_unique(e, what)
        })?;

        Ok(())
    }

    async fn get_booking(&self, id: &str) -> BookingResult<Option<Booking>> {
        let row: Option<BookingRow> = sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        row.map(row_to_booking).transpose()
    }

    async fn update_booking(&self, booking: &Booking) -> BookingResult<()> {
        // The series slot is immutable once assigned and is not written here.
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET start_at = ?, end_at = ?, status = ?, standalone_event_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(ts(booking.start))
        .bind(ts(booking.end))
        .bind(booking.status.as_str())
        .bind(&booking.standalone_event_id)
        .bind(ts(booking.updated_at))
        .bind(&booking.id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BookingError::NotFound(format!("booking {}", booking.id)));
        }
        Ok(())
    }

    async fn bookings_ending_before(
        &self,
        status: BookingStatus,
        before: DateTime<Utc>,
    ) -> BookingResult<Vec<Booking>> {
        let rows: Vec<BookingRow> =
            sqlx::query_as("SELECT * FROM bookings WHERE status = ? AND end_at < ? ORDER BY end_at")
                .bind(status.as_str())
                .bind(ts(before))
                .fetch_all(&self.db)
                .await?;

        rows.into_iter().map(row_to_booking).collect()
    }

    async fn insert_series(&self, series: &BookingSeries) -> BookingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO booking_series (id, owner_id, client_id, client_email, timezone, anchor_local,
                                        duration_minutes, interval_weeks, weekday, status, master_event_id,
                                        excluded_dates, overrides, price_minor, first_session_price_minor,
                                        currency, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&series.id)
        .bind(&series.owner_id)
        .bind(&series.client_id)
        .bind(&series.client_email)
        .bind(&series.timezone)
        .bind(series.anchor_local.format(LOCAL_FORMAT).to_string())
        .bind(i64::from(series.duration_minutes))
        .bind(i64::from(series.interval_weeks))
        .bind(series.weekday.to_string())
        .bind(series.status.as_str())
        .bind(&series.master_event_id)
        .bind(serde_json::to_string(&series.excluded_dates)?)
        .bind(serde_json::to_string(&series.overrides)?)
        .bind(series.price.amount_minor)
        .bind(series.first_session_price.as_ref().map(|m| m.amount_minor))
        .bind(&series.price.currency)
        .bind(ts(series.created_at))
        .execute(&self.db)
        .await
        .map_err(|e| conflict_on_unique(e, format!("series {} exists", series.id)))?;

        Ok(())
    }

    async fn get_series(&self, id: &str) -> BookingResult<Option<BookingSeries>> {
        let row: Option<SeriesRow> = sqlx::query_as("SELECT * FROM booking_series WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        row.map(row_to_series).transpose()
    }

    async fn active_series(&self) -> BookingResult<Vec<BookingSeries>> {
        let rows: Vec<SeriesRow> = sqlx::query_as(
            "SELECT * FROM booking_series WHERE status = 'active' ORDER BY created_at, id",
        )
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(row_to_series).collect()
    }

    async fn set_series_status(&self, id: &str, status: SeriesStatus) -> BookingResult<()> {
        let result = sqlx::query("UPDATE booking_series SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BookingError::NotFound(format!("series {}", id)));
        }
        Ok(())
    }

    async fn set_master_event(&self, id: &str, event_id: &str) -> BookingResult<()> {
        let result = sqlx::query("UPDATE booking_series SET master_event_id = ? WHERE id = ?")
            .bind(event_id)
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BookingError::NotFound(format!("series {}", id)));
        }
        Ok(())
    }

    async fn add_excluded_date(
        &self,
        series_id: &str,
        date: NaiveDate,
    ) -> BookingResult<BTreeSet<NaiveDate>> {
        let dates: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE booking_series
            SET excluded_dates = (
                SELECT json_group_array(value) FROM (
                    SELECT value FROM json_each(booking_series.excluded_dates)
                    UNION
                    SELECT ?
                    ORDER BY value
                )
            )
            WHERE id = ?
            RETURNING excluded_dates
            "#,
        )
        .bind(date.to_string())
        .bind(series_id)
        .fetch_optional(&self.db)
        .await?;

        let dates = dates.ok_or_else(|| BookingError::NotFound(format!("series {}", series_id)))?;
        Ok(serde_json::from_str(&dates)?)
    }

    async fn add_override(
        &self,
        series_id: &str,
        index: u32,
        event_id: &str,
    ) -> BookingResult<()> {
        let result = sqlx::query(
            "UPDATE booking_series SET overrides = json_set(overrides, '$.\"' || ? || '\"', ?) WHERE id = ?",
        )
        .bind(index.to_string())
        .bind(event_id)
        .bind(series_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BookingError::NotFound(format!("series {}", series_id)));
        }
        Ok(())
    }

    async fn max_occurrence_index(&self, series_id: &str) -> BookingResult<Option<u32>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(occurrence_index) FROM bookings WHERE series_id = ?")
                .bind(series_id)
                .fetch_one(&self.db)
                .await?;

        max.map(|v| {
            u32::try_from(v)
                .map_err(|_| BookingError::Serialization(format!("bad occurrence index {}", v)))
        })
        .transpose()
    }

    async fn insert_bill(&self, bill: &Bill) -> BookingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bills (id, booking_id, amount_minor, currency, status, send_at,
                               session_url, claimed_at, paid_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&bill.id)
        .bind(&bill.booking_id)
        .bind(bill.amount.amount_minor)
        .bind(&bill.amount.currency)
        .bind(bill.status.as_str())
        .bind(bill.send_at.map(ts))
        .bind(&bill.session_url)
        .bind(bill.claimed_at.map(ts))
        .bind(bill.paid_at.map(ts))
        .bind(ts(bill.created_at))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn bills_for_booking(&self, booking_id: &str) -> BookingResult<Vec<Bill>> {
        let rows: Vec<BillRow> =
            sqlx::query_as("SELECT * FROM bills WHERE booking_id = ? ORDER BY created_at")
                .bind(booking_id)
                .fetch_all(&self.db)
                .await?;

        rows.into_iter().map(row_to_bill).collect()
    }

    async fn update_bill(&self, bill: &Bill) -> BookingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE bills
            SET status = ?, send_at = ?, session_url = ?, claimed_at = ?, paid_at = ?
            WHERE id = ?
            "#,
        )
        .bind(bill.status.as_str())
        .bind(bill.send_at.map(ts))
        .bind(&bill.session_url)
        .bind(bill.claimed_at.map(ts))
        .bind(bill.paid_at.map(ts))
        .bind(&bill.id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BookingError::NotFound(format!("bill {}", bill.id)));
        }
        Ok(())
    }

    async fn claim_due_bills(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        stale_after: Duration,
    ) -> BookingResult<Vec<Bill>> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let stale_before = ts(now - stale_after);

        // Single statement, so two concurrent runs can never claim the same row.
        let rows: Vec<BillRow> = sqlx::query_as(
            r#"
            UPDATE bills
            SET claimed_at = ?
            WHERE id IN (
                SELECT id FROM bills
                WHERE status = 'scheduled'
                  AND send_at IS NOT NULL
                  AND send_at <= ?
                  AND (claimed_at IS NULL OR claimed_at < ?)
                ORDER BY send_at
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(ts(now))
        .bind(ts(now))
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        let mut bills = rows
            .into_iter()
            .map(row_to_bill)
            .collect::<BookingResult<Vec<_>>>()?;
        bills.sort_by_key(|b| b.send_at);
        Ok(bills)
    }

    async fn release_bill_claim(&self, bill_id: &str) -> BookingResult<()> {
        sqlx::query("UPDATE bills SET claimed_at = NULL WHERE id = ?")
            .bind(bill_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_calendar_event(&self, record: &CalendarEventRecord) -> BookingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO calendar_events (id, booking_id, provider_event_id, kind, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.booking_id)
        .bind(&record.provider_event_id)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(ts(record.created_at))
        .execute(&self.db)
        .await
        .map_err(|e| {
            conflict_on_unique(
                e,
                format!(
                    "booking {} already has an active calendar event",
                    record.booking_id
                ),
            )
        })?;

        Ok(())
    }

    async fn active_calendar_event(
        &self,
        booking_id: &str,
    ) -> BookingResult<Option<CalendarEventRecord>> {
        let row: Option<CalendarEventRow> = sqlx::query_as(
            "SELECT * FROM calendar_events WHERE booking_id = ? AND status = ?",
        )
        .bind(booking_id)
        .bind(EventRecordStatus::Active.as_str())
        .fetch_optional(&self.db)
        .await?;

        row.map(row_to_calendar_event).transpose()
    }

    async fn calendar_events_for_booking(
        &self,
        booking_id: &str,
    ) -> BookingResult<Vec<CalendarEventRecord>> {
        let rows: Vec<CalendarEventRow> = sqlx::query_as(
            "SELECT * FROM calendar_events WHERE booking_id = ? ORDER BY created_at",
        )
        .bind(booking_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(row_to_calendar_event).collect()
    }

    async fn mark_calendar_event_canceled(&self, record_id: &str) -> BookingResult<()> {
        let result = sqlx::query("UPDATE calendar_events SET status = ? WHERE id = ?")
            .bind(EventRecordStatus::Canceled.as_str())
            .bind(record_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BookingError::NotFound(format!("calendar event {}", record_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::booking::{BillStatus, EventKind};
    use crate::testing::{booking_fixture, series_fixture};

    async fn setup_test_store() -> SqliteStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteStore::new(pool);
        store.init_db().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_booking_round_trip_and_slot_uniqueness() {
        let store = setup_test_store().await;

        let mut booking = booking_fixture("owner-1");
        booking.series = Some(SeriesSlot {
            series_id: "series-1".into(),
            index: 2,
        });
        store.insert_booking(&booking).await.unwrap();

        let loaded = store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(loaded.series, booking.series);
        assert_eq!(loaded.start, booking.start);
        assert_eq!(loaded.status, BookingStatus::Pending);

        let mut duplicate = booking_fixture("owner-1");
        duplicate.series = booking.series.clone();
        let err = store.insert_booking(&duplicate).await.unwrap_err();
        assert!(matches!(err, BookingError::Conflict(_)), "got {:?}", err);

        // Non-series bookings never collide on the slot index.
        store.insert_booking(&booking_fixture("owner-1")).await.unwrap();
        store.insert_booking(&booking_fixture("owner-1")).await.unwrap();

        assert_eq!(store.max_occurrence_index("series-1").await.unwrap(), Some(2));
        assert_eq!(store.max_occurrence_index("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_series_exceptions_persist() {
        let store = setup_test_store().await;
        let series = series_fixture("owner-1");
        store.insert_series(&series).await.unwrap();

        let first: NaiveDate = "2025-03-31".parse().unwrap();
        let second: NaiveDate = "2025-03-24".parse().unwrap();
        store.add_excluded_date(&series.id, first).await.unwrap();
        let dates = store.add_excluded_date(&series.id, second).await.unwrap();
        assert_eq!(dates, store.add_excluded_date(&series.id, second).await.unwrap());
        assert_eq!(dates.iter().copied().collect::<Vec<_>>(), vec![second, first]);

        store.add_override(&series.id, 3, "evt-9").await.unwrap();
        store.add_override(&series.id, 12, "evt-12").await.unwrap();
        store.add_override(&series.id, 3, "evt-10").await.unwrap();
        let overrides: BTreeMap<u32, String> =
            [(3, "evt-10".to_string()), (12, "evt-12".to_string())]
                .into_iter()
                .collect();

        let loaded = store.get_series(&series.id).await.unwrap().unwrap();
        assert_eq!(loaded.excluded_dates, dates);
        assert_eq!(loaded.overrides, overrides);
        assert_eq!(loaded.anchor_local, series.anchor_local);
        assert_eq!(loaded.weekday, series.weekday);
        assert_eq!(loaded.first_session_price, series.first_session_price);

        store.set_series_status(&series.id, SeriesStatus::Paused).await.unwrap();
        assert!(store.active_series().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_due_bills() {
        let store = setup_test_store().await;
        let now = Utc::now();
        let due = Bill::new(
            "booking-1",
            Money::new(8000, "EUR"),
            BillStatus::Scheduled,
            Some(now - Duration::hours(1)),
        );
        let later = Bill::new(
            "booking-2",
            Money::new(8000, "EUR"),
            BillStatus::Scheduled,
            Some(now + Duration::hours(1)),
        );
        store.insert_bill(&due).await.unwrap();
        store.insert_bill(&later).await.unwrap();

        let stale = Duration::minutes(15);
        let claimed = store.claim_due_bills(now, 10, stale).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert!(claimed[0].claimed_at.is_some());

        assert!(store.claim_due_bills(now, 10, stale).await.unwrap().is_empty());

        store.release_bill_claim(&due.id).await.unwrap();
        assert_eq!(store.claim_due_bills(now, 10, stale).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_single_active_calendar_event() {
        let store = setup_test_store().await;
        let first = CalendarEventRecord::new("booking-1", "evt-1", EventKind::Placeholder);
        store.insert_calendar_event(&first).await.unwrap();

        let second = CalendarEventRecord::new("booking-1", "evt-2", EventKind::Full);
        let err = store.insert_calendar_event(&second).await.unwrap_err();
        assert!(matches!(err, BookingError::Conflict(_)));

        store.mark_calendar_event_canceled(&first.id).await.unwrap();
        store.insert_calendar_event(&second).await.unwrap();

        let active = store.active_calendar_event("booking-1").await.unwrap().unwrap();
        assert_eq!(active.provider_event_id, "evt-2");
        assert_eq!(store.calendar_events_for_booking("booking-1").await.unwrap().len(), 2);
    }
}
