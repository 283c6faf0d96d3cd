//! Occurrence generation for weekly and bi-weekly series.
//!
//! Dates are expanded with the `rrule` crate on the series' *local* wall clock,
//! then each occurrence is anchored to UTC through its timezone. Indices count
//! interval-steps from the anchor, so index 0 is always the anchor itself.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::booking::{BookingSeries, TimeRange};
use crate::error::{BookingError, BookingResult};

/// The repeat rule of a series, validated.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrenceRule {
    timezone: Tz,
    anchor_local: NaiveDateTime,
    interval_weeks: u32,
    weekday: Weekday,
    duration: Duration,
}

/// One concrete slot produced by a [`RecurrenceRule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub index: u32,
    pub start_local: NaiveDateTime,
    pub end_local: NaiveDateTime,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

impl Occurrence {
    /// The local calendar date, i.e. the EXDATE key of this occurrence.
    pub fn local_date(&self) -> NaiveDate {
        self.start_local.date()
    }

    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start_utc,
            end: self.end_utc,
        }
    }
}

impl RecurrenceRule {
    pub fn new(
        timezone: &str,
        anchor_local: NaiveDateTime,
        interval_weeks: u32,
        weekday: Weekday,
        duration_minutes: u32,
    ) -> BookingResult<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| BookingError::Recurrence(format!("unknown timezone '{}'", timezone)))?;

        if !matches!(interval_weeks, 1 | 2) {
            return Err(BookingError::Recurrence(format!(
                "interval must be 1 or 2 weeks, got {}",
                interval_weeks
            )));
        }

        if anchor_local.weekday() != weekday {
            return Err(BookingError::Recurrence(format!(
                "anchor {} falls on {}, not {}",
                anchor_local.date(),
                anchor_local.weekday(),
                weekday
            )));
        }

        if duration_minutes == 0 {
            return Err(BookingError::Recurrence(
                "duration must be at least one minute".into(),
            ));
        }

        Ok(RecurrenceRule {
            timezone: tz,
            anchor_local,
            interval_weeks,
            weekday,
            duration: Duration::minutes(i64::from(duration_minutes)),
        })
    }

    pub fn for_series(series: &BookingSeries) -> BookingResult<Self> {
        Self::new(
            &series.timezone,
            series.anchor_local,
            series.interval_weeks,
            series.weekday,
            series.duration_minutes,
        )
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn anchor_local(&self) -> NaiveDateTime {
        self.anchor_local
    }

    pub fn interval_weeks(&self) -> u32 {
        self.interval_weeks
    }

    /// RRULE value for calendar providers, e.g. `FREQ=WEEKLY;INTERVAL=2;BYDAY=MO`.
    pub fn rrule_line(&self) -> String {
        format!(
            "FREQ=WEEKLY;INTERVAL={};BYDAY={}",
            self.interval_weeks,
            byday(self.weekday)
        )
    }

    /// Compute occurrence `index` directly from the anchor.
    pub fn occurrence_at(&self, index: u32) -> Occurrence {
        let weeks = i64::from(index) * i64::from(self.interval_weeks);
        let start_local = self.anchor_local + Duration::weeks(weeks);
        let start_utc = local_to_utc(self.timezone, start_local);

        Occurrence {
            index,
            start_local,
            end_local: start_local + self.duration,
            start_utc,
            end_utc: start_utc + self.duration,
        }
    }

    /// Build the rrule input. The anchor is given as a floating time so that
    /// expansion happens on the local wall clock, unaffected by DST.
    fn build_rrule_string(&self) -> String {
        format!(
            "DTSTART:{}Z\nRRULE:{}",
            self.anchor_local.format("%Y%m%dT%H%M%S"),
            self.rrule_line()
        )
    }

    fn index_of(&self, start_local: NaiveDateTime) -> Option<u32> {
        let days = (start_local.date() - self.anchor_local.date()).num_days();
        let step = 7 * i64::from(self.interval_weeks);
        if days < 0 || days % step != 0 {
            return None;
        }
        u32::try_from(days / step).ok()
    }
}

impl BookingSeries {
    pub fn rule(&self) -> BookingResult<RecurrenceRule> {
        RecurrenceRule::for_series(self)
    }
}

/// Expand `rule` into the occurrences starting in `[window_start, window_end)`
/// (local wall-clock times), at most `max_count` of them, in order.
pub fn generate(
    rule: &RecurrenceRule,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
    max_count: usize,
) -> BookingResult<Vec<Occurrence>> {
    if max_count == 0 || window_start >= window_end {
        return Ok(Vec::new());
    }

    let rrule_set: RRuleSet = rule.build_rrule_string().parse().map_err(|e| {
        BookingError::Recurrence(format!("Failed to parse RRULE '{}': {}", rule.rrule_line(), e))
    })?;

    // Floating times are expanded as UTC; the window uses the same convention.
    // after/before are exclusive, so widen by a second on each side.
    let tz: rrule::Tz = Utc.into();
    let after = (window_start.and_utc() - Duration::seconds(1)).with_timezone(&tz);
    let before = (window_end.and_utc() + Duration::seconds(1)).with_timezone(&tz);

    let limit = u16::try_from(max_count.saturating_add(1)).unwrap_or(u16::MAX);
    let result = rrule_set.after(after).before(before).all(limit);

    let occurrences = result
        .dates
        .iter()
        .map(|dt| dt.naive_utc())
        .filter(|start| *start >= window_start && *start < window_end)
        .filter_map(|start| rule.index_of(start))
        .map(|index| rule.occurrence_at(index))
        .take(max_count)
        .collect();

    Ok(occurrences)
}

/// Resolve a local wall-clock time in `tz` to UTC.
///
/// Ambiguous times (DST fall-back) resolve to the earlier instant. Times inside
/// a DST gap keep the offset in force before the gap, which moves them forward
/// by the gap length (02:30 on a spring-forward night reads as 03:30).
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(first, second) => first.min(second).with_timezone(&Utc),
        LocalResult::None => {
            let before_gap = tz
                .offset_from_utc_datetime(&(local - Duration::days(1)))
                .fix();
            let utc = local - Duration::seconds(i64::from(before_gap.local_minus_utc()));
            utc.and_utc()
        }
    }
}

fn byday(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn berlin_weekly() -> RecurrenceRule {
        RecurrenceRule::new("Europe/Berlin", local("2025-03-17 10:00"), 1, Weekday::Mon, 50)
            .unwrap()
    }

    #[test]
    fn test_index_zero_is_anchor() {
        let rule = berlin_weekly();
        let occ = rule.occurrence_at(0);
        assert_eq!(occ.start_local, local("2025-03-17 10:00"));
        assert_eq!(occ.end_local, local("2025-03-17 10:50"));
        assert_eq!(occ.start_utc, utc("2025-03-17T09:00:00Z"));
    }

    #[test]
    fn test_local_time_is_kept_across_dst() {
        // Europe/Berlin switches to summer time on 2025-03-30.
        let occ = berlin_weekly().occurrence_at(2);
        assert_eq!(occ.start_local, local("2025-03-31 10:00"));
        assert_eq!(occ.start_utc, utc("2025-03-31T08:00:00Z"));
        assert_eq!(occ.end_utc, utc("2025-03-31T08:50:00Z"));
    }

    #[test]
    fn test_biweekly_index_steps() {
        let rule =
            RecurrenceRule::new("Europe/Berlin", local("2025-01-08 18:30"), 2, Weekday::Wed, 60)
                .unwrap();
        for k in [1u32, 6, 13] {
            let occ = rule.occurrence_at(k);
            assert_eq!(
                occ.start_local,
                local("2025-01-08 18:30") + Duration::weeks(2 * i64::from(k))
            );
        }
    }

    #[test]
    fn test_generate_matches_occurrence_at() {
        let rule = berlin_weekly();
        let occs = generate(&rule, local("2025-03-01 00:00"), local("2025-04-15 00:00"), 10)
            .unwrap();

        let indices: Vec<u32> = occs.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        for occ in &occs {
            assert_eq!(*occ, rule.occurrence_at(occ.index));
        }
    }

    #[test]
    fn test_generate_is_deterministic() {
        let rule =
            RecurrenceRule::new("America/New_York", local("2025-02-04 09:00"), 2, Weekday::Tue, 45)
                .unwrap();
        let a = generate(&rule, local("2025-02-01 00:00"), local("2025-12-31 00:00"), 50).unwrap();
        let b = generate(&rule, local("2025-02-01 00:00"), local("2025-12-31 00:00"), 50).unwrap();
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0].index + 1 == w[1].index));
    }

    #[test]
    fn test_generate_window_and_limit() {
        let rule = berlin_weekly();

        // Window starting mid-series yields the right indices.
        let occs = generate(&rule, local("2025-04-07 10:00"), local("2025-05-01 00:00"), 2).unwrap();
        let indices: Vec<u32> = occs.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![3, 4]);

        // Nothing before the anchor.
        let before = generate(&rule, local("2025-01-01 00:00"), local("2025-03-17 09:59"), 5).unwrap();
        assert!(before.is_empty());

        assert!(generate(&rule, local("2025-03-01 00:00"), local("2025-04-01 00:00"), 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_window_of_single_occurrence() {
        let rule = berlin_weekly();
        let expected = rule.occurrence_at(6);
        let occs = generate(&rule, expected.start_local, expected.end_local, 1).unwrap();
        assert_eq!(occs, vec![expected]);
    }

    #[test]
    fn test_rejects_bad_interval_and_weekday() {
        let err = RecurrenceRule::new("Europe/Berlin", local("2025-03-17 10:00"), 3, Weekday::Mon, 50)
            .unwrap_err();
        assert!(matches!(err, BookingError::Recurrence(_)));

        let err = RecurrenceRule::new("Europe/Berlin", local("2025-03-17 10:00"), 1, Weekday::Tue, 50)
            .unwrap_err();
        assert!(err.to_string().contains("Mon"), "Unexpected error: {}", err);

        assert!(RecurrenceRule::new("Mars/Olympus", local("2025-03-17 10:00"), 1, Weekday::Mon, 50).is_err());
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 02:30 does not exist on 2025-03-09 in New York.
        assert_eq!(
            local_to_utc(tz, local("2025-03-09 02:30")),
            utc("2025-03-09T07:30:00Z")
        );

        let rule =
            RecurrenceRule::new("America/New_York", local("2025-03-02 02:30"), 1, Weekday::Sun, 60)
                .unwrap();
        assert_eq!(rule.occurrence_at(1).start_utc, utc("2025-03-09T07:30:00Z"));
    }

    #[test]
    fn test_ambiguous_time_takes_earlier_instant() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 01:30 happens twice on 2025-11-02; the EDT reading comes first.
        assert_eq!(
            local_to_utc(tz, local("2025-11-02 01:30")),
            utc("2025-11-02T05:30:00Z")
        );
    }

    #[test]
    fn test_rrule_line() {
        let rule =
            RecurrenceRule::new("Europe/Berlin", local("2025-01-10 08:00"), 2, Weekday::Fri, 30)
                .unwrap();
        assert_eq!(rule.rrule_line(), "FREQ=WEEKLY;INTERVAL=2;BYDAY=FR");
    }
}
