//! iCalendar recurrence lines for a series' master event.

use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::recurrence::RecurrenceRule;

/// The full recurrence of a master event: its RRULE plus one EXDATE per
/// excluded local date, at the series' local start time.
///
/// Calendar providers replace the recurrence wholesale, so this is always the
/// complete list, never a delta.
pub fn recurrence_lines(rule: &RecurrenceRule, excluded: &BTreeSet<NaiveDate>) -> Vec<String> {
    let mut lines = vec![format!("RRULE:{}", rule.rrule_line())];
    let time = rule.anchor_local().time();
    for date in excluded {
        lines.push(format!(
            "EXDATE;TZID={}:{}",
            rule.timezone().name(),
            date.and_time(time).format("%Y%m%dT%H%M%S")
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, Weekday};

    #[test]
    fn test_full_exclusion_list_is_emitted_sorted() {
        let anchor = NaiveDateTime::parse_from_str("2025-03-17 10:00", "%Y-%m-%d %H:%M").unwrap();
        let rule = RecurrenceRule::new("Europe/Berlin", anchor, 1, Weekday::Mon, 50).unwrap();

        let excluded: BTreeSet<NaiveDate> = ["2025-04-14", "2025-03-24"]
            .iter()
            .map(|d| d.parse().unwrap())
            .collect();

        assert_eq!(
            recurrence_lines(&rule, &excluded),
            vec![
                "RRULE:FREQ=WEEKLY;INTERVAL=1;BYDAY=MO".to_string(),
                "EXDATE;TZID=Europe/Berlin:20250324T100000".to_string(),
                "EXDATE;TZID=Europe/Berlin:20250414T100000".to_string(),
            ]
        );
    }

    #[test]
    fn test_no_exclusions() {
        let anchor = NaiveDateTime::parse_from_str("2025-01-08 18:30", "%Y-%m-%d %H:%M").unwrap();
        let rule = RecurrenceRule::new("UTC", anchor, 2, Weekday::Wed, 60).unwrap();
        assert_eq!(
            recurrence_lines(&rule, &BTreeSet::new()),
            vec!["RRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=WE".to_string()]
        );
    }
}
