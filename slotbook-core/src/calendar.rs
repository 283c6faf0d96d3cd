//! Calendar side of a booking: the adapter contract and its provider-backed
//! implementation.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::booking::{EventKind, TimeRange};
use crate::error::BookingResult;
use crate::ics::recurrence_lines;
use crate::provider::ProviderConfig;
use crate::provider::protocol::{
    CancelEvent, CreateEvent, DeleteEvent, ListInstances, PatchRecurrence, RescheduleEvent,
};
use crate::recurrence::RecurrenceRule;

/// What to put on the calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    pub kind: EventKind,
    pub summary: String,
    pub attendees: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// IANA timezone the event should be displayed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Ask the provider to attach a video conference link.
    #[serde(default)]
    pub conference: bool,
    /// RRULE/EXDATE lines for a master event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl EventSpec {
    pub fn new(kind: EventKind, summary: &str, attendees: Vec<String>, range: TimeRange) -> Self {
        EventSpec {
            kind,
            summary: summary.to_string(),
            attendees,
            start: range.start,
            end: range.end,
            timezone: None,
            conference: false,
            recurrence: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedEvent {
    pub id: String,
    #[serde(default)]
    pub conference_url: Option<String>,
}

/// One expanded instance of a recurring event as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInstance {
    pub id: String,
    pub start: DateTime<Utc>,
}

/// The complete exclusion list of a master event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusions {
    pub timezone: String,
    pub excluded_dates: Vec<NaiveDate>,
    /// RRULE plus one EXDATE line per excluded date.
    pub recurrence: Vec<String>,
}

impl Exclusions {
    pub fn new(rule: &RecurrenceRule, excluded: &BTreeSet<NaiveDate>) -> Self {
        Exclusions {
            timezone: rule.timezone().name().to_string(),
            excluded_dates: excluded.iter().copied().collect(),
            recurrence: recurrence_lines(rule, excluded),
        }
    }
}

#[async_trait]
pub trait CalendarAdapter: Send + Sync {
    async fn create_event(&self, spec: &EventSpec) -> BookingResult<CreatedEvent>;

    /// Cancel with notice to attendees.
    async fn cancel_event(&self, event_id: &str) -> BookingResult<()>;

    /// Remove silently.
    async fn delete_event(&self, event_id: &str) -> BookingResult<()>;

    async fn patch_recurrence_exclusions(
        &self,
        master_event_id: &str,
        exclusions: &Exclusions,
    ) -> BookingResult<()>;

    async fn list_instances(
        &self,
        master_event_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BookingResult<Vec<EventInstance>>;

    async fn reschedule_event(&self, event_id: &str, range: &TimeRange) -> BookingResult<()>;

    /// Locate the materialized instance of `master_event_id` that starts
    /// closest to `approximate_start`, within `tolerance`.
    ///
    /// Recurring instances have no stable id until the provider materializes
    /// them, so this is a best-effort match on start time.
    async fn find_materialized_instance(
        &self,
        master_event_id: &str,
        approximate_start: DateTime<Utc>,
        tolerance: Duration,
        search_window: Duration,
    ) -> BookingResult<Option<String>> {
        let instances = self
            .list_instances(
                master_event_id,
                approximate_start - search_window,
                approximate_start + search_window,
            )
            .await?;
        Ok(nearest_instance(&instances, approximate_start, tolerance).map(|i| i.id.clone()))
    }
}

pub fn nearest_instance(
    instances: &[EventInstance],
    target: DateTime<Utc>,
    tolerance: Duration,
) -> Option<&EventInstance> {
    instances
        .iter()
        .map(|instance| (instance, (instance.start - target).abs()))
        .filter(|(_, distance)| *distance <= tolerance)
        .min_by_key(|(_, distance)| *distance)
        .map(|(instance, _)| instance)
}

/// Calendar adapter backed by a provider binary.
pub struct ProviderCalendar {
    config: ProviderConfig,
}

impl ProviderCalendar {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CalendarAdapter for ProviderCalendar {
    async fn create_event(&self, spec: &EventSpec) -> BookingResult<CreatedEvent> {
        self.config
            .provider
            .call(CreateEvent {
                params: self.config.params.clone(),
                event: spec.clone(),
            })
            .await
    }

    async fn cancel_event(&self, event_id: &str) -> BookingResult<()> {
        self.config
            .provider
            .call(CancelEvent {
                params: self.config.params.clone(),
                event_id: event_id.to_string(),
            })
            .await
    }

    async fn delete_event(&self, event_id: &str) -> BookingResult<()> {
        self.config
            .provider
            .call(DeleteEvent {
                params: self.config.params.clone(),
                event_id: event_id.to_string(),
            })
            .await
    }

    async fn patch_recurrence_exclusions(
        &self,
        master_event_id: &str,
        exclusions: &Exclusions,
    ) -> BookingResult<()> {
        self.config
            .provider
            .call(PatchRecurrence {
                params: self.config.params.clone(),
                event_id: master_event_id.to_string(),
                exclusions: exclusions.clone(),
            })
            .await
    }

    async fn list_instances(
        &self,
        master_event_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BookingResult<Vec<EventInstance>> {
        self.config
            .provider
            .call(ListInstances {
                params: self.config.params.clone(),
                event_id: master_event_id.to_string(),
                from: from.to_rfc3339(),
                to: to.to_rfc3339(),
            })
            .await
    }

    async fn reschedule_event(&self, event_id: &str, range: &TimeRange) -> BookingResult<()> {
        self.config
            .provider
            .call(RescheduleEvent {
                params: self.config.params.clone(),
                event_id: event_id.to_string(),
                start: range.start,
                end: range.end,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, start: &str) -> EventInstance {
        EventInstance {
            id: id.to_string(),
            start: DateTime::parse_from_rfc3339(start).unwrap().with_timezone(&Utc),
        }
    }

    #[test]
    fn test_nearest_instance_within_tolerance() {
        let target = DateTime::parse_from_rfc3339("2025-04-07T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let instances = vec![
            instance("week-before", "2025-03-31T08:00:00Z"),
            instance("late", "2025-04-07T08:00:50Z"),
            instance("close", "2025-04-07T07:59:40Z"),
        ];

        let found = nearest_instance(&instances, target, Duration::minutes(1)).unwrap();
        assert_eq!(found.id, "close");

        assert!(nearest_instance(&instances, target, Duration::seconds(10)).is_none());
        assert!(nearest_instance(&[], target, Duration::minutes(1)).is_none());
    }

    #[test]
    fn test_event_spec_wire_format() {
        let range = TimeRange::parse("2025-04-07T08:00:00Z", "2025-04-07T08:50:00Z").unwrap();
        let spec = EventSpec::new(
            EventKind::Placeholder,
            "Session",
            vec!["client@example.com".into()],
            range,
        )
        .with_metadata("booking_id", "b-1");

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "placeholder");
        assert_eq!(json["metadata"]["booking_id"], "b-1");
        assert!(json.get("recurrence").is_none());
    }
}
