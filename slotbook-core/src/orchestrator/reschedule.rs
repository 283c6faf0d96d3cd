use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use super::{Orchestrator, Warning, Warnings};
use crate::booking::{Booking, CalendarEventRecord, EventKind, SeriesSlot, TimeRange};
use crate::error::{BookingError, BookingResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleOutcome {
    pub booking: Booking,
    /// False when any calendar step failed; the booking times are updated
    /// either way.
    pub calendar_synced: bool,
    pub warnings: Vec<Warning>,
}

impl Orchestrator {
    /// Move a booking to `range`.
    ///
    /// The first move of a series occurrence detaches it from the master
    /// event: the original date is excluded and a standalone event takes its
    /// place. Later moves patch that standalone event in place.
    pub async fn reschedule(
        &self,
        booking_id: &str,
        owner_id: &str,
        range: TimeRange,
    ) -> BookingResult<RescheduleOutcome> {
        if range.start >= range.end {
            return Err(BookingError::Validation(
                "start must be before end".to_string(),
            ));
        }
        let mut booking = self.load_owned(booking_id, owner_id).await?;
        if booking.status.is_terminal() {
            return Err(BookingError::Conflict(format!(
                "booking {} is {} and can no longer be rescheduled",
                booking_id, booking.status
            )));
        }

        let mut warnings = Warnings::default();
        match booking.series.clone() {
            Some(slot) => {
                self.move_series_occurrence(&mut booking, &slot, range, &mut warnings)
                    .await
            }
            None => self.move_event(&booking, range, &mut warnings).await,
        }

        booking.start = range.start;
        booking.end = range.end;
        booking.updated_at = Utc::now();
        self.store.update_booking(&booking).await?;

        let calendar_synced = warnings.is_empty();
        info!(
            booking_id,
            start = %booking.start,
            calendar_synced,
            "Rescheduled booking"
        );

        Ok(RescheduleOutcome {
            booking,
            calendar_synced,
            warnings: warnings.into_vec(),
        })
    }

    /// Patch the booking's own calendar event, if it has one.
    async fn move_event(&self, booking: &Booking, range: TimeRange, warnings: &mut Warnings) {
        match self.store.active_calendar_event(&booking.id).await {
            Ok(Some(record)) => {
                if let Err(e) = self
                    .calendar
                    .reschedule_event(&record.provider_event_id, &range)
                    .await
                {
                    warnings.calendar(&booking.id, "reschedule event", &e);
                }
            }
            Ok(None) => debug!(booking_id = %booking.id, "No calendar event to move"),
            Err(e) => warnings.calendar(&booking.id, "load calendar event", &e),
        }
    }

    async fn move_series_occurrence(
        &self,
        booking: &mut Booking,
        slot: &SeriesSlot,
        range: TimeRange,
        warnings: &mut Warnings,
    ) {
        let existing = match &booking.standalone_event_id {
            Some(id) => Some(id.clone()),
            None => match self
                .exceptions
                .standalone_override(&slot.series_id, slot.index)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    warnings.calendar(&booking.id, "load override", &e);
                    return;
                }
            },
        };

        if let Some(event_id) = existing {
            if let Err(e) = self.calendar.reschedule_event(&event_id, &range).await {
                warnings.calendar(&booking.id, "reschedule standalone event", &e);
            }
            booking.standalone_event_id = Some(event_id);
            return;
        }

        self.delete_materialized_instance(booking, slot, warnings).await;
        self.exclude_occurrence(booking, slot, warnings).await;
        self.retire_active_event(booking, warnings).await;

        let spec = self.event_spec(
            EventKind::Standalone,
            vec![booking.client_email.clone()],
            booking,
            range,
        );
        let created = match self.calendar.create_event(&spec).await {
            Ok(created) => created,
            Err(e) => {
                warnings.calendar(&booking.id, "create standalone event", &e);
                return;
            }
        };

        if let Err(e) = self
            .exceptions
            .record_standalone_override(&slot.series_id, slot.index, &created.id)
            .await
        {
            warnings.calendar(&booking.id, "record override", &e);
        }
        self.mirror_event(
            CalendarEventRecord::new(&booking.id, &created.id, EventKind::Standalone),
            warnings,
        )
        .await;
        booking.standalone_event_id = Some(created.id);
    }

    /// Delete the master's instance at the occurrence's original time.
    async fn delete_materialized_instance(
        &self,
        booking: &Booking,
        slot: &SeriesSlot,
        warnings: &mut Warnings,
    ) {
        let series = match self.series(&slot.series_id).await {
            Ok(series) => series,
            Err(e) => {
                warnings.calendar(&booking.id, "load series", &e);
                return;
            }
        };
        let Some(master) = series.master_event_id.as_deref() else {
            return;
        };
        let rule = match series.rule() {
            Ok(rule) => rule,
            Err(e) => {
                warnings.calendar(&booking.id, "series rule", &e);
                return;
            }
        };

        let original = rule.occurrence_at(slot.index);
        let found = self
            .calendar
            .find_materialized_instance(
                master,
                original.start_utc,
                self.options.instance_tolerance,
                self.options.instance_search_window,
            )
            .await;
        match found {
            Ok(Some(instance_id)) => {
                if let Err(e) = self.calendar.delete_event(&instance_id).await {
                    warnings.calendar(&booking.id, "delete series instance", &e);
                }
            }
            Ok(None) => {
                debug!(booking_id = %booking.id, index = slot.index, "No materialized instance found")
            }
            Err(e) => warnings.calendar(&booking.id, "list series instances", &e),
        }
    }

    /// Withdraw the occurrence's own event when it was created without a master.
    async fn retire_active_event(&self, booking: &Booking, warnings: &mut Warnings) {
        let record = match self.store.active_calendar_event(&booking.id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warnings.calendar(&booking.id, "load calendar event", &e);
                return;
            }
        };
        if let Err(e) = self.calendar.delete_event(&record.provider_event_id).await {
            warnings.calendar(&booking.id, "delete occurrence event", &e);
            return;
        }
        if let Err(e) = self.store.mark_calendar_event_canceled(&record.id).await {
            warnings.calendar(&booking.id, "record deleted event", &e);
        }
    }
}
