use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use super::{Orchestrator, Warning, Warnings};
use crate::booking::{Bill, BillStatus, Booking, BookingStatus, Money, SeriesSlot};
use crate::calendar::Exclusions;
use crate::error::{BookingError, BookingResult};
use crate::notify::Notification;
use crate::payment::RefundStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub booking: Booking,
    /// The booking was canceled before this call; nothing was done.
    pub already_canceled: bool,
    pub will_refund: bool,
    pub refund_id: Option<String>,
    pub warnings: Vec<Warning>,
}

/// Result of the payment half of a cancellation.
struct Settlement {
    refund_id: Option<String>,
    refunded: Option<Money>,
}

impl Orchestrator {
    /// Cancel a booking on behalf of its owner.
    ///
    /// Payment is reconciled first: if a paid bill exists and its refund
    /// fails, the whole operation aborts with [`BookingError::RefundFailed`]
    /// and nothing else is touched. Calendar failures only degrade.
    pub async fn cancel(&self, booking_id: &str, owner_id: &str) -> BookingResult<CancelOutcome> {
        let mut booking = self.load_owned(booking_id, owner_id).await?;

        match booking.status {
            BookingStatus::Canceled => {
                debug!(booking_id, "Booking already canceled");
                return Ok(CancelOutcome {
                    booking,
                    already_canceled: true,
                    will_refund: false,
                    refund_id: None,
                    warnings: Vec::new(),
                });
            }
            BookingStatus::Completed => {
                return Err(BookingError::Conflict(format!(
                    "booking {} is completed and can no longer be canceled",
                    booking_id
                )));
            }
            BookingStatus::Pending | BookingStatus::Scheduled => {}
        }

        let bills = self.store.bills_for_booking(booking_id).await?;
        let mut warnings = Warnings::default();

        let settlement = self.settle_payment(&booking, &bills, &mut warnings).await?;

        match &booking.series {
            Some(slot) => self.release_series_slot(&booking, slot, &mut warnings).await,
            None => self.withdraw_calendar_event(&booking, &mut warnings).await,
        }

        booking.status = BookingStatus::Canceled;
        booking.updated_at = Utc::now();
        self.store.update_booking(&booking).await?;
        info!(
            booking_id,
            refunded = settlement.refund_id.is_some(),
            "Canceled booking"
        );

        let notification = Notification::Cancellation {
            booking_id: booking.id.clone(),
            to: booking.client_email.clone(),
            start: booking.start,
            refund: settlement.refunded,
        };
        if let Err(e) = self.notifier.send(&notification).await {
            warnings.notification(booking_id, "cancellation notice", &e);
        }

        Ok(CancelOutcome {
            booking,
            already_canceled: false,
            will_refund: settlement.refund_id.is_some(),
            refund_id: settlement.refund_id,
            warnings: warnings.into_vec(),
        })
    }

    /// Refund a paid bill, or close the open ones. Only the refund is fatal.
    async fn settle_payment(
        &self,
        booking: &Booking,
        bills: &[Bill],
        warnings: &mut Warnings,
    ) -> BookingResult<Settlement> {
        let paid = bills.iter().find(|b| b.status == BillStatus::Paid);

        let Some(paid) = paid else {
            // A session can be open even when no bill recorded it yet.
            if let Err(e) = self.payments.cancel_sessions_for_booking(&booking.id).await {
                warnings.payment(&booking.id, "cancel payment sessions", &e);
            }
            self.cancel_open_bills(bills, warnings).await;
            return Ok(Settlement {
                refund_id: None,
                refunded: None,
            });
        };

        let refund = self
            .payments
            .refund(&booking.id, "booking canceled")
            .await
            .map_err(|e| BookingError::RefundFailed(e.to_string()))?;
        if refund.status == RefundStatus::Failed {
            return Err(BookingError::RefundFailed(format!(
                "refund {} was declined",
                refund.id
            )));
        }
        info!(booking_id = %booking.id, refund_id = %refund.id, amount = %paid.amount, "Issued refund");

        let mut refunded = paid.clone();
        refunded.status = BillStatus::Refunded;
        if let Err(e) = self.store.update_bill(&refunded).await {
            warnings.payment(&booking.id, "mark bill refunded", &e);
        }
        self.cancel_open_bills(bills, warnings).await;

        Ok(Settlement {
            refund_id: Some(refund.id),
            refunded: Some(paid.amount.clone()),
        })
    }

    /// Non-series booking: delete a placeholder silently, cancel a real
    /// invitation with notice.
    async fn withdraw_calendar_event(&self, booking: &Booking, warnings: &mut Warnings) {
        let record = match self.store.active_calendar_event(&booking.id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warnings.calendar(&booking.id, "load calendar event", &e);
                return;
            }
        };

        let result = match booking.status {
            BookingStatus::Pending => self.calendar.delete_event(&record.provider_event_id).await,
            BookingStatus::Scheduled | BookingStatus::Completed | BookingStatus::Canceled => {
                self.calendar.cancel_event(&record.provider_event_id).await
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.store.mark_calendar_event_canceled(&record.id).await {
                    warnings.calendar(&booking.id, "record canceled event", &e);
                }
            }
            Err(e) => warnings.calendar(&booking.id, "withdraw event", &e),
        }
    }

    /// Series occurrence: exclude its original date from the master event and
    /// cancel any standalone event that replaced it.
    async fn release_series_slot(&self, booking: &Booking, slot: &SeriesSlot, warnings: &mut Warnings) {
        self.exclude_occurrence(booking, slot, warnings).await;

        let record = match self.store.active_calendar_event(&booking.id).await {
            Ok(record) => record,
            Err(e) => {
                warnings.calendar(&booking.id, "load calendar event", &e);
                None
            }
        };

        match record {
            Some(record) => match self.calendar.cancel_event(&record.provider_event_id).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_calendar_event_canceled(&record.id).await {
                        warnings.calendar(&booking.id, "record canceled event", &e);
                    }
                }
                Err(e) => warnings.calendar(&booking.id, "cancel standalone event", &e),
            },
            None => {
                // Override known to the series but missing from the mirror.
                let standalone = match &booking.standalone_event_id {
                    Some(id) => Some(id.clone()),
                    None => self
                        .exceptions
                        .standalone_override(&slot.series_id, slot.index)
                        .await
                        .unwrap_or_else(|e| {
                            warnings.calendar(&booking.id, "load standalone override", &e);
                            None
                        }),
                };
                if let Some(event_id) = standalone {
                    if let Err(e) = self.calendar.cancel_event(&event_id).await {
                        warnings.calendar(&booking.id, "cancel standalone event", &e);
                    }
                }
            }
        }
    }

    /// Add the occurrence's original local date to the series exclusions and
    /// re-send the complete list to the master event.
    pub(super) async fn exclude_occurrence(
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
        let rule = match series.rule() {
            Ok(rule) => rule,
            Err(e) => {
                warnings.calendar(&booking.id, "series rule", &e);
                return;
            }
        };

        // The booking may have been moved; the slot's own date is what the
        // master event shows.
        let original = rule.occurrence_at(slot.index);
        let excluded = match self
            .exceptions
            .add_excluded_date(&series.id, original.local_date())
            .await
        {
            Ok(dates) => dates,
            Err(e) => {
                warnings.calendar(&booking.id, "exclude date", &e);
                return;
            }
        };

        let Some(master) = &series.master_event_id else {
            return;
        };
        let exclusions = Exclusions::new(&rule, &excluded);
        if let Err(e) = self
            .calendar
            .patch_recurrence_exclusions(master, &exclusions)
            .await
        {
            warnings.calendar(&booking.id, "patch master exclusions", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::EventRecordStatus;
    use crate::error::ErrorKind;
    use crate::store::Store;
    use crate::testing::{CalendarCall, Harness, PaymentCall, new_booking, new_series};

    /// A scheduled booking whose 80.00 EUR bill has been paid.
    async fn paid_booking(h: &Harness) -> Booking {
        let created = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap();
        let bill = created.bill.unwrap();
        h.orchestrator
            .record_payment(&created.booking.id, &bill.id)
            .await
            .unwrap()
            .booking
    }

    #[tokio::test]
    async fn test_pending_unpaid_cancel_deletes_placeholder() {
        let h = Harness::new();
        let created = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap();
        let id = created.booking.id.clone();

        let outcome = h.orchestrator.cancel(&id, "owner-1").await.unwrap();
        assert_eq!(outcome.booking.status, BookingStatus::Canceled);
        assert!(!outcome.will_refund);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

        let calls = h.calendar.calls();
        assert!(calls.contains(&CalendarCall::Delete("evt-1".into())));
        assert!(!calls.iter().any(|c| matches!(c, CalendarCall::Cancel(_))));

        assert!(h.payments.calls().contains(&PaymentCall::CancelSessions(id.clone())));
        assert_eq!(h.payments.refunds(), 0);

        let bills = h.store.bills_for_booking(&id).await.unwrap();
        assert_eq!(bills[0].status, BillStatus::Canceled);

        let stored = h.store.get_booking(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Canceled);
        let records = h.store.calendar_events_for_booking(&id).await.unwrap();
        assert_eq!(records[0].status, EventRecordStatus::Canceled);
    }

    #[tokio::test]
    async fn test_scheduled_paid_cancel_refunds() {
        let h = Harness::new();
        let booking = paid_booking(&h).await;
        assert_eq!(booking.status, BookingStatus::Scheduled);

        let outcome = h.orchestrator.cancel(&booking.id, "owner-1").await.unwrap();
        assert_eq!(outcome.booking.status, BookingStatus::Canceled);
        assert!(outcome.will_refund);
        assert!(outcome.refund_id.is_some());

        // evt-1 was the placeholder, evt-2 the invitation sent after payment.
        assert!(h.calendar.calls().contains(&CalendarCall::Cancel("evt-2".into())));
        assert_eq!(h.payments.refunds(), 1);

        let bills = h.store.bills_for_booking(&booking.id).await.unwrap();
        assert_eq!(bills[0].status, BillStatus::Refunded);

        match h.notifier.sent().last().unwrap() {
            Notification::Cancellation { refund, .. } => {
                assert_eq!(refund.as_ref().map(|m| m.to_string()).as_deref(), Some("80.00 EUR"))
            }
            other => panic!("Unexpected notification: {:?}", other),
        }

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["willRefund"], true);
        assert!(json["refundId"].is_string());
    }

    #[tokio::test]
    async fn test_refund_failure_leaves_booking_untouched() {
        let h = Harness::new();
        let booking = paid_booking(&h).await;
        h.calendar.clear_calls();
        h.payments.fail_on("refund");

        let err = h.orchestrator.cancel(&booking.id, "owner-1").await.unwrap_err();
        assert!(matches!(err, BookingError::RefundFailed(_)));
        assert_eq!(err.kind(), ErrorKind::BadGateway);

        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Scheduled);
        let bills = h.store.bills_for_booking(&booking.id).await.unwrap();
        assert_eq!(bills[0].status, BillStatus::Paid);
        // Attendees were not told about a cancellation that did not happen.
        assert!(h.calendar.calls().is_empty());
    }

    #[tokio::test]
    async fn test_declined_refund_aborts() {
        let h = Harness::new();
        let booking = paid_booking(&h).await;
        h.payments.set_refund_status(RefundStatus::Failed);

        let err = h.orchestrator.cancel(&booking.id, "owner-1").await.unwrap_err();
        assert!(err.to_string().contains("payment could not be refunded"));
        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_second_cancel_has_no_side_effects() {
        let h = Harness::new();
        let booking = paid_booking(&h).await;

        let first = h.orchestrator.cancel(&booking.id, "owner-1").await.unwrap();
        let calendar_calls = h.calendar.calls().len();
        let payment_calls = h.payments.calls().len();
        let sent = h.notifier.sent().len();

        let second = h.orchestrator.cancel(&booking.id, "owner-1").await.unwrap();
        assert!(second.already_canceled);
        assert_eq!(second.booking.status, first.booking.status);
        assert_eq!(h.calendar.calls().len(), calendar_calls);
        assert_eq!(h.payments.calls().len(), payment_calls);
        assert_eq!(h.notifier.sent().len(), sent);
    }

    #[tokio::test]
    async fn test_cancel_requires_owner() {
        let h = Harness::new();
        let created = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap();

        let err = h
            .orchestrator
            .cancel(&created.booking.id, "owner-2")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let err = h.orchestrator.cancel("missing", "owner-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_calendar_failure_does_not_block_cancel() {
        let h = Harness::new();
        let created = h.orchestrator.create(new_booking("owner-1", 8000)).await.unwrap();
        h.calendar.fail_on("delete_event");

        let outcome = h
            .orchestrator
            .cancel(&created.booking.id, "owner-1")
            .await
            .unwrap();
        assert_eq!(outcome.booking.status, BookingStatus::Canceled);
        assert!(matches!(outcome.warnings.as_slice(), [Warning::Calendar(_)]));

        // The mirror only records what actually happened on the calendar.
        let active = h.store.active_calendar_event(&created.booking.id).await.unwrap();
        assert!(active.is_some());
    }

    #[tokio::test]
    async fn test_completed_booking_cannot_be_canceled() {
        let h = Harness::new();
        let booking = paid_booking(&h).await;
        let now = booking.end + chrono::Duration::minutes(1);
        h.orchestrator.complete_elapsed(now).await.unwrap();

        let err = h.orchestrator.cancel(&booking.id, "owner-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_series_cancel_sends_full_exclusion_list() {
        let h = Harness::new();
        let created = h.orchestrator.create_series(new_series("owner-1")).await.unwrap();
        let series = created.series;
        let master = series.master_event_id.clone().unwrap();

        let first = created.first.booking;
        let second = h.orchestrator.materialize_next(&series).await.unwrap().booking;
        let third = h.orchestrator.materialize_next(&series).await.unwrap().booking;

        h.orchestrator.cancel(&third.id, "owner-1").await.unwrap();
        h.orchestrator.cancel(&second.id, "owner-1").await.unwrap();

        let stored = h.store.get_series(&series.id).await.unwrap().unwrap();
        let excluded: Vec<String> = stored.excluded_dates.iter().map(|d| d.to_string()).collect();
        assert_eq!(excluded, vec!["2025-03-24", "2025-03-31"]);

        let patches: Vec<Exclusions> = h
            .calendar
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                CalendarCall::PatchExclusions {
                    master_event_id,
                    exclusions,
                } if master_event_id == master => Some(exclusions),
                _ => None,
            })
            .collect();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].excluded_dates.len(), 1);
        // The second patch re-sends both dates, not only the new one.
        assert_eq!(patches[1].excluded_dates.len(), 2);
        assert_eq!(patches[1].recurrence.len(), 3);

        assert!(h
            .payments
            .calls()
            .contains(&PaymentCall::CancelSessions(second.id.clone())));
        let bills = h.store.bills_for_booking(&second.id).await.unwrap();
        assert_eq!(bills[0].status, BillStatus::Canceled);

        let untouched = h.store.get_booking(&first.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, BookingStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_series_cancel_survives_calendar_outage() {
        let h = Harness::new();
        let created = h.orchestrator.create_series(new_series("owner-1")).await.unwrap();
        h.calendar.fail_on("patch_recurrence_exclusions");

        let outcome = h
            .orchestrator
            .cancel(&created.first.booking.id, "owner-1")
            .await
            .unwrap();
        assert_eq!(outcome.booking.status, BookingStatus::Canceled);
        assert_eq!(outcome.warnings.len(), 1);

        // The exclusion is kept even though the calendar did not take it.
        let stored = h.store.get_series(&created.series.id).await.unwrap().unwrap();
        assert_eq!(stored.excluded_dates.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_closes_session_left_by_failed_send() {
        let h = Harness::new();
        let created = h.orchestrator.create_series(new_series("owner-1")).await.unwrap();
        let booking = created.first.booking;
        let due_at = created.first.bill.unwrap().send_at.unwrap();

        h.notifier.fail_on("send");
        let report = h.orchestrator.send_due_bills(due_at).await.unwrap();
        assert_eq!(report.failed.len(), 1);

        // The session outlives the failed notification and is on record.
        let bills = h.store.bills_for_booking(&booking.id).await.unwrap();
        assert_eq!(bills[0].status, BillStatus::Scheduled);
        assert_eq!(bills[0].session_url.as_deref(), Some("https://pay.test/session/1"));

        h.orchestrator.cancel(&booking.id, "owner-1").await.unwrap();
        assert!(h
            .payments
            .calls()
            .contains(&PaymentCall::CancelSessions(booking.id.clone())));
        let bills = h.store.bills_for_booking(&booking.id).await.unwrap();
        assert_eq!(bills[0].status, BillStatus::Canceled);
    }
}
