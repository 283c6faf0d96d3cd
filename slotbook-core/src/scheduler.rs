//! Series extension: materialize the next occurrence of every active series.
//!
//! Each series runs as its own task behind a semaphore. A series that fails
//! (or panics) is reported and the others carry on.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::booking::BookingSeries;
use crate::error::BookingResult;
use crate::orchestrator::Orchestrator;

pub const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Extended {
    pub series_id: String,
    pub booking_id: String,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSeries {
    pub series_id: String,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ExtensionReport {
    pub extended: Vec<Extended>,
    pub failed: Vec<FailedSeries>,
    /// Tasks that panicked; their series id is not recoverable.
    pub panicked: usize,
}

pub struct SeriesExtensionScheduler {
    orchestrator: Arc<Orchestrator>,
    max_concurrent: usize,
}

impl SeriesExtensionScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent: usize) -> Self {
        Self {
            orchestrator,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// One extension pass over all active series.
    pub async fn run_once(&self) -> BookingResult<ExtensionReport> {
        let series = self.orchestrator.store().active_series().await?;
        info!(count = series.len(), "Extending active series");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for s in series {
            let orchestrator = self.orchestrator.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                let result = extend(&orchestrator, &s).await;
                (s.id, result)
            });
        }

        let mut report = ExtensionReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((series_id, Ok(extended))) => {
                    info!(
                        series_id = %series_id,
                        booking_id = %extended.booking_id,
                        index = extended.index,
                        "Extended series"
                    );
                    report.extended.push(extended);
                }
                Ok((series_id, Err(e))) => {
                    warn!(series_id = %series_id, error = %e, "Failed to extend series");
                    report.failed.push(FailedSeries {
                        series_id,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(error = %e, "Series extension task panicked");
                    report.panicked += 1;
                }
            }
        }

        report.extended.sort_by(|a, b| a.series_id.cmp(&b.series_id));
        Ok(report)
    }
}

async fn extend(orchestrator: &Orchestrator, series: &BookingSeries) -> BookingResult<Extended> {
    let outcome = orchestrator.materialize_next(series).await?;
    let index = outcome.booking.series.as_ref().map(|s| s.index).unwrap_or_default();
    Ok(Extended {
        series_id: series.id.clone(),
        booking_id: outcome.booking.id,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::SeriesStatus;
    use crate::store::Store;
    use crate::testing::{Harness, local, new_series, series_fixture};
    use chrono::Duration;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_extends_each_active_series_by_one() {
        let h = Harness::new();
        let series = h
            .orchestrator
            .create_series(new_series("owner-1"))
            .await
            .unwrap()
            .series;
        let scheduler = SeriesExtensionScheduler::new(h.orchestrator.clone(), 2);

        for _ in 0..5 {
            let report = scheduler.run_once().await.unwrap();
            assert_eq!(report.extended.len(), 1);
            assert!(report.failed.is_empty());
        }

        assert_eq!(h.store.max_occurrence_index(&series.id).await.unwrap(), Some(5));
        let report = scheduler.run_once().await.unwrap();
        let extended = &report.extended[0];
        assert_eq!(extended.index, 6);

        let booking = h.store.get_booking(&extended.booking_id).await.unwrap().unwrap();
        let expected = local("2025-03-17 10:00") + Duration::weeks(6);
        let rule = series.rule().unwrap();
        assert_eq!(rule.occurrence_at(6).start_local, expected);
        assert_eq!(booking.start, rule.occurrence_at(6).start_utc);
    }

    #[tokio::test]
    async fn test_broken_series_does_not_stop_others() {
        let h = Harness::new();
        let mut broken = series_fixture("owner-1");
        broken.timezone = "Mars/Olympus_Mons".to_string();
        h.store.insert_series(&broken).await.unwrap();

        let healthy = h
            .orchestrator
            .create_series(new_series("owner-2"))
            .await
            .unwrap()
            .series;

        let report = SeriesExtensionScheduler::new(h.orchestrator.clone(), 4)
            .run_once()
            .await
            .unwrap();
        assert_eq!(report.extended.len(), 1);
        assert_eq!(report.extended[0].series_id, healthy.id);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].series_id, broken.id);
        assert_eq!(report.panicked, 0);
    }

    #[tokio::test]
    async fn test_inactive_series_are_skipped() {
        let h = Harness::new();
        let series = h
            .orchestrator
            .create_series(new_series("owner-1"))
            .await
            .unwrap()
            .series;
        h.orchestrator
            .set_series_status(&series.id, "owner-1", SeriesStatus::Paused)
            .await
            .unwrap();

        let report = SeriesExtensionScheduler::new(h.orchestrator.clone(), 1)
            .run_once()
            .await
            .unwrap();
        assert!(report.extended.is_empty());
        assert_eq!(h.store.max_occurrence_index(&series.id).await.unwrap(), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_never_double_book() {
        let h = Harness::new();
        let mut ids = Vec::new();
        for owner in ["owner-1", "owner-2", "owner-3"] {
            ids.push(
                h.orchestrator
                    .create_series(new_series(owner))
                    .await
                    .unwrap()
                    .series
                    .id,
            );
        }

        let a = SeriesExtensionScheduler::new(h.orchestrator.clone(), 2);
        let b = SeriesExtensionScheduler::new(h.orchestrator.clone(), 2);
        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(
            ra.extended.len() + ra.failed.len() + rb.extended.len() + rb.failed.len(),
            6
        );

        let mut seen = HashSet::new();
        for extended in ra.extended.iter().chain(rb.extended.iter()) {
            assert!(
                seen.insert((extended.series_id.clone(), extended.index)),
                "occurrence {} of {} booked twice",
                extended.index,
                extended.series_id
            );
        }
        for id in &ids {
            let max = h.store.max_occurrence_index(id).await.unwrap().unwrap();
            assert!((1..=2).contains(&max));
        }
    }
}
