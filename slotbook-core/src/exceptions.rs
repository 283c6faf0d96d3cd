//! Per-series exclusion dates and standalone overrides.
//!
//! Both collections only ever grow. Each addition is one atomic store
//! operation on a single key, so concurrent additions for different dates or
//! indices all survive.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use crate::booking::BookingSeries;
use crate::error::{BookingError, BookingResult};
use crate::store::Store;

#[derive(Clone)]
pub struct SeriesExceptions {
    store: Arc<dyn Store>,
}

impl SeriesExceptions {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn series(&self, series_id: &str) -> BookingResult<BookingSeries> {
        self.store
            .get_series(series_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("series {}", series_id)))
    }

    /// Exclude `date` from the series. Returns the complete set afterwards.
    pub async fn add_excluded_date(
        &self,
        series_id: &str,
        date: NaiveDate,
    ) -> BookingResult<BTreeSet<NaiveDate>> {
        let dates = self.store.add_excluded_date(series_id, date).await?;
        debug!(series_id, %date, excluded = dates.len(), "Excluded date from series");
        Ok(dates)
    }

    pub async fn excluded_dates(&self, series_id: &str) -> BookingResult<BTreeSet<NaiveDate>> {
        Ok(self.series(series_id).await?.excluded_dates)
    }

    pub async fn record_standalone_override(
        &self,
        series_id: &str,
        index: u32,
        event_id: &str,
    ) -> BookingResult<()> {
        self.store.add_override(series_id, index, event_id).await?;
        debug!(series_id, index, event_id, "Recorded standalone override");
        Ok(())
    }

    pub async fn standalone_override(
        &self,
        series_id: &str,
        index: u32,
    ) -> BookingResult<Option<String>> {
        Ok(self.series(series_id).await?.overrides.get(&index).cloned())
    }
}
