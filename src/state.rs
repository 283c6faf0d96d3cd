use std::sync::Arc;

use anyhow::{Context, Result};
use slotbook_core::calendar::ProviderCalendar;
use slotbook_core::notify::ProviderNotifier;
use slotbook_core::orchestrator::Orchestrator;
use slotbook_core::payment::ProviderPayments;
use slotbook_core::scheduler::SeriesExtensionScheduler;
use slotbook_core::settings::Settings;
use slotbook_core::store::SqliteStore;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    /// Currency of prices given without one.
    currency: String,
    max_concurrent_series: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, currency: &str, max_concurrent_series: usize) -> Self {
        AppState {
            orchestrator,
            currency: currency.to_uppercase(),
            max_concurrent_series,
        }
    }

    /// Open the database and wire the provider-backed adapters.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        if !settings.database.url.starts_with("sqlite:") {
            if let Some(parent) = settings.database.file_path().parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Could not create {}", parent.display()))?;
            }
        }

        let url = settings.database.connect_url();
        let store = SqliteStore::connect(&url)
            .await
            .with_context(|| format!("Could not open database {}", url))?;
        info!(database = %url, "Database ready");

        let orchestrator = Orchestrator::new(
            Arc::new(store),
            Arc::new(ProviderCalendar::new(settings.calendar.clone())),
            Arc::new(ProviderPayments::new(settings.payments.provider.clone())),
            Arc::new(ProviderNotifier::new(settings.notifications.clone())),
            settings.orchestrator_options()?,
        );

        Ok(Self::new(
            Arc::new(orchestrator),
            &settings.payments.currency,
            settings.scheduler.max_concurrent_series,
        ))
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn scheduler(&self) -> SeriesExtensionScheduler {
        SeriesExtensionScheduler::new(self.orchestrator.clone(), self.max_concurrent_series)
    }
}
