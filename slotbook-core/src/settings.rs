//! Service configuration at ~/.config/slotbook/config.toml.
//!
//! Every key can be overridden from the environment with a `SLOTBOOK__`
//! prefix and `__` between sections, e.g. `SLOTBOOK__SERVER__LISTEN`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};

use crate::error::{BookingError, BookingResult};
use crate::orchestrator::OrchestratorOptions;
use crate::provider::{Provider, ProviderConfig};
use crate::scheduler::DEFAULT_MAX_CONCURRENT;

static DEFAULT_LISTEN: &str = "127.0.0.1:4180";
static DEFAULT_DATABASE_URL: &str = "~/.local/share/slotbook/slotbook.db";

/// A duration written the human way: `48h`, `15m`, `1m 30s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub StdDuration);

impl FromStr for HumanDuration {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        humantime::parse_duration(s.trim())
            .map(HumanDuration)
            .map_err(|e| BookingError::Config(format!("invalid duration '{}': {}", s, e)))
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl HumanDuration {
    fn minutes(n: u64) -> Self {
        HumanDuration(StdDuration::from_secs(n * 60))
    }

    fn hours(n: u64) -> Self {
        HumanDuration(StdDuration::from_secs(n * 3600))
    }

    pub fn to_chrono(self) -> BookingResult<chrono::Duration> {
        chrono::Duration::from_std(self.0)
            .map_err(|e| BookingError::Config(format!("duration out of range: {}", e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

impl DatabaseSettings {
    /// The sqlx connection URL. Bare paths may start with `~`.
    pub fn connect_url(&self) -> String {
        if self.url.starts_with("sqlite:") {
            return self.url.clone();
        }
        format!("sqlite://{}", self.file_path().display())
    }

    /// The database file, when `url` names one.
    pub fn file_path(&self) -> PathBuf {
        let path = self.url.strip_prefix("sqlite://").unwrap_or(&self.url);
        PathBuf::from(shellexpand::tilde(path).into_owned())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentSettings {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(flatten)]
    pub provider: ProviderConfig,
}

fn default_currency() -> String {
    "EUR".to_string()
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            provider: ProviderConfig::new(Provider::from_name("stripe")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent_series: usize,
    pub bill_batch_size: usize,
    pub claim_stale_after: HumanDuration,
    pub bill_lead_time: HumanDuration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_series: DEFAULT_MAX_CONCURRENT,
            bill_batch_size: 50,
            claim_stale_after: HumanDuration::minutes(15),
            bill_lead_time: HumanDuration::hours(48),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RescheduleSettings {
    pub instance_tolerance: HumanDuration,
    pub instance_search_window: HumanDuration,
}

impl Default for RescheduleSettings {
    fn default() -> Self {
        Self {
            instance_tolerance: HumanDuration::minutes(1),
            instance_search_window: HumanDuration::hours(12),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// An `EnvFilter` directive such as `info` or `slotbook=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default = "default_calendar")]
    pub calendar: ProviderConfig,
    #[serde(default)]
    pub payments: PaymentSettings,
    #[serde(default = "default_notifications")]
    pub notifications: ProviderConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub reschedule: RescheduleSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_calendar() -> ProviderConfig {
    ProviderConfig::new(Provider::from_name("google"))
}

fn default_notifications() -> ProviderConfig {
    ProviderConfig::new(Provider::from_name("email"))
}

impl Settings {
    pub fn config_path() -> BookingResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| BookingError::Config("Could not determine config directory".into()))?
            .join("slotbook");

        Ok(config_dir.join("config.toml"))
    }

    /// Load from `path` (default location when `None`) plus environment
    /// overrides. A missing default file is created with every option
    /// commented out.
    pub fn load(path: Option<&Path>) -> BookingResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::config_path()?;
                if !path.exists() {
                    Self::create_default_config(&path)?;
                }
                path
            }
        };

        Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("SLOTBOOK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BookingError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| BookingError::Config(e.to_string()))
    }

    /// Parse settings from TOML text, without environment overrides.
    pub fn from_toml(contents: &str) -> BookingResult<Self> {
        Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()
            .map_err(|e| BookingError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| BookingError::Config(e.to_string()))
    }

    pub fn orchestrator_options(&self) -> BookingResult<OrchestratorOptions> {
        Ok(OrchestratorOptions {
            instance_tolerance: self.reschedule.instance_tolerance.to_chrono()?,
            instance_search_window: self.reschedule.instance_search_window.to_chrono()?,
            bill_lead_time: self.scheduler.bill_lead_time.to_chrono()?,
            bill_batch_size: self.scheduler.bill_batch_size,
            claim_stale_after: self.scheduler.claim_stale_after.to_chrono()?,
            ..OrchestratorOptions::default()
        })
    }

    pub fn create_default_config(path: &Path) -> BookingResult<()> {
        let contents = format!(
            "\
# slotbook configuration

# [server]
# listen = \"{listen}\"

# [database]
# url = \"{database}\"

# [calendar]
# provider = \"google\"

# [payments]
# provider = \"stripe\"
# currency = \"EUR\"

# [notifications]
# provider = \"email\"

# [scheduler]
# max_concurrent_series = {concurrent}
# bill_batch_size = 50
# claim_stale_after = \"15m\"
# bill_lead_time = \"48h\"

# [reschedule]
# instance_tolerance = \"1m\"
# instance_search_window = \"12h\"

# [logging]
# level = \"info\"
# format = \"pretty\"
",
            listen = DEFAULT_LISTEN,
            database = DEFAULT_DATABASE_URL,
            concurrent = DEFAULT_MAX_CONCURRENT,
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BookingError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| BookingError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            calendar: default_calendar(),
            payments: PaymentSettings::default(),
            notifications: default_notifications(),
            scheduler: SchedulerSettings::default(),
            reschedule: RescheduleSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
