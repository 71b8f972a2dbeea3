//! Configuration loader and validator for the notification service.
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::candidates::LookAhead;
use crate::timezone::MorningWindow;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub scheduler: Scheduler,
    pub queue: Queue,
    #[serde(default)]
    pub delivery: Delivery,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Periodic scan settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub event_reminder_interval_secs: u64,
    pub daily_itinerary_interval_secs: u64,
    pub reminder_lead_minutes: u32,
    pub reminder_tolerance_minutes: u32,
    /// Local `HH:MM`.
    pub morning_window_start: String,
    /// Local `HH:MM`. The whole end minute is inside the window: `09:00`
    /// still accepts 09:00:59.
    pub morning_window_end: String,
}

/// Batch queue settings. With `enabled: false` fan-out runs inline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// External push transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/notify.db", self.app.data_dir))
    }
}

impl Scheduler {
    pub fn event_reminder_interval(&self) -> Duration {
        Duration::from_secs(self.event_reminder_interval_secs)
    }

    pub fn daily_itinerary_interval(&self) -> Duration {
        Duration::from_secs(self.daily_itinerary_interval_secs)
    }

    pub fn look_ahead(&self) -> LookAhead {
        LookAhead::new(
            chrono::Duration::minutes(i64::from(self.reminder_lead_minutes)),
            chrono::Duration::minutes(i64::from(self.reminder_tolerance_minutes)),
        )
    }

    pub fn morning_window(&self) -> Result<MorningWindow, ConfigError> {
        let start = parse_hm(&self.morning_window_start)
            .ok_or(ConfigError::Invalid("scheduler.morning_window_start must be HH:MM"))?;
        let end = parse_hm(&self.morning_window_end)
            .ok_or(ConfigError::Invalid("scheduler.morning_window_end must be HH:MM"))?;
        Ok(MorningWindow::new(start, end))
    }
}

impl Queue {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_hm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let s = &cfg.scheduler;
    if s.event_reminder_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.event_reminder_interval_secs must be > 0",
        ));
    }
    if s.daily_itinerary_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.daily_itinerary_interval_secs must be > 0",
        ));
    }
    if s.reminder_lead_minutes == 0 || s.reminder_tolerance_minutes >= s.reminder_lead_minutes {
        return Err(ConfigError::Invalid(
            "scheduler.reminder_tolerance_minutes must be smaller than reminder_lead_minutes",
        ));
    }
    // A band narrower than the scan period lets events slip between ticks.
    if u64::from(s.reminder_tolerance_minutes) * 2 * 60 < s.event_reminder_interval_secs {
        return Err(ConfigError::Invalid(
            "scheduler look-ahead band (2 x reminder_tolerance_minutes) must cover event_reminder_interval_secs",
        ));
    }

    let window = s.morning_window()?;
    if window.start >= window.end {
        return Err(ConfigError::Invalid(
            "scheduler.morning_window_start must be before morning_window_end",
        ));
    }
    if window.width_secs() < s.daily_itinerary_interval_secs as i64 {
        return Err(ConfigError::Invalid(
            "scheduler morning window must cover daily_itinerary_interval_secs",
        ));
    }

    if cfg.queue.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("queue.poll_interval_ms must be > 0"));
    }
    // max_backoff_seconds is u64; 0 means uncapped

    if let Some(url) = &cfg.delivery.webhook_url {
        if url.trim().is_empty() {
            return Err(ConfigError::Invalid("delivery.webhook_url must be non-empty when set"));
        }
    }

    Ok(())
}

/// Example configuration with the production defaults.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

scheduler:
  event_reminder_interval_secs: 300
  daily_itinerary_interval_secs: 900
  reminder_lead_minutes: 60
  reminder_tolerance_minutes: 5
  morning_window_start: "07:45"
  morning_window_end: "08:15"

queue:
  enabled: true
  poll_interval_ms: 500
  max_backoff_seconds: 60

delivery:
  webhook_url: null
"#
}
