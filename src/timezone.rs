//! Local wall-clock helpers for per-group timezones.
//!
//! Pure functions over `(timezone, instant)`; offsets come from the IANA
//! database via `chrono-tz`, so half- and quarter-hour zones work.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::model::NotifyError;

/// Local time-of-day band, inclusive on both ends at minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MorningWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl MorningWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, local: NaiveTime) -> bool {
        let minute = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0).unwrap_or(local);
        self.start <= minute && minute <= self.end
    }

    /// Width of the band in whole seconds (end minute included).
    pub fn width_secs(&self) -> i64 {
        (self.end - self.start).num_seconds() + 60
    }
}

impl Default for MorningWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(7, 45, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(8, 15, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, NotifyError> {
    name.parse::<Tz>()
        .map_err(|_| NotifyError::UnknownTimezone(name.to_string()))
}

pub fn is_in_morning_window(
    timezone: &str,
    now: DateTime<Utc>,
    window: &MorningWindow,
) -> Result<bool, NotifyError> {
    Ok(in_morning_window(parse_timezone(timezone)?, now, window))
}

/// [`is_in_morning_window`] for an already parsed zone.
pub fn in_morning_window(tz: Tz, now: DateTime<Utc>, window: &MorningWindow) -> bool {
    window.contains(now.with_timezone(&tz).time())
}

/// Calendar date of `now` in `timezone`, formatted `YYYY-MM-DD`.
pub fn local_date_key(timezone: &str, now: DateTime<Utc>) -> Result<String, NotifyError> {
    Ok(date_key(parse_timezone(timezone)?, now))
}

/// [`local_date_key`] for an already parsed zone.
pub fn date_key(tz: Tz, now: DateTime<Utc>) -> String {
    now.with_timezone(&tz).date_naive().format("%Y-%m-%d").to_string()
}

/// `h:mm AM` rendering of an instant in `tz`.
pub fn local_clock_label(tz: Tz, instant: DateTime<Utc>) -> String {
    instant.with_timezone(&tz).format("%-I:%M %p").to_string()
}
