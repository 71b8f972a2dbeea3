//! Candidate selection for the two reminder scans.
//!
//! A candidate pairs a schedulable item (an event, or a group's day) with the
//! recipients currently eligible for it. Nothing here touches the ledger; the
//! scheduler claims each recipient before anything is written.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::db::{self, EventRow, GroupRow, Pool};
use crate::model::{Reminder, ReminderKind};
use crate::timezone::{self, MorningWindow};

/// Band of event start times, relative to "now", that qualify for a reminder:
/// `[now + lead - tolerance, now + lead + tolerance]`, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookAhead {
    pub lead: Duration,
    pub tolerance: Duration,
}

impl LookAhead {
    pub fn new(lead: Duration, tolerance: Duration) -> Self {
        Self { lead, tolerance }
    }

    pub fn lower(&self) -> Duration {
        self.lead - self.tolerance
    }

    pub fn upper(&self) -> Duration {
        self.lead + self.tolerance
    }

    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now + self.lower(), now + self.upper())
    }

    /// Human rendering of the lead time: `1 hour`, `2 hours`, `45 minutes`.
    pub fn lead_label(&self) -> String {
        let minutes = self.lead.num_minutes();
        if minutes > 0 && minutes % 60 == 0 {
            match minutes / 60 {
                1 => "1 hour".to_string(),
                hours => format!("{hours} hours"),
            }
        } else if minutes == 1 {
            "1 minute".to_string()
        } else {
            format!("{minutes} minutes")
        }
    }
}

impl Default for LookAhead {
    fn default() -> Self {
        Self::new(Duration::minutes(60), Duration::minutes(5))
    }
}

#[derive(Debug, Clone)]
pub struct EventCandidate {
    pub event: EventRow,
    pub recipients: Vec<String>,
}

impl EventCandidate {
    pub fn reference_id(&self) -> &str {
        &self.event.id
    }

    pub fn reminder(&self, look_ahead: &LookAhead) -> Reminder {
        let mut body = format!("{} starts in {}", self.event.name, look_ahead.lead_label());
        if let Some(location) = self.event.location.as_deref().filter(|l| !l.is_empty()) {
            body.push_str(" at ");
            body.push_str(location);
        }
        Reminder {
            kind: ReminderKind::EventReminder,
            reference_id: self.event.id.clone(),
            group_id: self.event.group_id.clone(),
            recipients: self.recipients.clone(),
            title: self.event.group_name.clone(),
            body,
            data: Some(json!({
                "eventId": self.event.id,
                "referenceId": self.event.id,
            })),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DigestCandidate {
    pub group: GroupRow,
    pub timezone: Tz,
    /// Local calendar date, `YYYY-MM-DD`.
    pub date_key: String,
    pub recipients: Vec<String>,
    /// Today's timed events, ordered by start.
    pub events: Vec<EventRow>,
}

impl DigestCandidate {
    /// `<groupId>:<localDate>`: one digest per group per local day.
    pub fn reference_id(&self) -> String {
        format!("{}:{}", self.group.id, self.date_key)
    }

    pub fn body(&self) -> String {
        if self.events.is_empty() {
            return "No events scheduled for today.".to_string();
        }
        self.events
            .iter()
            .enumerate()
            .map(|(i, ev)| {
                format!(
                    "{}. {} - {}",
                    i + 1,
                    timezone::local_clock_label(self.timezone, ev.start_time),
                    ev.name
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn reminder(&self) -> Reminder {
        let reference_id = self.reference_id();
        Reminder {
            kind: ReminderKind::DailyItinerary,
            reference_id: reference_id.clone(),
            group_id: self.group.id.clone(),
            recipients: self.recipients.clone(),
            title: format!("{} - Today's Schedule", self.group.name),
            body: self.body(),
            data: Some(json!({
                "groupId": self.group.id,
                "referenceId": reference_id,
            })),
        }
    }
}

/// Events starting inside the look-ahead band, each with the confirmed members
/// that still want event reminders for that group.
#[instrument(skip_all)]
pub async fn find_upcoming_events(
    pool: &Pool,
    now: DateTime<Utc>,
    look_ahead: &LookAhead,
) -> Result<Vec<EventCandidate>> {
    let (from, to) = look_ahead.window(now);
    let events = db::list_events_starting_between(pool, from, to).await?;
    let mut out = Vec::with_capacity(events.len());
    for event in events {
        let recipients =
            db::list_reminder_recipients(pool, &event.group_id, ReminderKind::EventReminder).await?;
        debug!(event_id = %event.id, recipients = recipients.len(), "event reminder candidate");
        out.push(EventCandidate { event, recipients });
    }
    Ok(out)
}

/// Active groups whose local time is inside the morning window, with today's
/// schedule and the members that still want the digest.
///
/// A group with an unrecognised timezone is logged and skipped; the rest of the
/// scan continues.
#[instrument(skip_all)]
pub async fn find_daily_digest_groups(
    pool: &Pool,
    now: DateTime<Utc>,
    window: &MorningWindow,
) -> Result<Vec<DigestCandidate>> {
    let groups = db::list_active_groups(pool).await?;
    let mut out = Vec::new();
    for group in groups {
        let tz = match timezone::parse_timezone(&group.timezone) {
            Ok(tz) => tz,
            Err(err) => {
                warn!(group_id = %group.id, timezone = %group.timezone, %err, "skipping group");
                continue;
            }
        };
        if !timezone::in_morning_window(tz, now, window) {
            continue;
        }
        let date_key = timezone::date_key(tz, now);
        if !group.is_active_on(&date_key) {
            continue;
        }

        let recipients =
            db::list_reminder_recipients(pool, &group.id, ReminderKind::DailyItinerary).await?;

        // Any local day lies within 14h of UTC either side; 36h is a safe superset.
        let span = Duration::hours(36);
        let events = db::list_group_events_between(pool, &group.id, now - span, now + span)
            .await?
            .into_iter()
            .filter(|ev| timezone::date_key(tz, ev.start_time) == date_key)
            .collect();

        out.push(DigestCandidate {
            group,
            timezone: tz,
            date_key,
            recipients,
            events,
        });
    }
    Ok(out)
}
