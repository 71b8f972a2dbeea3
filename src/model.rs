use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures callers are expected to tell apart. Travels inside `anyhow::Error`;
/// recover it with `err.downcast_ref::<NotifyError>()`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("unrecognized timezone identifier: {0}")]
    UnknownTimezone(String),
    #[error("notification not found")]
    NotificationNotFound,
    #[error("invalid pagination: {0}")]
    InvalidPagination(&'static str),
    #[error("unknown notification kind: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    EventReminder,
    DailyItinerary,
    GroupMessage,
    GroupUpdate,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::EventReminder => "event_reminder",
            NotificationKind::DailyItinerary => "daily_itinerary",
            NotificationKind::GroupMessage => "group_message",
            NotificationKind::GroupUpdate => "group_update",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "event_reminder" => Some(NotificationKind::EventReminder),
            "daily_itinerary" => Some(NotificationKind::DailyItinerary),
            "group_message" => Some(NotificationKind::GroupMessage),
            "group_update" => Some(NotificationKind::GroupUpdate),
            _ => None,
        }
    }
}

/// The two scheduled notification kinds tracked by the reminder ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    EventReminder,
    DailyItinerary,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        self.notification_kind().as_str()
    }

    pub fn notification_kind(&self) -> NotificationKind {
        match self {
            ReminderKind::EventReminder => NotificationKind::EventReminder,
            ReminderKind::DailyItinerary => NotificationKind::DailyItinerary,
        }
    }

    /// Queue idempotency key for a batch carrying this reminder.
    pub fn idempotency_key(&self, reference_id: &str) -> String {
        match self {
            ReminderKind::EventReminder => format!("event-reminder:{reference_id}"),
            ReminderKind::DailyItinerary => format!("daily-itinerary:{reference_id}"),
        }
    }
}

/// Attendance status of a group member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RsvpStatus {
    Going,
    Maybe,
    NotGoing,
    NoResponse,
}

impl RsvpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RsvpStatus::Going => "going",
            RsvpStatus::Maybe => "maybe",
            RsvpStatus::NotGoing => "not_going",
            RsvpStatus::NoResponse => "no_response",
        }
    }
}

/// Per-(user, group) switches. A missing row means everything is enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preferences {
    pub event_reminders: bool,
    pub daily_itinerary: bool,
    pub group_messages: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            event_reminders: true,
            daily_itinerary: true,
            group_messages: true,
        }
    }
}

impl Preferences {
    /// Whether an external push/SMS should go out for `kind`.
    /// Group updates are always delivered.
    pub fn allows(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::GroupUpdate => true,
            NotificationKind::EventReminder => self.event_reminders,
            NotificationKind::DailyItinerary => self.daily_itinerary,
            NotificationKind::GroupMessage => self.group_messages,
        }
    }
}

/// A user-visible alert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub group_id: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: Option<serde_json::Value>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Content of a notification before it is written for a recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationContent {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Queue message describing one pending fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchJob {
    pub group_id: String,
    #[serde(flatten)]
    pub content: NotificationContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_user_id: Option<String>,
    /// Explicit recipients. When absent the worker resolves the group's
    /// confirmed members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
}

/// Fan-out request for a scheduled reminder whose recipients are already known.
#[derive(Debug, Clone, PartialEq)]
pub struct Reminder {
    pub kind: ReminderKind,
    pub reference_id: String,
    pub group_id: String,
    pub recipients: Vec<String>,
    pub title: String,
    pub body: String,
    pub data: Option<serde_json::Value>,
}

impl Reminder {
    pub fn content(&self) -> NotificationContent {
        NotificationContent {
            kind: self.kind.notification_kind(),
            title: self.title.clone(),
            body: self.body.clone(),
            data: self.data.clone(),
        }
    }
}

/// Prepared payload handed to an external push/SMS transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub user_id: String,
    pub phone_number: String,
    pub message: String,
}
