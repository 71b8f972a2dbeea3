//! Row models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

/// Group slice used by the daily itinerary scan.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub timezone: String,
}

impl GroupRow {
    /// Whether `date_key` (`YYYY-MM-DD`) lies inside the group's date range.
    /// Groups without both dates are never active.
    pub fn is_active_on(&self, date_key: &str) -> bool {
        match (self.start_date.as_deref(), self.end_date.as_deref()) {
            (Some(start), Some(end)) => start <= date_key && date_key <= end,
            _ => false,
        }
    }
}

/// Event slice used by both reminder scans.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub group_id: String,
    pub group_name: String,
    pub name: String,
    pub location: Option<String>,
    pub start_time: DateTime<Utc>,
}

/// A confirmed member and the number the external sender should use.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MemberContact {
    pub user_id: String,
    pub phone_number: String,
}

/// Raw notification row; decoded into `crate::model::Notification`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub group_id: Option<String>,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: Option<String>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
