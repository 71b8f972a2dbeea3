use super::model::{EventRow, GroupRow, MemberContact, NotificationRow};
use crate::model::{
    Notification, NotificationContent, NotificationKind, NotifyError, Preferences, ReminderKind,
    RsvpStatus,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        // WAL plus full sync: ledger claims must survive a crash.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Collaborator writes. The engine never calls these itself; they exist for the
// surrounding application and for seeding tests.
// ---------------------------------------------------------------------------

pub async fn insert_user(pool: &Pool, id: &str, display_name: &str, phone_number: &str) -> Result<()> {
    sqlx::query("INSERT INTO users (id, display_name, phone_number) VALUES (?, ?, ?)")
        .bind(id)
        .bind(display_name)
        .bind(phone_number)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_group(
    pool: &Pool,
    id: &str,
    name: &str,
    timezone: &str,
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO trip_groups (id, name, timezone, start_date, end_date) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(name)
    .bind(timezone)
    .bind(start_date)
    .bind(end_date)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_member(pool: &Pool, group_id: &str, user_id: &str, status: RsvpStatus) -> Result<()> {
    sqlx::query(
        "INSERT INTO members (group_id, user_id, status) VALUES (?, ?, ?) \
         ON CONFLICT(group_id, user_id) DO UPDATE SET status = excluded.status",
    )
    .bind(group_id)
    .bind(user_id)
    .bind(status.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_event(
    pool: &Pool,
    id: &str,
    group_id: &str,
    name: &str,
    location: Option<&str>,
    start_time: DateTime<Utc>,
    all_day: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO events (id, group_id, name, location, start_time, all_day) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(group_id)
    .bind(name)
    .bind(location)
    .bind(start_time)
    .bind(all_day)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Collaborator reads used by the candidate selector and fan-out.
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn list_active_groups(pool: &Pool) -> Result<Vec<GroupRow>> {
    let rows = sqlx::query_as::<_, GroupRow>(
        "SELECT id, name, start_date, end_date, timezone FROM trip_groups \
         WHERE cancelled = 0 AND deleted_at IS NULL ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Non-deleted, timed events of live groups starting in `[from, to]`.
#[instrument(skip_all)]
pub async fn list_events_starting_between(
    pool: &Pool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<EventRow>> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT e.id, e.group_id, g.name AS group_name, e.name, e.location, e.start_time \
         FROM events e JOIN trip_groups g ON g.id = e.group_id \
         WHERE julianday(e.start_time) >= julianday(?) AND julianday(e.start_time) <= julianday(?) \
           AND e.deleted_at IS NULL AND e.all_day = 0 \
           AND g.cancelled = 0 AND g.deleted_at IS NULL \
         ORDER BY julianday(e.start_time), e.id",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Non-deleted, timed events of one group starting in `[from, to]`, by start time.
#[instrument(skip_all)]
pub async fn list_group_events_between(
    pool: &Pool,
    group_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<EventRow>> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT e.id, e.group_id, g.name AS group_name, e.name, e.location, e.start_time \
         FROM events e JOIN trip_groups g ON g.id = e.group_id \
         WHERE e.group_id = ? \
           AND julianday(e.start_time) >= julianday(?) AND julianday(e.start_time) <= julianday(?) \
           AND e.deleted_at IS NULL AND e.all_day = 0 \
         ORDER BY julianday(e.start_time), e.id",
    )
    .bind(group_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Confirmed ("going"), non-removed members of a live group.
#[instrument(skip_all)]
pub async fn list_confirmed_members(pool: &Pool, group_id: &str) -> Result<Vec<MemberContact>> {
    let rows = sqlx::query_as::<_, MemberContact>(
        "SELECT m.user_id, u.phone_number \
         FROM members m \
         JOIN users u ON u.id = m.user_id \
         JOIN trip_groups g ON g.id = m.group_id \
         WHERE m.group_id = ? AND m.status = ? AND m.deleted_at IS NULL \
           AND g.cancelled = 0 AND g.deleted_at IS NULL \
         ORDER BY m.id",
    )
    .bind(group_id)
    .bind(RsvpStatus::Going.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Confirmed members who have not switched off `kind` for this group.
/// A missing preference row counts as enabled.
#[instrument(skip_all)]
pub async fn list_reminder_recipients(
    pool: &Pool,
    group_id: &str,
    kind: ReminderKind,
) -> Result<Vec<String>> {
    let column = match kind {
        ReminderKind::EventReminder => "event_reminders",
        ReminderKind::DailyItinerary => "daily_itinerary",
    };
    let sql = format!(
        "SELECT m.user_id \
         FROM members m \
         JOIN users u ON u.id = m.user_id \
         LEFT JOIN notification_preferences p ON p.user_id = m.user_id AND p.group_id = m.group_id \
         WHERE m.group_id = ? AND m.status = ? AND m.deleted_at IS NULL \
           AND COALESCE(p.{column}, 1) = 1 \
         ORDER BY m.id"
    );
    let rows: Vec<String> = sqlx::query_scalar(&sql)
        .bind(group_id)
        .bind(RsvpStatus::Going.as_str())
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct PreferencesRow {
    user_id: String,
    event_reminders: bool,
    daily_itinerary: bool,
    group_messages: bool,
}

impl From<&PreferencesRow> for Preferences {
    fn from(row: &PreferencesRow) -> Self {
        Preferences {
            event_reminders: row.event_reminders,
            daily_itinerary: row.daily_itinerary,
            group_messages: row.group_messages,
        }
    }
}

#[instrument(skip_all)]
pub async fn get_preferences(pool: &Pool, user_id: &str, group_id: &str) -> Result<Preferences> {
    let row = sqlx::query_as::<_, PreferencesRow>(
        "SELECT user_id, event_reminders, daily_itinerary, group_messages \
         FROM notification_preferences WHERE user_id = ? AND group_id = ?",
    )
    .bind(user_id)
    .bind(group_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(Preferences::from).unwrap_or_default())
}

#[instrument(skip_all)]
pub async fn get_user_contact(pool: &Pool, user_id: &str) -> Result<Option<MemberContact>> {
    let row = sqlx::query_as::<_, MemberContact>(
        "SELECT id AS user_id, phone_number FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Stored preferences for every member of a group that has a row.
#[instrument(skip_all)]
pub async fn list_group_preferences(pool: &Pool, group_id: &str) -> Result<HashMap<String, Preferences>> {
    let rows = sqlx::query_as::<_, PreferencesRow>(
        "SELECT user_id, event_reminders, daily_itinerary, group_messages \
         FROM notification_preferences WHERE group_id = ?",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.user_id.clone(), Preferences::from(row)))
        .collect())
}

#[instrument(skip_all)]
pub async fn upsert_preferences(
    pool: &Pool,
    user_id: &str,
    group_id: &str,
    prefs: Preferences,
    now: DateTime<Utc>,
) -> Result<Preferences> {
    sqlx::query(
        "INSERT INTO notification_preferences \
           (user_id, group_id, event_reminders, daily_itinerary, group_messages, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(user_id, group_id) DO UPDATE SET \
           event_reminders = excluded.event_reminders, \
           daily_itinerary = excluded.daily_itinerary, \
           group_messages = excluded.group_messages, \
           updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(group_id)
    .bind(prefs.event_reminders)
    .bind(prefs.daily_itinerary)
    .bind(prefs.group_messages)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(prefs)
}

#[instrument(skip_all)]
pub async fn create_default_preferences(pool: &Pool, user_id: &str, group_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO notification_preferences (user_id, group_id) VALUES (?, ?) \
         ON CONFLICT(user_id, group_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(group_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

impl TryFrom<NotificationRow> for Notification {
    type Error = anyhow::Error;

    fn try_from(row: NotificationRow) -> Result<Self> {
        let kind = NotificationKind::parse_kind(&row.kind)
            .ok_or_else(|| NotifyError::UnknownKind(row.kind.clone()))?;
        let data = row
            .data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("notification {} has malformed data", row.id))?;
        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            group_id: row.group_id,
            kind,
            title: row.title,
            body: row.body,
            data,
            read_at: row.read_at,
            created_at: row.created_at,
        })
    }
}

/// Insert one notification on an existing connection or transaction.
#[instrument(skip_all)]
pub async fn insert_notification(
    conn: &mut SqliteConnection,
    user_id: &str,
    group_id: Option<&str>,
    content: &NotificationContent,
    now: DateTime<Utc>,
) -> Result<Notification> {
    let id = Uuid::new_v4().to_string();
    let data = content
        .data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    sqlx::query(
        "INSERT INTO notifications (id, user_id, group_id, kind, title, body, data, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(group_id)
    .bind(content.kind.as_str())
    .bind(&content.title)
    .bind(&content.body)
    .bind(data)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(Notification {
        id,
        user_id: user_id.to_string(),
        group_id: group_id.map(str::to_string),
        kind: content.kind,
        title: content.title.clone(),
        body: content.body.clone(),
        data: content.data.clone(),
        read_at: None,
        created_at: now,
    })
}

#[instrument(skip_all)]
pub async fn list_notifications(
    pool: &Pool,
    user_id: &str,
    group_id: Option<&str>,
    unread_only: bool,
    limit: i64,
    offset: i64,
) -> Result<Vec<Notification>> {
    let rows = sqlx::query_as::<_, NotificationRow>(
        "SELECT id, user_id, group_id, kind, title, body, data, read_at, created_at \
         FROM notifications \
         WHERE user_id = ? AND (? IS NULL OR group_id = ?) AND (? = 0 OR read_at IS NULL) \
         ORDER BY julianday(created_at) DESC, rowid DESC \
         LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(group_id)
    .bind(group_id)
    .bind(unread_only)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Notification::try_from).collect()
}

#[instrument(skip_all)]
pub async fn count_notifications(
    pool: &Pool,
    user_id: &str,
    group_id: Option<&str>,
    unread_only: bool,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM notifications \
         WHERE user_id = ? AND (? IS NULL OR group_id = ?) AND (? = 0 OR read_at IS NULL)",
    )
    .bind(user_id)
    .bind(group_id)
    .bind(group_id)
    .bind(unread_only)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Returns false when no notification with that id belongs to `user_id`.
#[instrument(skip_all)]
pub async fn mark_notification_read(
    pool: &Pool,
    notification_id: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE notifications SET read_at = COALESCE(read_at, ?) WHERE id = ? AND user_id = ?",
    )
    .bind(now)
    .bind(notification_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn mark_all_notifications_read(
    pool: &Pool,
    user_id: &str,
    group_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE notifications SET read_at = ? \
         WHERE user_id = ? AND read_at IS NULL AND (? IS NULL OR group_id = ?)",
    )
    .bind(now)
    .bind(user_id)
    .bind(group_id)
    .bind(group_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
