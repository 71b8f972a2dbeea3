//! Reminder ledger: the durable record of which (user, kind, reference)
//! reminders have already fired.
//!
//! A claim is a single `INSERT .. ON CONFLICT DO NOTHING` against the
//! `sent_reminders` unique index, so two overlapping scans can never both win.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::db::Pool;
use crate::model::ReminderKind;

const CLAIM_SQL: &str = "INSERT INTO sent_reminders (user_id, kind, reference_id, fired_at) \
     VALUES (?, ?, ?, ?) \
     ON CONFLICT(user_id, kind, reference_id) DO NOTHING";

/// Returns true if this call recorded the reminder, false if it already existed.
#[instrument(skip_all)]
pub async fn try_claim(
    pool: &Pool,
    user_id: &str,
    kind: ReminderKind,
    reference_id: &str,
    fired_at: DateTime<Utc>,
) -> Result<bool> {
    let mut conn = pool.acquire().await?;
    try_claim_in(&mut conn, user_id, kind, reference_id, fired_at).await
}

/// Same as [`try_claim`] but on a caller-owned connection or transaction, so the
/// claim can commit together with the notification it guards.
pub async fn try_claim_in(
    conn: &mut SqliteConnection,
    user_id: &str,
    kind: ReminderKind,
    reference_id: &str,
    fired_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(CLAIM_SQL)
        .bind(user_id)
        .bind(kind.as_str())
        .bind(reference_id)
        .bind(fired_at)
        .execute(&mut *conn)
        .await?;
    let claimed = result.rows_affected() == 1;
    if !claimed {
        debug!(user_id, kind = kind.as_str(), reference_id, "reminder already claimed");
    }
    Ok(claimed)
}
