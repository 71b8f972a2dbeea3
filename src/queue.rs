//! Durable job queue on top of the `batch_jobs` table.
//!
//! Delivery is at-least-once: a job stays in the table until a worker deletes
//! it, and a failed job is pushed back with exponential backoff. A job may carry
//! an idempotency key; a second `send` with a key still in the queue is dropped.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::db::Pool;

/// Queue carrying notification fan-out jobs.
pub const NOTIFICATION_BATCH: &str = "notification-batch";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub idempotency_key: Option<String>,
    /// Jobs not picked up within this span are discarded.
    pub expire_after: Option<Duration>,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Enqueue `payload`. Returns the job id, or `None` when a live job already
    /// holds the same idempotency key.
    async fn send(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<i64>>;

    /// Same as [`QueueClient::send`] but on a caller-owned connection or
    /// transaction, so the job commits together with the claims it carries.
    async fn send_in(
        &self,
        conn: &mut SqliteConnection,
        queue: &str,
        payload: &serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<i64>>;
}

#[derive(Clone)]
pub struct SqliteQueue {
    pool: Pool,
    clock: Arc<dyn Clock>,
}

impl SqliteQueue {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl QueueClient for SqliteQueue {
    async fn send(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        self.send_in(&mut conn, queue, payload, options).await
    }

    #[instrument(skip_all)]
    async fn send_in(
        &self,
        conn: &mut SqliteConnection,
        queue: &str,
        payload: &serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<i64>> {
        let now = self.clock.now();
        let expire_at = options.expire_after.map(|d| now + d);
        let row = sqlx::query(
            "INSERT INTO batch_jobs (queue, payload, idempotency_key, attempt, due_at, expire_at, created_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?) \
             ON CONFLICT(idempotency_key) DO NOTHING \
             RETURNING id",
        )
        .bind(queue)
        .bind(serde_json::to_string(payload)?)
        .bind(options.idempotency_key.as_deref())
        .bind(now)
        .bind(expire_at)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        let id = row.map(|r| r.get::<i64, _>("id"));
        if id.is_none() {
            debug!(queue, key = ?options.idempotency_key, "duplicate job dropped");
        }
        Ok(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: i64,
    pub payload: String,
    pub attempt: i32,
    pub expire_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at < now)
    }
}

/// Oldest job on `queue` whose due time has passed.
#[instrument(skip_all)]
pub async fn next_due(pool: &Pool, queue: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
    let row = sqlx::query(
        "SELECT id, payload, attempt, expire_at FROM batch_jobs \
         WHERE queue = ? AND julianday(due_at) <= julianday(?) \
         ORDER BY julianday(due_at) ASC, id ASC LIMIT 1",
    )
    .bind(queue)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| QueuedJob {
        id: row.get("id"),
        payload: row.get("payload"),
        attempt: row.get("attempt"),
        expire_at: row.get("expire_at"),
    }))
}

/// Remove a job. Returns false if another worker already removed it.
pub async fn delete_job(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM batch_jobs WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Delay for the next attempt: 5s · 2^attempt, capped at `max_cap_secs` when positive.
pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn backoff_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let due_at = now + Duration::seconds(backoff_secs(attempt, max_cap_secs));
    sqlx::query("UPDATE batch_jobs SET attempt = ?, due_at = ? WHERE id = ?")
        .bind(attempt + 1)
        .bind(due_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
