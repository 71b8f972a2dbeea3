#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use itinerary_notify::clock::{Clock, FixedClock};
use itinerary_notify::model::OutboundMessage;
use itinerary_notify::notifier::Notifier;
use itinerary_notify::sender::Sender;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn setup_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

pub fn fixed_clock(now: DateTime<Utc>) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(now))
}

#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl RecordingSender {
    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Sender for RecordingSender {
    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        self.sent.lock().await.push(msg.clone());
        Ok(())
    }
}

pub fn inline_notifier(pool: &SqlitePool, clock: Arc<FixedClock>) -> (Notifier, RecordingSender) {
    let sender = RecordingSender::default();
    let clock: Arc<dyn Clock> = clock;
    let notifier = Notifier::inline(pool.clone(), clock, Arc::new(sender.clone()));
    (notifier, sender)
}

pub async fn seed_group(pool: &SqlitePool, id: &str, timezone: &str) {
    seed_group_dates(pool, id, timezone, Some("2026-01-01"), Some("2026-12-31")).await;
}

pub async fn seed_group_dates(
    pool: &SqlitePool,
    id: &str,
    timezone: &str,
    start: Option<&str>,
    end: Option<&str>,
) {
    itinerary_notify::db::insert_group(pool, id, &format!("Trip {id}"), timezone, start, end)
        .await
        .unwrap();
}

/// Inserts the user on first use, then (re)sets the membership status.
pub async fn seed_member(pool: &SqlitePool, group_id: &str, user_id: &str, status: &str) {
    sqlx::query("INSERT OR IGNORE INTO users (id, display_name, phone_number) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(user_id)
        .bind(format!("+1555{user_id}"))
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO members (group_id, user_id, status) VALUES (?, ?, ?) \
         ON CONFLICT(group_id, user_id) DO UPDATE SET status = excluded.status",
    )
    .bind(group_id)
    .bind(user_id)
    .bind(status)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn seed_event(
    pool: &SqlitePool,
    id: &str,
    group_id: &str,
    name: &str,
    start: DateTime<Utc>,
) {
    itinerary_notify::db::insert_event(pool, id, group_id, name, None, start, false)
        .await
        .unwrap();
}

pub async fn notification_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
        .fetch_one(pool)
        .await
        .unwrap()
}

/// `(user_id, kind, title, body, data)` for every notification, oldest first.
pub async fn notifications(pool: &SqlitePool) -> Vec<(String, String, String, String, Option<String>)> {
    sqlx::query_as(
        "SELECT user_id, kind, title, body, data FROM notifications ORDER BY rowid",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

pub async fn recipients_of(pool: &SqlitePool, kind: &str) -> Vec<String> {
    sqlx::query_scalar("SELECT user_id FROM notifications WHERE kind = ? ORDER BY user_id")
        .bind(kind)
        .fetch_all(pool)
        .await
        .unwrap()
}

/// File-backed pool for tests that write from several tasks at once.
pub async fn file_pool() -> (tempfile::TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("notify.db").display());
    let pool = itinerary_notify::db::init_pool(&url).await.unwrap();
    itinerary_notify::db::run_migrations(&pool).await.unwrap();
    (dir, pool)
}

pub async fn ledger_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM sent_reminders")
        .fetch_one(pool)
        .await
        .unwrap()
}
