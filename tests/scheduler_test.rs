mod common;

use chrono::{Duration, NaiveTime};
use common::*;
use itinerary_notify::clock::Clock;
use itinerary_notify::db;
use itinerary_notify::model::Preferences;
use itinerary_notify::notifier::Notifier;
use itinerary_notify::scheduler::{ScanReport, Scheduler, SchedulerSettings};
use itinerary_notify::timezone::MorningWindow;
use sqlx::SqlitePool;
use std::sync::Arc;

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        morning_window: MorningWindow::new(
            NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        ),
        ..SchedulerSettings::default()
    }
}

fn scheduler(pool: &SqlitePool, notifier: Notifier, clock: Arc<dyn Clock>) -> Scheduler {
    Scheduler::new(pool.clone(), notifier, clock, settings())
}

async fn event_ids(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar(
        "SELECT json_extract(data, '$.eventId') FROM notifications \
         WHERE kind = 'event_reminder' ORDER BY 1",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn single_event_reminder_fires_once() {
    let pool = setup_pool().await;
    let now = at(2026, 3, 1, 10, 0);
    let clock = fixed_clock(now);
    let (notifier, sender) = inline_notifier(&pool, clock.clone());
    let s = scheduler(&pool, notifier, clock);

    seed_group(&pool, "g1", "UTC").await;
    seed_member(&pool, "g1", "m", "going").await;
    db::insert_event(
        &pool,
        "e1",
        "g1",
        "Castle tour",
        Some("Sao Jorge"),
        now + Duration::minutes(60),
        false,
    )
    .await
    .unwrap();

    let first = s.process_event_reminders().await.unwrap();
    assert_eq!(
        first,
        ScanReport {
            candidates: 1,
            claimed: 1,
            created: 1,
            ..ScanReport::default()
        }
    );
    let rows = notifications(&pool).await;
    assert_eq!(rows.len(), 1);
    let (user, kind, title, body, data) = &rows[0];
    assert_eq!(user, "m");
    assert_eq!(kind, "event_reminder");
    assert_eq!(title, "Trip g1");
    assert_eq!(body, "Castle tour starts in 1 hour at Sao Jorge");
    let data: serde_json::Value = serde_json::from_str(data.as_deref().unwrap()).unwrap();
    assert_eq!(data["eventId"], "e1");

    let sent = sender.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].phone_number, "+1555m");
    assert_eq!(sent[0].message, "Trip g1: Castle tour starts in 1 hour at Sao Jorge");

    let second = s.process_event_reminders().await.unwrap();
    assert_eq!(second.candidates, 1);
    assert_eq!(second.claimed, 0);
    assert_eq!(second.created, 0);
    assert_eq!(notification_count(&pool).await, 1);
    assert_eq!(ledger_count(&pool).await, 1);
    assert_eq!(sender.sent().await.len(), 1);
}

#[tokio::test]
async fn look_ahead_band_is_inclusive() {
    let pool = setup_pool().await;
    let now = at(2026, 3, 1, 10, 0);
    let clock = fixed_clock(now);
    let (notifier, _sender) = inline_notifier(&pool, clock.clone());
    let s = scheduler(&pool, notifier, clock);

    seed_group(&pool, "g1", "UTC").await;
    seed_member(&pool, "g1", "m", "going").await;
    for minutes in [54, 55, 65, 66] {
        let id = format!("e{minutes}");
        seed_event(&pool, &id, "g1", "Walk", now + Duration::minutes(minutes)).await;
    }

    let report = s.process_event_reminders().await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(event_ids(&pool).await, vec!["e55", "e65"]);
}

#[tokio::test]
async fn deleted_all_day_and_cancelled_events_are_ignored() {
    let pool = setup_pool().await;
    let now = at(2026, 3, 1, 10, 0);
    let clock = fixed_clock(now);
    let (notifier, _sender) = inline_notifier(&pool, clock.clone());
    let s = scheduler(&pool, notifier, clock);
    let start = now + Duration::minutes(60);

    seed_group(&pool, "g1", "UTC").await;
    seed_group(&pool, "g2", "UTC").await;
    seed_member(&pool, "g1", "m", "going").await;
    seed_member(&pool, "g2", "m", "going").await;
    seed_event(&pool, "deleted", "g1", "Gone", start).await;
    db::insert_event(&pool, "allday", "g1", "Beach day", None, start, true)
        .await
        .unwrap();
    seed_event(&pool, "cancelled", "g2", "Ferry", start).await;
    sqlx::query("UPDATE events SET deleted_at = CURRENT_TIMESTAMP WHERE id = 'deleted'")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE trip_groups SET cancelled = 1 WHERE id = 'g2'")
        .execute(&pool)
        .await
        .unwrap();

    let report = s.process_event_reminders().await.unwrap();
    assert_eq!(report.candidates, 0);
    assert_eq!(notification_count(&pool).await, 0);
}

#[tokio::test]
async fn attendance_and_preferences_filter_per_kind() {
    let pool = setup_pool().await;
    let now = at(2026, 3, 1, 8, 0);
    let clock = fixed_clock(now);
    let (notifier, _sender) = inline_notifier(&pool, clock.clone());
    let s = scheduler(&pool, notifier, clock);

    seed_group(&pool, "g1", "UTC").await;
    for (user, status) in [
        ("a", "going"),
        ("b", "maybe"),
        ("c", "not_going"),
        ("d", "no_response"),
        ("e", "going"),
        ("f", "going"),
    ] {
        seed_member(&pool, "g1", user, status).await;
    }
    let no_events = Preferences {
        event_reminders: false,
        ..Preferences::default()
    };
    let no_digest = Preferences {
        daily_itinerary: false,
        ..Preferences::default()
    };
    db::upsert_preferences(&pool, "e", "g1", no_events, now).await.unwrap();
    db::upsert_preferences(&pool, "f", "g1", no_digest, now).await.unwrap();
    seed_event(&pool, "e1", "g1", "Breakfast", now + Duration::minutes(60)).await;

    s.process_event_reminders().await.unwrap();
    s.process_daily_itineraries().await.unwrap();

    assert_eq!(recipients_of(&pool, "event_reminder").await, vec!["a", "f"]);
    assert_eq!(recipients_of(&pool, "daily_itinerary").await, vec!["a", "e"]);
}

#[tokio::test]
async fn digest_follows_each_group_timezone() {
    let pool = setup_pool().await;
    let clock = fixed_clock(at(2026, 3, 1, 8, 0));
    let (notifier, _sender) = inline_notifier(&pool, clock.clone());
    let s = scheduler(&pool, notifier, clock.clone());

    seed_group(&pool, "london", "UTC").await;
    seed_group(&pool, "tokyo", "Asia/Tokyo").await;
    seed_member(&pool, "london", "u1", "going").await;
    seed_member(&pool, "tokyo", "t1", "going").await;

    // 08:00 UTC is 17:00 in Tokyo.
    let report = s.process_daily_itineraries().await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(recipients_of(&pool, "daily_itinerary").await, vec!["u1"]);

    // 23:00 UTC is 08:00 the next morning in Tokyo.
    clock.set(at(2026, 2, 28, 23, 0));
    let report = s.process_daily_itineraries().await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.created, 1);
    assert_eq!(recipients_of(&pool, "daily_itinerary").await, vec!["t1", "u1"]);
}

#[tokio::test]
async fn digest_lists_todays_events_in_local_order() {
    let pool = setup_pool().await;
    // 13:00 UTC is 08:00 EST on 2026-03-01.
    let now = at(2026, 3, 1, 13, 0);
    let clock = fixed_clock(now);
    let (notifier, _sender) = inline_notifier(&pool, clock.clone());
    let s = scheduler(&pool, notifier, clock.clone());

    seed_group(&pool, "nyc", "America/New_York").await;
    seed_member(&pool, "nyc", "m", "going").await;
    seed_event(&pool, "lunch", "nyc", "Lunch", at(2026, 3, 1, 17, 0)).await;
    seed_event(&pool, "museum", "nyc", "Museum", at(2026, 3, 1, 14, 0)).await;
    // 20:00 local the previous evening: within 24h of now but not today.
    seed_event(&pool, "yesterday", "nyc", "Jazz club", at(2026, 3, 1, 1, 0)).await;
    db::insert_event(&pool, "allday", "nyc", "Free day", None, at(2026, 3, 1, 15, 0), true)
        .await
        .unwrap();

    let report = s.process_daily_itineraries().await.unwrap();
    assert_eq!(report.created, 1);
    let rows = notifications(&pool).await;
    let (_, kind, title, body, data) = &rows[0];
    assert_eq!(kind, "daily_itinerary");
    assert_eq!(title, "Trip nyc - Today's Schedule");
    assert_eq!(body, "1. 9:00 AM - Museum\n2. 12:00 PM - Lunch");
    let data: serde_json::Value = serde_json::from_str(data.as_deref().unwrap()).unwrap();
    assert_eq!(data["referenceId"], "nyc:2026-03-01");
    assert_eq!(data["groupId"], "nyc");

    // Later scans on the same local day fire nothing new.
    s.process_daily_itineraries().await.unwrap();
    clock.advance(Duration::minutes(45));
    let report = s.process_daily_itineraries().await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.created, 0);
    assert_eq!(notification_count(&pool).await, 1);
}

#[tokio::test]
async fn empty_day_and_misconfigured_groups() {
    let pool = setup_pool().await;
    let clock = fixed_clock(at(2026, 3, 1, 8, 0));
    let (notifier, _sender) = inline_notifier(&pool, clock.clone());
    let s = scheduler(&pool, notifier, clock);

    seed_group(&pool, "ok", "UTC").await;
    seed_group(&pool, "bad-tz", "Mars/Olympus_Mons").await;
    seed_group_dates(&pool, "no-dates", "UTC", None, Some("2026-12-31")).await;
    seed_group_dates(&pool, "over", "UTC", Some("2026-01-01"), Some("2026-02-28")).await;
    for group in ["ok", "bad-tz", "no-dates", "over"] {
        seed_member(&pool, group, &format!("{group}-m"), "going").await;
    }

    let report = s.process_daily_itineraries().await.unwrap();
    assert_eq!(report.candidates, 1);
    let rows = notifications(&pool).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "ok-m");
    assert_eq!(rows[0].3, "No events scheduled for today.");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_scans_never_double_notify() {
    let (_dir, pool) = file_pool().await;
    let now = at(2026, 3, 1, 10, 0);
    let clock = fixed_clock(now);
    let (notifier, _sender) = inline_notifier(&pool, clock.clone());
    let s = Arc::new(scheduler(&pool, notifier, clock));

    seed_group(&pool, "g1", "UTC").await;
    for i in 0..5 {
        seed_member(&pool, "g1", &format!("m{i}"), "going").await;
    }
    seed_event(&pool, "e1", "g1", "Boat", now + Duration::minutes(60)).await;

    let (a, b) = tokio::join!(
        {
            let s = s.clone();
            async move { s.process_event_reminders().await }
        },
        {
            let s = s.clone();
            async move { s.process_event_reminders().await }
        }
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.claimed + b.claimed, 5);

    let again = s.process_event_reminders().await.unwrap();
    assert_eq!(again.claimed, 0);
    assert_eq!(notification_count(&pool).await, 5);
    assert_eq!(ledger_count(&pool).await, 5);
}

#[tokio::test]
async fn start_and_stop_control_the_timers() {
    let (_dir, pool) = file_pool().await;
    let now = at(2026, 3, 1, 10, 0);
    let clock = fixed_clock(now);
    let (notifier, _sender) = inline_notifier(&pool, clock.clone());
    let s = scheduler(&pool, notifier, clock);

    seed_group(&pool, "g1", "UTC").await;
    seed_member(&pool, "g1", "m", "going").await;
    seed_event(&pool, "e1", "g1", "Boat", now + Duration::minutes(60)).await;

    // Stopping a scheduler that never started is harmless.
    s.stop().await;
    assert!(!s.is_running());

    s.start();
    s.start();
    assert!(s.is_running());

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while notification_count(&pool).await < 1 {
        assert!(tokio::time::Instant::now() < deadline, "first tick never ran");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    s.stop().await;
    assert!(!s.is_running());
    s.stop().await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(notification_count(&pool).await, 1);
}
