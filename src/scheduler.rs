//! Scheduler loop driving the event-reminder and daily-itinerary scans.
//!
//! Each timer tick spawns its scan as a separate task and goes straight back to
//! waiting, so a slow scan never delays the next tick of either timer. Ticks may
//! overlap; the ledger claim keeps overlapping scans from double-notifying.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::candidates::{self, LookAhead};
use crate::clock::Clock;
use crate::config::{self, ConfigError};
use crate::db::Pool;
use crate::notifier::Notifier;
use crate::timezone::MorningWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub event_interval: Duration,
    pub digest_interval: Duration,
    pub look_ahead: LookAhead,
    pub morning_window: MorningWindow,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &config::Scheduler) -> Result<Self, ConfigError> {
        Ok(Self {
            event_interval: cfg.event_reminder_interval(),
            digest_interval: cfg.daily_itinerary_interval(),
            look_ahead: cfg.look_ahead(),
            morning_window: cfg.morning_window()?,
        })
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            event_interval: Duration::from_secs(5 * 60),
            digest_interval: Duration::from_secs(15 * 60),
            look_ahead: LookAhead::default(),
            morning_window: MorningWindow::default(),
        }
    }
}

/// Totals for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub candidates: usize,
    pub claimed: usize,
    pub created: usize,
    pub enqueued: usize,
    pub failed: usize,
}

struct Scans {
    pool: Pool,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl Scans {
    async fn event_reminders(&self) -> Result<ScanReport> {
        let now = self.clock.now();
        let look_ahead = self.settings.look_ahead;
        let found = candidates::find_upcoming_events(&self.pool, now, &look_ahead).await?;
        let mut report = ScanReport {
            candidates: found.len(),
            ..ScanReport::default()
        };
        for candidate in &found {
            let reminder = candidate.reminder(&look_ahead);
            match self.notifier.remind(&reminder).await {
                Ok(out) => report.add(out),
                Err(err) => {
                    report.failed += 1;
                    error!(?err, event_id = %candidate.reference_id(), "event reminder failed");
                }
            }
        }
        Ok(report)
    }

    async fn daily_itineraries(&self) -> Result<ScanReport> {
        let now = self.clock.now();
        let found =
            candidates::find_daily_digest_groups(&self.pool, now, &self.settings.morning_window)
                .await?;
        let mut report = ScanReport {
            candidates: found.len(),
            ..ScanReport::default()
        };
        for candidate in &found {
            match self.notifier.remind(&candidate.reminder()).await {
                Ok(out) => report.add(out),
                Err(err) => {
                    report.failed += 1;
                    error!(?err, reference_id = %candidate.reference_id(), "daily itinerary failed");
                }
            }
        }
        Ok(report)
    }
}

impl ScanReport {
    fn add(&mut self, out: crate::notifier::FanOut) {
        self.claimed += out.claimed;
        self.created += out.created;
        self.enqueued += usize::from(out.enqueued);
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    timers: Vec<JoinHandle<()>>,
}

/// Owns the two repeating timers. Stopped until [`Scheduler::start`].
pub struct Scheduler {
    scans: Arc<Scans>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            scans: Arc::new(Scans {
                pool,
                notifier,
                clock,
                settings,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Arm both timers. The first tick of each fires immediately. A second call
    /// while running is ignored.
    pub fn start(&self) {
        let mut guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            warn!("scheduler already running; start ignored");
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = self.scans.settings;
        let timers = vec![
            spawn_timer(
                "event_reminders",
                settings.event_interval,
                shutdown_rx.clone(),
                self.scans.clone(),
                |scans| async move { scans.event_reminders().await },
            ),
            spawn_timer(
                "daily_itineraries",
                settings.digest_interval,
                shutdown_rx,
                self.scans.clone(),
                |scans| async move { scans.daily_itineraries().await },
            ),
        ];
        *guard = Some(Running {
            shutdown_tx,
            timers,
        });
        info!(
            event_interval_secs = settings.event_interval.as_secs(),
            digest_interval_secs = settings.digest_interval.as_secs(),
            "scheduler started"
        );
    }

    /// Disarm both timers. Scans already in flight run to completion. No-op when
    /// not running.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        for timer in running.timers {
            if let Err(err) = timer.await {
                warn!(?err, "scheduler timer task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    #[instrument(skip_all)]
    pub async fn process_event_reminders(&self) -> Result<ScanReport> {
        let report = self.scans.event_reminders().await?;
        info!(?report, "event reminder scan finished");
        Ok(report)
    }

    #[instrument(skip_all)]
    pub async fn process_daily_itineraries(&self) -> Result<ScanReport> {
        let report = self.scans.daily_itineraries().await?;
        info!(?report, "daily itinerary scan finished");
        Ok(report)
    }
}

fn spawn_timer<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    scans: Arc<Scans>,
    scan: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Scans>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<ScanReport>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let tick = scan(scans.clone());
                    tokio::spawn(async move {
                        match tick.await {
                            Ok(report) => info!(scan = name, ?report, "scan finished"),
                            Err(err) => error!(?err, scan = name, "scan failed"),
                        }
                    });
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
