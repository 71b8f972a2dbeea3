//! Batch worker: expands queued fan-out jobs into notification records.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::db::{self, Pool};
use crate::model::BatchJob;
use crate::notifier::batch_recipients;
use crate::queue::{self, QueuedJob, NOTIFICATION_BATCH};
use crate::sender::{self, Sender};

/// What happened to the job taken by one [`process_next_job`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Records written and job removed.
    Expanded { created: usize },
    /// Past `expire_at`; dropped without writing.
    Expired,
    /// Payload could not be decoded; dropped.
    Malformed,
    /// Another worker removed it first.
    Taken,
    /// Failed; rescheduled with backoff.
    Retried,
}

/// Take the next due job, if any, and handle it. `Ok(None)` means the queue
/// had nothing due.
#[instrument(skip_all)]
pub async fn process_next_job(
    pool: &Pool,
    sender: &dyn Sender,
    clock: &dyn Clock,
    max_backoff_secs: i64,
) -> Result<Option<JobOutcome>> {
    let now = clock.now();
    let Some(job) = queue::next_due(pool, NOTIFICATION_BATCH, now).await? else {
        return Ok(None);
    };

    if job.is_expired(now) {
        let mut conn = pool.acquire().await?;
        queue::delete_job(&mut conn, job.id).await?;
        warn!(id = job.id, attempt = job.attempt, "batch job expired; dropped");
        return Ok(Some(JobOutcome::Expired));
    }

    let batch: BatchJob = match serde_json::from_str(&job.payload) {
        Ok(batch) => batch,
        Err(err) => {
            let mut conn = pool.acquire().await?;
            queue::delete_job(&mut conn, job.id).await?;
            error!(?err, id = job.id, "malformed batch job; dropped");
            return Ok(Some(JobOutcome::Malformed));
        }
    };

    match expand(pool, sender, clock, &job, &batch).await {
        Ok(Some(created)) => {
            info!(id = job.id, group_id = %batch.group_id, created, "batch job expanded");
            Ok(Some(JobOutcome::Expanded { created }))
        }
        Ok(None) => {
            debug!(id = job.id, "batch job taken by another worker");
            Ok(Some(JobOutcome::Taken))
        }
        Err(err) => {
            warn!(?err, id = job.id, attempt = job.attempt, "batch job failed; backoff");
            queue::backoff_with_cap(pool, job.id, job.attempt, max_backoff_secs, now).await?;
            Ok(Some(JobOutcome::Retried))
        }
    }
}

/// Insert every record and remove the job in one transaction. Returns `None`
/// when the job was already gone, in which case nothing is written.
async fn expand(
    pool: &Pool,
    sender: &dyn Sender,
    clock: &dyn Clock,
    job: &QueuedJob,
    batch: &BatchJob,
) -> Result<Option<usize>> {
    let recipients = batch_recipients(pool, batch).await?;
    let now = clock.now();

    let mut tx = pool.begin().await?;
    if !queue::delete_job(&mut tx, job.id).await? {
        tx.rollback().await?;
        return Ok(None);
    }
    for contact in &recipients {
        if let Err(err) = db::insert_notification(
            &mut tx,
            &contact.user_id,
            Some(&batch.group_id),
            &batch.content,
            now,
        )
        .await
        {
            tx.rollback().await?;
            return Err(err);
        }
    }
    tx.commit().await?;

    sender::deliver_external(pool, sender, Some(&batch.group_id), &recipients, &batch.content).await;
    Ok(Some(recipients.len()))
}

/// Polling consumer for the notification batch queue.
pub struct Worker {
    pool: Pool,
    sender: Arc<dyn Sender>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    max_backoff_secs: i64,
}

impl Worker {
    pub fn new(
        pool: Pool,
        sender: Arc<dyn Sender>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        max_backoff_secs: i64,
    ) -> Self {
        Self {
            pool,
            sender,
            clock,
            poll_interval,
            max_backoff_secs,
        }
    }

    /// Drain due jobs one at a time; sleep `poll_interval` when idle. Returns
    /// after `shutdown` flips to true, once the current job is done.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_ms = self.poll_interval.as_millis(), "starting batch worker");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match process_next_job(
                &self.pool,
                self.sender.as_ref(),
                self.clock.as_ref(),
                self.max_backoff_secs,
            )
            .await
            {
                Ok(Some(_)) => continue,
                Ok(None) => self.poll_interval,
                Err(err) => {
                    error!(?err, "batch worker error");
                    Duration::from_secs(1)
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("batch worker stopped");
    }
}
