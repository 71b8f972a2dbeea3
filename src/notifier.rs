//! Notification writer.
//!
//! [`Notifier`] is the entry point other code uses to create notifications.
//! Fan-out goes through a [`Delivery`] strategy picked at construction:
//! [`InlineDelivery`] writes every record in the calling task, [`QueuedDelivery`]
//! enqueues one batch job for the worker to expand later.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::db::{self, MemberContact, Pool};
use crate::ledger;
use crate::model::{
    BatchJob, Notification, NotificationContent, NotifyError, Preferences, Reminder,
};
use crate::queue::{QueueClient, SendOptions, NOTIFICATION_BATCH};
use crate::sender::{self, Sender};

/// Outcome of one fan-out call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Ledger claims won (reminders only).
    pub claimed: usize,
    /// Notification records written synchronously.
    pub created: usize,
    /// Whether a batch job was enqueued.
    pub enqueued: bool,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    /// Ad-hoc fan-out of `job` to the group's confirmed members.
    async fn fan_out(&self, job: BatchJob) -> Result<FanOut>;

    /// Scheduled reminder. Each recipient is claimed in the ledger first; only
    /// winners are notified.
    async fn remind(&self, reminder: &Reminder) -> Result<FanOut>;
}

/// Confirmed members a batch job expands to: the explicit list if the job has
/// one, otherwise every confirmed member; minus the excluded user.
pub(crate) async fn batch_recipients(pool: &Pool, job: &BatchJob) -> Result<Vec<MemberContact>> {
    let members = db::list_confirmed_members(pool, &job.group_id).await?;
    Ok(members
        .into_iter()
        .filter(|m| job.exclude_user_id.as_deref() != Some(m.user_id.as_str()))
        .filter(|m| match &job.recipients {
            Some(list) => list.iter().any(|r| r == &m.user_id),
            None => true,
        })
        .collect())
}

pub struct InlineDelivery {
    pool: Pool,
    clock: Arc<dyn Clock>,
    sender: Arc<dyn Sender>,
}

impl InlineDelivery {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>, sender: Arc<dyn Sender>) -> Self {
        Self {
            pool,
            clock,
            sender,
        }
    }

    async fn write_one(
        &self,
        user_id: &str,
        group_id: &str,
        content: &NotificationContent,
        now: DateTime<Utc>,
    ) -> Result<Notification> {
        let mut conn = self.pool.acquire().await?;
        db::insert_notification(&mut conn, user_id, Some(group_id), content, now).await
    }

    /// Claim and insert in one transaction: a failed insert releases the claim
    /// so the next scan can retry.
    async fn claim_and_write(
        &self,
        user_id: &str,
        reminder: &Reminder,
        content: &NotificationContent,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !ledger::try_claim_in(&mut tx, user_id, reminder.kind, &reminder.reference_id, now)
            .await?
        {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Err(err) =
            db::insert_notification(&mut tx, user_id, Some(&reminder.group_id), content, now).await
        {
            tx.rollback().await?;
            return Err(err);
        }
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl Delivery for InlineDelivery {
    #[instrument(skip_all)]
    async fn fan_out(&self, job: BatchJob) -> Result<FanOut> {
        let now = self.clock.now();
        let recipients = batch_recipients(&self.pool, &job).await?;
        let total = recipients.len();
        let mut written = Vec::with_capacity(total);
        for contact in recipients {
            match self
                .write_one(&contact.user_id, &job.group_id, &job.content, now)
                .await
            {
                Ok(_) => written.push(contact),
                Err(err) => warn!(
                    ?err,
                    user_id = %contact.user_id,
                    group_id = %job.group_id,
                    "notification insert failed"
                ),
            }
        }
        sender::deliver_external(
            &self.pool,
            self.sender.as_ref(),
            Some(&job.group_id),
            &written,
            &job.content,
        )
        .await;

        let created = written.len();
        if created < total {
            bail!(
                "created {created} of {total} notifications for group {}",
                job.group_id
            );
        }
        Ok(FanOut {
            claimed: 0,
            created,
            enqueued: false,
        })
    }

    #[instrument(skip_all)]
    async fn remind(&self, reminder: &Reminder) -> Result<FanOut> {
        let now = self.clock.now();
        let content = reminder.content();
        let contacts: HashMap<String, MemberContact> =
            db::list_confirmed_members(&self.pool, &reminder.group_id)
                .await?
                .into_iter()
                .map(|c| (c.user_id.clone(), c))
                .collect();

        let mut created = 0;
        let mut written = Vec::new();
        for user_id in &reminder.recipients {
            match self.claim_and_write(user_id, reminder, &content, now).await {
                Ok(true) => {
                    created += 1;
                    if let Some(contact) = contacts.get(user_id) {
                        written.push(contact.clone());
                    }
                }
                Ok(false) => {}
                Err(err) => warn!(
                    ?err,
                    user_id = %user_id,
                    reference_id = %reminder.reference_id,
                    "reminder write failed"
                ),
            }
        }
        sender::deliver_external(
            &self.pool,
            self.sender.as_ref(),
            Some(&reminder.group_id),
            &written,
            &content,
        )
        .await;

        Ok(FanOut {
            claimed: created,
            created,
            enqueued: false,
        })
    }
}

pub struct QueuedDelivery {
    pool: Pool,
    clock: Arc<dyn Clock>,
    queue: Arc<dyn QueueClient>,
    /// Reminder jobs older than this are dropped by the worker.
    expire_after: Duration,
}

impl QueuedDelivery {
    pub fn new(
        pool: Pool,
        clock: Arc<dyn Clock>,
        queue: Arc<dyn QueueClient>,
        expire_after: Duration,
    ) -> Self {
        Self {
            pool,
            clock,
            queue,
            expire_after,
        }
    }
}

#[async_trait]
impl Delivery for QueuedDelivery {
    #[instrument(skip_all)]
    async fn fan_out(&self, job: BatchJob) -> Result<FanOut> {
        let payload = serde_json::to_value(&job)?;
        let id = self
            .queue
            .send(NOTIFICATION_BATCH, &payload, SendOptions::default())
            .await?;
        Ok(FanOut {
            enqueued: id.is_some(),
            ..FanOut::default()
        })
    }

    /// Claims and the batch job commit together. If the send fails, or a job
    /// under the same key is still queued, every claim is released so a later
    /// scan can pick the recipients up again.
    #[instrument(skip_all)]
    async fn remind(&self, reminder: &Reminder) -> Result<FanOut> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut claimed = Vec::new();
        for user_id in &reminder.recipients {
            match ledger::try_claim_in(&mut tx, user_id, reminder.kind, &reminder.reference_id, now)
                .await
            {
                Ok(true) => claimed.push(user_id.clone()),
                Ok(false) => {}
                Err(err) => warn!(?err, user_id = %user_id, "reminder claim failed"),
            }
        }
        if claimed.is_empty() {
            tx.rollback().await?;
            return Ok(FanOut::default());
        }

        let count = claimed.len();
        let job = BatchJob {
            group_id: reminder.group_id.clone(),
            content: reminder.content(),
            exclude_user_id: None,
            recipients: Some(claimed),
        };
        let options = SendOptions {
            idempotency_key: Some(reminder.kind.idempotency_key(&reminder.reference_id)),
            expire_after: Some(self.expire_after),
        };
        let payload = serde_json::to_value(&job)?;
        match self
            .queue
            .send_in(&mut tx, NOTIFICATION_BATCH, &payload, options)
            .await
        {
            Ok(Some(_)) => {
                tx.commit().await?;
                Ok(FanOut {
                    claimed: count,
                    created: 0,
                    enqueued: true,
                })
            }
            Ok(None) => {
                tx.rollback().await?;
                warn!(
                    reference_id = %reminder.reference_id,
                    released = count,
                    "reminder batch still queued; claims released for a later scan"
                );
                Ok(FanOut::default())
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: i64,
    pub limit: i64,
    pub unread_only: bool,
    pub group_id: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            unread_only: false,
            group_id: None,
        }
    }
}

impl ListQuery {
    fn validate(&self) -> Result<(), NotifyError> {
        if self.page < 1 {
            return Err(NotifyError::InvalidPagination("page must be >= 1"));
        }
        if !(1..=100).contains(&self.limit) {
            return Err(NotifyError::InvalidPagination("limit must be between 1 and 100"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    pub data: Vec<Notification>,
    pub meta: PageMeta,
    pub unread_count: i64,
}

/// Creates notifications and answers read-side queries about them.
#[derive(Clone)]
pub struct Notifier {
    pool: Pool,
    clock: Arc<dyn Clock>,
    sender: Arc<dyn Sender>,
    delivery: Arc<dyn Delivery>,
}

impl Notifier {
    pub fn new(
        pool: Pool,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn Sender>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            pool,
            clock,
            sender,
            delivery,
        }
    }

    /// Fan-out written in the calling task.
    pub fn inline(pool: Pool, clock: Arc<dyn Clock>, sender: Arc<dyn Sender>) -> Self {
        let delivery = Arc::new(InlineDelivery::new(pool.clone(), clock.clone(), sender.clone()));
        Self::new(pool, clock, sender, delivery)
    }

    /// Fan-out handed to the batch worker through `queue`.
    pub fn queued(
        pool: Pool,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn Sender>,
        queue: Arc<dyn QueueClient>,
        expire_after: Duration,
    ) -> Self {
        let delivery = Arc::new(QueuedDelivery::new(
            pool.clone(),
            clock.clone(),
            queue,
            expire_after,
        ));
        Self::new(pool, clock, sender, delivery)
    }

    /// Single-recipient notification. Always written immediately.
    #[instrument(skip_all)]
    pub async fn notify(
        &self,
        user_id: &str,
        group_id: Option<&str>,
        content: NotificationContent,
    ) -> Result<Notification> {
        let mut conn = self.pool.acquire().await?;
        let created =
            db::insert_notification(&mut conn, user_id, group_id, &content, self.clock.now())
                .await?;
        drop(conn);

        if let Some(contact) = db::get_user_contact(&self.pool, user_id).await? {
            sender::deliver_external(&self.pool, self.sender.as_ref(), group_id, &[contact], &content)
                .await;
        }
        Ok(created)
    }

    /// Notify every confirmed member of `group_id` except `exclude_user_id`.
    #[instrument(skip_all)]
    pub async fn notify_many(
        &self,
        group_id: &str,
        content: NotificationContent,
        exclude_user_id: Option<&str>,
    ) -> Result<FanOut> {
        let job = BatchJob {
            group_id: group_id.to_string(),
            content,
            exclude_user_id: exclude_user_id.map(str::to_string),
            recipients: None,
        };
        let out = self.delivery.fan_out(job).await?;
        info!(group_id, created = out.created, enqueued = out.enqueued, "fan-out requested");
        Ok(out)
    }

    pub async fn remind(&self, reminder: &Reminder) -> Result<FanOut> {
        self.delivery.remind(reminder).await
    }

    #[instrument(skip_all)]
    pub async fn list_notifications(&self, user_id: &str, query: &ListQuery) -> Result<NotificationPage> {
        query.validate()?;
        let group = query.group_id.as_deref();
        let offset = (query.page - 1) * query.limit;
        let data = db::list_notifications(
            &self.pool,
            user_id,
            group,
            query.unread_only,
            query.limit,
            offset,
        )
        .await?;
        let total = db::count_notifications(&self.pool, user_id, group, query.unread_only).await?;
        let unread_count = db::count_notifications(&self.pool, user_id, group, true).await?;
        let total_pages = ((total + query.limit - 1) / query.limit).max(1);
        Ok(NotificationPage {
            data,
            meta: PageMeta {
                total,
                page: query.page,
                limit: query.limit,
                total_pages,
            },
            unread_count,
        })
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64> {
        db::count_notifications(&self.pool, user_id, None, true).await
    }

    pub async fn group_unread_count(&self, user_id: &str, group_id: &str) -> Result<i64> {
        db::count_notifications(&self.pool, user_id, Some(group_id), true).await
    }

    pub async fn mark_as_read(&self, notification_id: &str, user_id: &str) -> Result<()> {
        if !db::mark_notification_read(&self.pool, notification_id, user_id, self.clock.now()).await? {
            return Err(NotifyError::NotificationNotFound.into());
        }
        Ok(())
    }

    /// Returns the number of notifications that flipped to read.
    pub async fn mark_all_as_read(&self, user_id: &str, group_id: Option<&str>) -> Result<u64> {
        db::mark_all_notifications_read(&self.pool, user_id, group_id, self.clock.now()).await
    }

    pub async fn get_preferences(&self, user_id: &str, group_id: &str) -> Result<Preferences> {
        db::get_preferences(&self.pool, user_id, group_id).await
    }

    pub async fn update_preferences(
        &self,
        user_id: &str,
        group_id: &str,
        prefs: Preferences,
    ) -> Result<Preferences> {
        db::upsert_preferences(&self.pool, user_id, group_id, prefs, self.clock.now()).await
    }

    pub async fn create_default_preferences(&self, user_id: &str, group_id: &str) -> Result<()> {
        db::create_default_preferences(&self.pool, user_id, group_id).await
    }
}
