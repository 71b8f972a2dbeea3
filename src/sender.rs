//! External push/SMS transport seam.
//!
//! The engine only guarantees that notification records are created once.
//! Outbound messages are best effort: a failed send is logged and dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::{info, instrument, warn};

use crate::db::{self, MemberContact, Pool};
use crate::model::{NotificationContent, OutboundMessage, Preferences};

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;
}

/// Writes outbound messages to the log. Used when no transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl Sender for LogSender {
    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        info!(user_id = %msg.user_id, message = %msg.message, "outbound message");
        Ok(())
    }
}

/// POSTs each message as JSON to a webhook that bridges to the real provider.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    http: Client,
    url: Url,
}

impl WebhookSender {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid webhook url {url}"))?;
        let http = Client::builder()
            .user_agent("itinerary-notify/0.1")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, url })
    }

    pub fn build_request(&self, msg: &OutboundMessage) -> Result<reqwest::Request> {
        self.http
            .post(self.url.clone())
            .json(msg)
            .build()
            .context("failed to build webhook request")
    }
}

#[async_trait]
impl Sender for WebhookSender {
    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let request = self.build_request(msg)?;
        self.http
            .execute(request)
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected message")?;
        Ok(())
    }
}

pub fn outbound_message(contact: &MemberContact, content: &NotificationContent) -> OutboundMessage {
    OutboundMessage {
        user_id: contact.user_id.clone(),
        phone_number: contact.phone_number.clone(),
        message: format!("{}: {}", content.title, content.body),
    }
}

/// Send `content` to every contact whose preferences for `group_id` allow its
/// kind. Returns how many sends succeeded. Never fails: records are already
/// committed by the time this runs.
#[instrument(skip_all)]
pub async fn deliver_external(
    pool: &Pool,
    sender: &dyn Sender,
    group_id: Option<&str>,
    contacts: &[MemberContact],
    content: &NotificationContent,
) -> usize {
    let prefs = match group_id {
        Some(group_id) => match db::list_group_preferences(pool, group_id).await {
            Ok(map) => map,
            Err(err) => {
                warn!(?err, group_id, "failed to load preferences; skipping external delivery");
                return 0;
            }
        },
        None => Default::default(),
    };

    let mut sent = 0;
    for contact in contacts {
        let allowed = prefs
            .get(&contact.user_id)
            .copied()
            .unwrap_or_else(Preferences::default)
            .allows(content.kind);
        if !allowed {
            continue;
        }
        let msg = outbound_message(contact, content);
        match sender.send(&msg).await {
            Ok(()) => sent += 1,
            Err(err) => warn!(?err, user_id = %contact.user_id, "external send failed"),
        }
    }
    sent
}
