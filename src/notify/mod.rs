//! Decision-driven notifications: message rendering, delivery channels and
//! the dispatcher that logs every attempt.

pub mod dispatcher;
pub mod templates;

pub use dispatcher::Dispatcher;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::NotificationConfig;
use crate::model::NotificationKind;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("template rendering failed: {0}")]
    Template(#[from] askama::Error),
}

/// A rendered notification ready for a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedMessage {
    pub kind: NotificationKind,
    pub subject: String,
    pub body: String,
}

/// Outbound delivery channel. `Ok` means sent; any error is recorded as a
/// failed delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name stored with each notification log.
    fn channel(&self) -> &str;

    async fn send(
        &self,
        recipients: &[String],
        message: &RenderedMessage,
        task_id: Option<i64>,
    ) -> Result<(), NotifyError>;
}

/// Writes messages to the tracing log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &str {
        "log"
    }

    async fn send(
        &self,
        recipients: &[String],
        message: &RenderedMessage,
        task_id: Option<i64>,
    ) -> Result<(), NotifyError> {
        info!(
            kind = %message.kind,
            task_id = ?task_id,
            recipients = %recipients.join(", "),
            subject = %message.subject,
            "notification"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    kind: NotificationKind,
    task_id: Option<i64>,
    recipients: &'a [String],
    subject: &'a str,
    body: &'a str,
}

/// POSTs each message as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("maintrack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifyError::Delivery(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &str {
        "webhook"
    }

    async fn send(
        &self,
        recipients: &[String],
        message: &RenderedMessage,
        task_id: Option<i64>,
    ) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            kind: message.kind,
            task_id,
            recipients,
            subject: &message.subject,
            body: &message.body,
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(())
    }
}

/// Webhook when a URL is configured, log-only otherwise.
pub fn notifier_from_config(cfg: &NotificationConfig) -> Result<Box<dyn Notifier>, NotifyError> {
    match cfg.webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(Box::new(WebhookNotifier::new(
            url,
            Duration::from_secs(cfg.timeout_secs),
        )?)),
        _ => Ok(Box::new(LogNotifier)),
    }
}
