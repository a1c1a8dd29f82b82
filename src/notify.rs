//! Operator alerts and their throttling.
//!
//! Delivery is fire-and-forget: the alert is handed to a spawned task and the
//! caller moves on to the kill and recovery steps. Failures are logged on the
//! task, never retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A message to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {0}")]
    Status(reqwest::StatusCode),
}

/// Delivery channel for alerts.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Posts alerts as JSON to a webhook URL.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}

/// Used when no webhook is configured: the alert only reaches the log.
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        warn!(subject = %alert.subject, body = %alert.body, "alert");
        Ok(())
    }
}

/// Sends alerts through a channel, at most one per cooldown window.
///
/// The cooldown is shared by every alert of this watchdog; one watchdog only
/// ever tracks one peer, so per-instance windows would buy nothing.
pub struct AlertThrottler {
    channel: Arc<dyn AlertChannel>,
    cooldown: chrono::Duration,
    suppressed: bool,
}

impl AlertThrottler {
    pub fn new(channel: Arc<dyn AlertChannel>, cooldown: Duration) -> Self {
        Self {
            channel,
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::weeks(52)),
            suppressed: false,
        }
    }

    /// Drop every alert (used for local debugging instances).
    pub fn suppressed(mut self, suppressed: bool) -> Self {
        self.suppressed = suppressed;
        self
    }

    /// Alert that `instance` `reason` (e.g. "Bot2" "is unresponsive").
    ///
    /// `last_notification_at` is moved to `now` as soon as the alert is
    /// dispatched, before delivery finishes. Returns the delivery task, or
    /// `None` if the alert was dropped.
    pub fn notify_kill(
        &self,
        last_notification_at: &mut Option<DateTime<Utc>>,
        instance: &str,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Option<JoinHandle<()>> {
        let subject = format!("{instance} {reason}");
        if self.suppressed {
            debug!(%subject, "notifications suppressed in debug mode");
            return None;
        }
        if let Some(last) = *last_notification_at {
            let cooling = last
                .checked_add_signed(self.cooldown)
                .map_or(true, |until| now < until);
            if cooling {
                info!(%subject, last_notification = %last, "alert dropped, still in cooldown");
                return None;
            }
        }
        *last_notification_at = Some(now);

        let alert = Alert {
            subject,
            body: message.to_string(),
            sent_at: now,
        };
        let channel = Arc::clone(&self.channel);
        Some(tokio::spawn(async move {
            match channel.send(&alert).await {
                Ok(()) => debug!(channel = channel.name(), subject = %alert.subject, "alert sent"),
                Err(e) => error!(
                    channel = channel.name(),
                    subject = %alert.subject,
                    error = %e,
                    "failed to send alert"
                ),
            }
        }))
    }
}
