//! Notification delivery with bounded retry and send spacing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::alert::NotificationRequest;
use crate::config::{DispatchConfig, NotifierConfig};
use crate::error::DeliveryError;
use crate::pipeline::record::{DeliveryOutcome, DeliveryRecord};
use crate::retry::RetryPolicy;

/// Outbound messaging transport.
pub trait Notifier: Send + Sync {
    fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError>;

    fn name(&self) -> &'static str;
}

impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        (**self).send(channel_id, text)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Writes the message to the log. Used when no transport is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        info!(channel_id, text, "notification (log only)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    channel_id: &'a str,
    text: &'a str,
}

/// POSTs `{channel_id, text}` JSON to a messaging gateway.
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

/// Statuses that will not succeed on retry: bad payload, forbidden or
/// unknown channel.
fn is_permanent_status(status: u16) -> bool {
    matches!(status, 400 | 403 | 404 | 410)
}

impl Notifier for WebhookNotifier {
    fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;
        let resp = client
            .post(&self.url)
            .json(&WebhookBody { channel_id, text })
            .send()
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let msg = format!("gateway returned HTTP {}", status.as_u16());
        if is_permanent_status(status.as_u16()) {
            Err(DeliveryError::Permanent(msg))
        } else {
            Err(DeliveryError::Transient(msg))
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

pub fn notifier_from_config(cfg: &DispatchConfig) -> Box<dyn Notifier> {
    match &cfg.notifier {
        NotifierConfig::Log => Box::new(LogNotifier),
        NotifierConfig::Webhook { url } => Box::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )),
    }
}

/// Sends requests one at a time, spacing them by `min_interval`.
pub struct Dispatcher<'a> {
    notifier: &'a dyn Notifier,
    retry: RetryPolicy,
    min_interval: Duration,
}

impl<'a> Dispatcher<'a> {
    pub fn new(notifier: &'a dyn Notifier, retry: RetryPolicy, min_interval: Duration) -> Self {
        Self {
            notifier,
            retry,
            min_interval,
        }
    }

    pub fn from_config(notifier: &'a dyn Notifier, cfg: &DispatchConfig) -> Self {
        Self::new(
            notifier,
            cfg.retry.clone(),
            Duration::from_millis(cfg.min_send_interval_ms),
        )
    }

    pub fn dispatch(&self, requests: &[NotificationRequest]) -> Vec<DeliveryRecord> {
        let mut records = Vec::with_capacity(requests.len());
        let mut last_send: Option<Instant> = None;

        for req in requests {
            if let Some(prev) = last_send {
                let elapsed = prev.elapsed();
                if elapsed < self.min_interval {
                    std::thread::sleep(self.min_interval - elapsed);
                }
            }

            let mut attempts = 0;
            let result = self.retry.run(
                &req.subscriber_id,
                |n| {
                    attempts = n;
                    self.notifier.send(&req.channel_id, &req.text)
                },
                DeliveryError::is_transient,
            );
            last_send = Some(Instant::now());

            let record = match result {
                Ok(()) => {
                    info!(subscriber = %req.subscriber_id, notifier = self.notifier.name(), attempts, "notification delivered");
                    DeliveryRecord {
                        subscriber_id: req.subscriber_id.clone(),
                        channel_id: req.channel_id.clone(),
                        outcome: DeliveryOutcome::Delivered,
                        attempts,
                        error: None,
                    }
                }
                Err(e) => {
                    let outcome = if e.is_transient() {
                        DeliveryOutcome::Failed
                    } else {
                        DeliveryOutcome::Skipped
                    };
                    warn!(subscriber = %req.subscriber_id, attempts, outcome = ?outcome, error = %e, "notification not delivered");
                    DeliveryRecord {
                        subscriber_id: req.subscriber_id.clone(),
                        channel_id: req.channel_id.clone(),
                        outcome,
                        attempts,
                        error: Some(e.to_string()),
                    }
                }
            };
            records.push(record);
        }
        records
    }
}
