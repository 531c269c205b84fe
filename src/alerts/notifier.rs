//! Alert delivery

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{error, warn};

use super::{Alert, AlertSeverity};
use crate::error::{Error, Result};

/// Alert delivery channel. `Ok` means delivery was confirmed.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl AlertNotifier for LoggingNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical => error!(alert = %alert.dedupe_key(), "{}", alert.message()),
            AlertSeverity::Warning => warn!(alert = %alert.dedupe_key(), "{}", alert.message()),
        }
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "text": alert.message(),
                "alert": alert,
            }))
            .send()
            .await
            .map_err(|e| Error::AlertDeliveryFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::AlertDeliveryFailure(format!(
                "webhook returned {}",
                status
            )));
        }
        Ok(())
    }
}

/// Keeps delivered alerts in memory; can be switched to fail
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Alert> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::AlertDeliveryFailure("notifier unavailable".into()));
        }
        self.sent.lock().push(alert.clone());
        Ok(())
    }
}
