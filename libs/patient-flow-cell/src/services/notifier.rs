use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, info};

use shared_database::{retry, RetryPolicy};

use crate::models::Notification;

/// Outbound patient messaging. Delivery is best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, contact: &str, message: &str) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, contact: &str, message: &str) -> Result<()> {
        info!(contact, "Patient notification: {}", message);
        Ok(())
    }
}

/// POSTs `{"contact", "message"}` to a webhook.
pub struct HttpNotifier {
    client: Client,
    webhook_url: String,
}

impl HttpNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, contact: &str, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "contact": contact, "message": message }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Notifier webhook returned {}", status));
        }
        Ok(())
    }
}

/// Deliver with bounded retries. Failure is logged, never returned.
pub async fn deliver(notifier: &dyn Notifier, policy: &RetryPolicy, notification: &Notification) -> bool {
    let result = retry(
        policy,
        "patient notification",
        || notifier.send(&notification.contact, &notification.message),
        |_| true,
    )
    .await;

    match result {
        Ok(()) => {
            debug!(appointment_id = %notification.appointment_id, "Notification delivered");
            true
        }
        Err(e) => {
            error!(
                appointment_id = %notification.appointment_id,
                "Notification undeliverable: {}", e
            );
            false
        }
    }
}
