//! Operator notifications. Best effort: callers log failures and move on.

use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::{env, sync::Arc};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(String),
    #[error("notification rejected with HTTP {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), NotifyError>;
}

/// Posts `{"text": ...}` to a chat webhook.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            url: url.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|err| NotifyError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Writes notifications to the log when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, text: &str) -> Result<(), NotifyError> {
        info!(target = "oc.notify", text, "operator_notification");
        Ok(())
    }
}

pub fn notifier_from_env() -> Arc<dyn NotificationSink> {
    match WebhookNotifier::from_env() {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(LogNotifier),
    }
}
