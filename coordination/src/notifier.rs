//! Panic notifications
//!
//! Fire-and-forget push notification sent when a cluster connection ends
//! abnormally or a cluster reports its own crash. Delivery failures are
//! logged and never reach the gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::PanicConfig;

/// Error type for notification delivery
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification service rejected the request with HTTP {0}")]
    Rejected(u16),
}

/// Shared reference to a notifier
pub type SharedNotifier = Arc<dyn PanicNotifier>;

/// Sink for panic notifications.
#[async_trait]
pub trait PanicNotifier: Send + Sync {
    /// Deliver `message` about the cluster `identifier`.
    async fn notify(&self, identifier: &str, message: &str) -> Result<(), NotifyError>;
}

/// Spawn a notification so the caller never waits on the remote service.
pub fn notify_in_background(notifier: &SharedNotifier, identifier: &str, message: String) {
    let notifier = Arc::clone(notifier);
    let identifier = identifier.to_string();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&identifier, &message).await {
            warn!(identifier = %identifier, error = %e, "Panic notification failed");
        }
    });
}

/// Posts notifications to a pushed.co-compatible form endpoint.
pub struct PushedNotifier {
    http: reqwest::Client,
    config: PanicConfig,
}

impl PushedNotifier {
    pub fn new(config: PanicConfig) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl PanicNotifier for PushedNotifier {
    async fn notify(&self, identifier: &str, message: &str) -> Result<(), NotifyError> {
        let form = [
            ("app_key", self.config.app_key.as_str()),
            ("app_secret", self.config.app_secret.as_str()),
            ("access_token", self.config.access_token.as_str()),
            ("content", message),
            ("target_type", "user"),
        ];
        let response = self.http.post(&self.config.url).form(&form).send().await?;
        let status = response.status();
        info!(
            identifier,
            status = status.as_u16(),
            at = %Utc::now(),
            "Panic report sent"
        );
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(status.as_u16()))
        }
    }
}

/// Used when no push credentials are configured.
pub struct LogNotifier;

#[async_trait]
impl PanicNotifier for LogNotifier {
    async fn notify(&self, identifier: &str, message: &str) -> Result<(), NotifyError> {
        warn!(identifier, message, "Cluster panic (no notifier configured)");
        Ok(())
    }
}

/// Pick the notifier for an optional credential set.
pub fn from_config(config: Option<&PanicConfig>) -> Result<SharedNotifier, NotifyError> {
    match config {
        Some(panic) => Ok(Arc::new(PushedNotifier::new(panic.clone())?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
