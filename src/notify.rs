//! Fire-and-forget notifications.
//!
//! Nothing here sits on the correctness path: a failed publish is logged and
//! dropped, never propagated into rotation state.

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Signal a single device that something changed for it.
    async fn publish_to_device(&self, client_id: &str);

    /// Nudge dashboards to refresh. Empty payload, broadcast.
    async fn broadcast_dashboard_nudge(&self);
}

/// Used when no webhook targets are configured.
pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn publish_to_device(&self, _client_id: &str) {}

    async fn broadcast_dashboard_nudge(&self) {}
}

pub struct WebhookNotifier {
    http: reqwest::Client,
    device_url: Option<String>,
    dashboard_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(cfg: &crate::settings::Notify) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            http,
            device_url: cfg.device_webhook_url.clone(),
            dashboard_url: cfg.dashboard_webhook_url.clone(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn publish_to_device(&self, client_id: &str) {
        let Some(url) = &self.device_url else {
            return;
        };

        let result = self
            .http
            .post(url)
            .json(&serde_json::json!({ "client_id": client_id }))
            .send()
            .await;

        if let Err(e) = result {
            tracing::warn!(client_id, "Device notification failed: {}", e);
        }
    }

    async fn broadcast_dashboard_nudge(&self) {
        let Some(url) = &self.dashboard_url else {
            return;
        };

        if let Err(e) = self.http.post(url).send().await {
            tracing::warn!("Dashboard nudge failed: {}", e);
        }
    }
}
