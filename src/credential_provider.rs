//! Client for the identity provider's administrative API.
//!
//! Every operation is idempotent keyed by the deterministic client id
//! derived from a device's immutable key. Failures collapse into the single
//! [`ApsisError::ExternalService`] kind and no retries happen here; retry is
//! the next scheduled tick.

use crate::errors::ApsisError;
use crate::settings;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Derive the external client identifier from a device's immutable key.
pub fn client_id_for(key: &str) -> String {
    format!("device-{}", key)
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Create the client if missing; return its current secret either way.
    async fn create_or_get_client(&self, client_id: &str) -> Result<String, ApsisError>;

    /// Issue a fresh secret for the client. The returned value is
    /// authoritative; any previously known secret is stale after this call.
    async fn regenerate_secret(&self, client_id: &str) -> Result<String, ApsisError>;

    /// Set the client's secret back to a specific known value.
    async fn restore_secret(&self, client_id: &str, secret: &str) -> Result<(), ApsisError>;

    /// Best-effort removal; only called when the owning device is deleted.
    async fn delete_client(&self, client_id: &str) -> Result<(), ApsisError>;
}

#[derive(Debug, Deserialize)]
struct SecretResponse {
    secret: String,
}

pub struct HttpCredentialProvider {
    http: reqwest::Client,
    base_url: String,
    admin_token: String,
}

impl HttpCredentialProvider {
    pub fn new(cfg: &settings::Provider) -> Result<Self, ApsisError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| ApsisError::ExternalService(e.to_string()))?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            admin_token: cfg.admin_token.clone(),
        })
    }

    fn client_url(&self, client_id: &str) -> String {
        format!("{}/admin/clients/{}", self.base_url, client_id)
    }

    async fn parse_secret(&self, resp: reqwest::Response) -> Result<String, ApsisError> {
        let resp = check_status(resp).await?;
        let body: SecretResponse = resp
            .json()
            .await
            .map_err(|e| ApsisError::ExternalService(e.to_string()))?;
        Ok(body.secret)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ApsisError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(ApsisError::ExternalService(format!(
        "provider returned {}: {}",
        status, body
    )))
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn create_or_get_client(&self, client_id: &str) -> Result<String, ApsisError> {
        let resp = self
            .http
            .put(self.client_url(client_id))
            .bearer_auth(&self.admin_token)
            .send()
            .await
            .map_err(|e| ApsisError::ExternalService(e.to_string()))?;
        self.parse_secret(resp).await
    }

    async fn regenerate_secret(&self, client_id: &str) -> Result<String, ApsisError> {
        let resp = self
            .http
            .post(format!("{}/secret", self.client_url(client_id)))
            .bearer_auth(&self.admin_token)
            .send()
            .await
            .map_err(|e| ApsisError::ExternalService(e.to_string()))?;
        self.parse_secret(resp).await
    }

    async fn restore_secret(&self, client_id: &str, secret: &str) -> Result<(), ApsisError> {
        let resp = self
            .http
            .put(format!("{}/secret", self.client_url(client_id)))
            .bearer_auth(&self.admin_token)
            .json(&serde_json::json!({ "secret": secret }))
            .send()
            .await
            .map_err(|e| ApsisError::ExternalService(e.to_string()))?;
        check_status(resp).await?;
        Ok(())
    }

    async fn delete_client(&self, client_id: &str) -> Result<(), ApsisError> {
        let resp = self
            .http
            .delete(self.client_url(client_id))
            .bearer_auth(&self.admin_token)
            .send()
            .await
            .map_err(|e| ApsisError::ExternalService(e.to_string()))?;
        check_status(resp).await?;
        Ok(())
    }
}
