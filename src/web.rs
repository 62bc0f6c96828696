//! HTTP surface of the rotation service.
//!
//! Administrative triggers report counts, not per-device outcomes; failures
//! during background ticks surface through state that fails to progress and
//! through logs, never through these responses.

use crate::credential_provider::client_id_for;
use crate::errors::ApsisError;
use crate::jobs;
use crate::rotation::RotationEngine;
use crate::settings::Settings;
use crate::storage;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use miette::IntoDiagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub engine: RotationEngine,
}

pub async fn serve(settings: Settings, engine: RotationEngine) -> miette::Result<()> {
    let state = AppState {
        settings: Arc::new(settings),
        engine,
    };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/fleet/rotate", post(fleet_rotate))
        .route("/fleet/status", get(fleet_status))
        .route("/devices", post(register_device))
        .route("/devices/{key}", axum::routing::delete(delete_device))
        .route("/devices/checkin", post(device_checkin))
        .route("/jobs/{name}/trigger", post(trigger_job))
        .with_state(state.clone());

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    tracing::info!(%addr, "Fleet API listening");

    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}

fn error_response(e: ApsisError) -> Response {
    let status = match &e {
        ApsisError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ApsisError::ExternalService(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()}))).into_response()
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// Fleet endpoints

async fn fleet_rotate(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.trigger_fleet_rotation().await {
        Ok(queued_count) => {
            (StatusCode::OK, Json(json!({"queued_count": queued_count}))).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Serialize)]
struct DeviceStatus {
    key: String,
    name: Option<String>,
    rotation_state: String,
    secret_age_secs: i64,
    last_rotation_attempt_at: Option<i64>,
    last_rotation_completed_at: Option<i64>,
}

async fn fleet_status(State(state): State<AppState>) -> impl IntoResponse {
    match storage::list_devices(state.engine.db()).await {
        Ok(devices) => {
            let now = Utc::now().timestamp();
            let statuses: Vec<DeviceStatus> = devices
                .into_iter()
                .map(|d| DeviceStatus {
                    key: d.key,
                    name: d.name,
                    rotation_state: d.rotation_state.as_str().to_string(),
                    secret_age_secs: now - d.secret_created_at,
                    last_rotation_attempt_at: d.last_rotation_attempt_at,
                    last_rotation_completed_at: d.last_rotation_completed_at,
                })
                .collect();
            (StatusCode::OK, Json(json!({"devices": statuses}))).into_response()
        }
        Err(e) => error_response(e),
    }
}

// Device endpoints

#[derive(Debug, Deserialize)]
struct RegisterDeviceRequest {
    key: String,
    name: Option<String>,
}

async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> impl IntoResponse {
    match state.engine.register_device(&req.key, req.name).await {
        Ok((device, secret)) => (
            StatusCode::CREATED,
            Json(json!({
                "id": device.id,
                "key": device.key,
                "name": device.name,
                "client_id": client_id_for(&device.key),
                // returned exactly once, at registration
                "secret": secret,
                "secret_created_at": device.secret_created_at,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_device(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.engine.remove_device(&key).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown device"})),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// Check-in endpoint

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: Option<String>,
    iat: Option<i64>,
}

/// Decode the payload of a provider-issued JWT without verifying it.
/// Signature verification happens upstream at the ingress; this handler
/// only needs the claimed identity and the issuance time.
fn decode_token_claims(token: &str) -> Result<TokenClaims, ApsisError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(ApsisError::BadRequest("malformed token".to_string()));
    };

    let bytes = Base64UrlUnpadded::decode_vec(payload)
        .map_err(|_| ApsisError::BadRequest("malformed token payload".to_string()))?;
    let claims: TokenClaims = serde_json::from_slice(&bytes)
        .map_err(|_| ApsisError::BadRequest("malformed token claims".to_string()))?;

    Ok(claims)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn device_checkin(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing bearer token"})),
        )
            .into_response();
    };

    let claims = match decode_token_claims(token) {
        Ok(claims) => claims,
        Err(e) => return error_response(e),
    };

    let (Some(sub), Some(iat)) = (claims.sub, claims.iat) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "token missing sub or iat claim"})),
        )
            .into_response();
    };

    // The token's subject is the external client id derived from the key
    let Some(key) = sub.strip_prefix("device-") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "subject is not a device client"})),
        )
            .into_response();
    };

    let device = match storage::get_device_by_key(state.engine.db(), key).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "unknown device"})),
            )
                .into_response()
        }
        Err(e) => return error_response(e),
    };

    let completed = match state.engine.check_rotation_completion(key, iat).await {
        Ok(completed) => completed,
        Err(e) => return error_response(e),
    };

    // Re-read: completion (and chain rotation) may have advanced state
    let rotation_state = match storage::get_device_by_key(state.engine.db(), key).await {
        Ok(Some(d)) => d.rotation_state,
        Ok(None) => device.rotation_state,
        Err(e) => return error_response(e),
    };

    let now = Utc::now().timestamp();
    let body: Value = json!({
        "completed": completed,
        "rotation_state": rotation_state.as_str(),
        "secret_age_secs": now - device.secret_created_at,
    });
    (StatusCode::OK, Json(body)).into_response()
}

// Job endpoints

async fn trigger_job(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    match jobs::trigger_job_manually(&state.engine, &name).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "completed"}))).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(claims: &serde_json::Value) -> String {
        let header = Base64UrlUnpadded::encode_string(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = Base64UrlUnpadded::encode_string(claims.to_string().as_bytes());
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn test_decode_token_claims() {
        let token = make_token(&json!({"sub": "device-gw-0042", "iat": 1748700000}));
        let claims = decode_token_claims(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("device-gw-0042"));
        assert_eq!(claims.iat, Some(1748700000));
    }

    #[test]
    fn test_decode_token_missing_claims() {
        let token = make_token(&json!({"aud": "fleet"}));
        let claims = decode_token_claims(&token).unwrap();
        assert!(claims.sub.is_none());
        assert!(claims.iat.is_none());
    }

    #[test]
    fn test_decode_token_rejects_garbage() {
        assert!(decode_token_claims("not-a-token").is_err());
        assert!(decode_token_claims("a.b").is_err());
        assert!(decode_token_claims("a.!!!.c").is_err());
    }
}
