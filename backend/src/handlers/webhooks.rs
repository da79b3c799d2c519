// Provider webhook boundary.
//
// The wire contract is fixed by the provider: a GET verification handshake
// (hub.mode / hub.challenge / hub.verify_token) and a POST event feed. The
// POST handler acknowledges with 200 whenever the body parsed at all,
// regardless of downstream automation or reconciliation outcome — provider
// retry behavior must stay decoupled from internal processing success.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ApiResult, AppError};
use crate::events::{normalize, parse_payload};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", get(verify_webhook).post(receive_webhook))
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
}

/// Subscription handshake: echo the challenge only when the token matches
/// the active webhook configuration.
async fn verify_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<String> {
    let (Some(mode), Some(challenge)) = (query.mode.as_deref(), query.challenge) else {
        return Err(AppError::BadRequest("missing hub.mode or hub.challenge".to_string()));
    };

    let config = state.storage.get_active_webhook_config().await?;

    match (mode, config) {
        ("subscribe", Some(config)) if query.verify_token.as_deref() == Some(&config.verify_token) => {
            info!("Webhook verified");
            state.storage.touch_webhook_config(config.id).await?;
            Ok(challenge)
        }
        _ => Err(AppError::VerificationFailed),
    }
}

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let config = state.storage.get_active_webhook_config().await?;

    if let Some(secret) = config.as_ref().and_then(|c| c.app_secret.as_deref()) {
        if !secret.is_empty() {
            verify_signature(secret, &headers, &body)?;
        }
    }

    if let Some(config) = &config {
        state.storage.touch_webhook_config(config.id).await?;
    }

    // Unparseable input is dropped, logged, and still acknowledged: an error
    // response here would only trigger a provider redelivery storm.
    let Some(payload) = parse_payload(&body) else {
        return Ok((StatusCode::OK, "EVENT_RECEIVED"));
    };

    let events = normalize(&payload);
    if events.is_empty() {
        return Ok((StatusCode::OK, "EVENT_RECEIVED"));
    }

    state.dispatcher.dispatch(events).await;

    Ok((StatusCode::OK, "EVENT_RECEIVED"))
}

/// X-Hub-Signature-256 check, enabled when the active configuration stores
/// an app secret.
fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    let provided = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("sha256="))
        .ok_or(AppError::SignatureMismatch)?;

    let digest = hex::decode(provided).map_err(|_| AppError::SignatureMismatch)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::InternalError(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&digest).map_err(|_| {
        warn!("webhook signature mismatch");
        AppError::SignatureMismatch
    })
}
