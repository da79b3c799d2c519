// HTTP-level tests for the webhook boundary and the operational automation
// endpoints, driven through the real router with in-memory state.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::get,
    Router,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tower::ServiceExt;

use crate::automations::PendingExecutionStore;
use crate::storage::Storage;
use crate::tests::fixtures::*;
use crate::tests::helpers::TestPlatform;
use crate::{handlers, websocket, AppState};

const CONTACT: &str = "15551234567";

fn test_app(platform: &TestPlatform) -> Router {
    let storage: Arc<dyn Storage> = platform.storage.clone();
    let pending: Arc<dyn PendingExecutionStore> = platform.pending.clone();
    let state = Arc::new(AppState {
        storage,
        pending,
        engine: platform.engine.clone(),
        dispatcher: platform.dispatcher.clone(),
        ws_manager: websocket::WsManager::new(),
    });

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/webhook", handlers::webhook_routes())
        .nest("/api/v1/automations", handlers::automation_routes())
        .with_state(state)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn post_json(uri: &str, payload: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(payload).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn test_verification_handshake_echoes_challenge() {
    let platform = TestPlatform::new().await;
    platform
        .storage
        .add_webhook_config(webhook_config_fixture("secret-token", None))
        .await;
    let app = test_app(&platform);

    let request = Request::builder()
        .uri("/webhook?hub.mode=subscribe&hub.challenge=12345&hub.verify_token=secret-token")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "12345");
}

#[tokio::test]
async fn test_verification_handshake_rejects_wrong_token() {
    let platform = TestPlatform::new().await;
    platform
        .storage
        .add_webhook_config(webhook_config_fixture("secret-token", None))
        .await;
    let app = test_app(&platform);

    let request = Request::builder()
        .uri("/webhook?hub.mode=subscribe&hub.challenge=12345&hub.verify_token=wrong")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_malformed_event_body_is_still_acknowledged() {
    let platform = TestPlatform::new().await;
    let app = test_app(&platform);

    let request = Request::builder()
        .uri("/webhook")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(malformed_payload()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    // Unparseable input never bubbles an error back to the provider.
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(platform.message_count().await, 0);
}

#[tokio::test]
async fn test_event_post_records_message_and_acknowledges() {
    let platform = TestPlatform::new().await;
    platform.seed_conversation(CONTACT).await;
    let app = test_app(&platform);

    let response = app
        .oneshot(post_json(
            "/webhook",
            &text_message_payload(CONTACT, "wamid.http.1", "hello over http"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "EVENT_RECEIVED");
    assert_eq!(platform.message_count().await, 1);
}

#[tokio::test]
async fn test_signature_is_enforced_when_secret_configured() {
    let platform = TestPlatform::new().await;
    platform.seed_conversation(CONTACT).await;
    platform
        .storage
        .add_webhook_config(webhook_config_fixture("secret-token", Some("app-secret")))
        .await;

    let payload = text_message_payload(CONTACT, "wamid.sig.1", "signed hello");
    let body = serde_json::to_vec(&payload).unwrap();

    // Without a signature: rejected.
    let app = test_app(&platform);
    let request = Request::builder()
        .uri("/webhook")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // With a valid signature: accepted and processed.
    let mut mac = Hmac::<Sha256>::new_from_slice(b"app-secret").unwrap();
    mac.update(&body);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let app = test_app(&platform);
    let request = Request::builder()
        .uri("/webhook")
        .method("POST")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", signature)
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(platform.message_count().await, 1);
}

#[tokio::test]
async fn test_pending_listing_and_cancel_endpoints() {
    let platform = TestPlatform::new().await;
    let conversation = platform.seed_conversation(CONTACT).await;
    platform
        .storage
        .add_automation(greeting_automation(platform.channel.id))
        .await;
    platform.deliver(text_message_payload(CONTACT, "wamid.ops.1", "hello")).await;

    // Listing shows the paused execution.
    let app = test_app(&platform);
    let request = Request::builder()
        .uri("/api/v1/automations/pending")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(listed["total_count"], 1);

    // Conversation status endpoint agrees.
    let app = test_app(&platform);
    let request = Request::builder()
        .uri(&format!("/api/v1/automations/conversations/{}/status", conversation.id))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(status["has_pending_execution"], true);

    // Cancel releases it.
    let app = test_app(&platform);
    let request = Request::builder()
        .uri(&format!("/api/v1/automations/conversations/{}/cancel", conversation.id))
        .method("POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let cancelled: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(cancelled["success"], true);
    assert!(!platform.pending.has_pending(conversation.id).await.unwrap());
}

#[tokio::test]
async fn test_sweep_endpoint_with_timeout_override() {
    let platform = TestPlatform::new().await;
    platform.seed_conversation(CONTACT).await;
    platform
        .storage
        .add_automation(greeting_automation(platform.channel.id))
        .await;
    platform.deliver(text_message_payload(CONTACT, "wamid.sweep.1", "hello")).await;

    let app = test_app(&platform);
    let request = Request::builder()
        .uri("/api/v1/automations/sweep?timeout_minutes=0")
        .method("POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let report: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(report["cleaned_count"], 1);
}

#[tokio::test]
async fn test_health_endpoint() {
    let platform = TestPlatform::new().await;
    let app = test_app(&platform);

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let health: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(health["status"], "healthy");
}
