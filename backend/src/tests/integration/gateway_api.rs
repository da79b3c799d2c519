// WhatsAppApiService against a stubbed Graph API (wiremock): request shape,
// receipt extraction, media url resolution and error mapping.

use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::GraphApiConfig;
use crate::services::{GatewayError, MessagingGateway, WhatsAppApiService};
use crate::tests::helpers::test_channel;

fn service_for(server: &MockServer) -> WhatsAppApiService {
    WhatsAppApiService::new(GraphApiConfig {
        base_url: server.uri(),
        api_version: "v19.0".to_string(),
    })
}

#[tokio::test]
async fn test_send_message_posts_text_and_returns_receipt() {
    let server = MockServer::start().await;
    let channel = test_channel();

    Mock::given(method("POST"))
        .and(path(format!("/v19.0/{}/messages", channel.phone_number_id)))
        .and(header("authorization", "Bearer test-access-token"))
        .and(body_partial_json(serde_json::json!({
            "messaging_product": "whatsapp",
            "to": "15551234567",
            "type": "text",
            "text": { "body": "hi there" },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messaging_product": "whatsapp",
            "contacts": [{ "wa_id": "15551234567" }],
            "messages": [{ "id": "wamid.SENT1" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = service_for(&server)
        .send_message(&channel, "15551234567", "hi there")
        .await
        .unwrap();

    assert_eq!(receipt, "wamid.SENT1");
}

#[tokio::test]
async fn test_send_template_includes_positional_parameters() {
    let server = MockServer::start().await;
    let channel = test_channel();

    Mock::given(method("POST"))
        .and(path(format!("/v19.0/{}/messages", channel.phone_number_id)))
        .and(body_partial_json(serde_json::json!({
            "type": "template",
            "template": {
                "name": "order_update",
                "components": [{
                    "type": "body",
                    "parameters": [
                        { "type": "text", "text": "Ana" },
                        { "type": "text", "text": "tomorrow" }
                    ]
                }]
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [{ "id": "wamid.TPL1" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = service_for(&server)
        .send_template(
            &channel,
            "15551234567",
            "order_update",
            &["Ana".to_string(), "tomorrow".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(receipt, "wamid.TPL1");
}

#[tokio::test]
async fn test_provider_error_maps_to_api_error() {
    let server = MockServer::start().await;
    let channel = test_channel();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": { "message": "Invalid parameter", "code": 100 }
        })))
        .mount(&server)
        .await;

    let result = service_for(&server)
        .send_message(&channel, "15551234567", "hi")
        .await;

    match result {
        Err(GatewayError::Api { status, body }) => {
            assert_eq!(status, 400);
            assert!(body.contains("Invalid parameter"));
        }
        other => panic!("expected Api error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_receipt_is_a_typed_error() {
    let server = MockServer::start().await;
    let channel = test_channel();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": []
        })))
        .mount(&server)
        .await;

    let result = service_for(&server)
        .send_message(&channel, "15551234567", "hi")
        .await;

    assert!(matches!(result, Err(GatewayError::MissingReceipt)));
}

#[tokio::test]
async fn test_fetch_media_url_resolves_temporary_link() {
    let server = MockServer::start().await;
    let channel = test_channel();

    Mock::given(method("GET"))
        .and(path("/v19.0/media-42"))
        .and(header("authorization", "Bearer test-access-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "url": "https://lookaside.example/media-42",
            "mime_type": "image/jpeg",
            "id": "media-42"
        })))
        .mount(&server)
        .await;

    let url = service_for(&server)
        .fetch_media_url(&channel, "media-42")
        .await
        .unwrap();

    assert_eq!(url, "https://lookaside.example/media-42");
}
