// WhatsApp Cloud API gateway.
//
// All outbound traffic to the provider goes through the MessagingGateway
// trait; the engine and dispatcher never talk HTTP themselves. Send failures
// surface as typed errors the engine maps to a failed execution.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use ondas_shared::Channel;

use crate::config::GraphApiConfig;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("provider response missing delivery receipt id")]
    MissingReceipt,
    #[error("provider response missing media url")]
    MissingMediaUrl,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send a plain text message; returns the provider delivery receipt id.
    async fn send_message(
        &self,
        channel: &Channel,
        to: &str,
        content: &str,
    ) -> Result<String, GatewayError>;

    /// Send an approved template with positional body parameters.
    async fn send_template(
        &self,
        channel: &Channel,
        to: &str,
        template_name: &str,
        variables: &[String],
    ) -> Result<String, GatewayError>;

    /// Resolve a temporary download URL for an inbound media id.
    async fn fetch_media_url(
        &self,
        channel: &Channel,
        media_id: &str,
    ) -> Result<String, GatewayError>;
}

pub struct WhatsAppApiService {
    client: reqwest::Client,
    config: GraphApiConfig,
}

impl WhatsAppApiService {
    pub fn new(config: GraphApiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn post_message(
        &self,
        channel: &Channel,
        body: JsonValue,
    ) -> Result<String, GatewayError> {
        let url = self.config.messages_url(&channel.phone_number_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&channel.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        let status = response.status();
        let payload: JsonValue = if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| GatewayError::Request(e.to_string()))?
        } else {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        };

        payload
            .get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("id"))
            .and_then(|id| id.as_str())
            .map(|id| id.to_string())
            .ok_or(GatewayError::MissingReceipt)
    }
}

#[async_trait]
impl MessagingGateway for WhatsAppApiService {
    async fn send_message(
        &self,
        channel: &Channel,
        to: &str,
        content: &str,
    ) -> Result<String, GatewayError> {
        debug!(to = to, "sending text message");
        self.post_message(
            channel,
            serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": { "body": content },
            }),
        )
        .await
    }

    async fn send_template(
        &self,
        channel: &Channel,
        to: &str,
        template_name: &str,
        variables: &[String],
    ) -> Result<String, GatewayError> {
        debug!(to = to, template = template_name, "sending template message");
        let parameters: Vec<JsonValue> = variables
            .iter()
            .map(|v| serde_json::json!({ "type": "text", "text": v }))
            .collect();

        let mut template = serde_json::json!({
            "name": template_name,
            "language": { "code": "en_US" },
        });
        if !parameters.is_empty() {
            template["components"] = serde_json::json!([
                { "type": "body", "parameters": parameters }
            ]);
        }

        self.post_message(
            channel,
            serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "template",
                "template": template,
            }),
        )
        .await
    }

    async fn fetch_media_url(
        &self,
        channel: &Channel,
        media_id: &str,
    ) -> Result<String, GatewayError> {
        let url = self.config.media_url(media_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&channel.access_token)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: JsonValue = response
            .json()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        payload
            .get("url")
            .and_then(|u| u.as_str())
            .map(|u| u.to_string())
            .ok_or(GatewayError::MissingMediaUrl)
    }
}
