pub mod automations;
pub mod webhooks;

use axum::{response::IntoResponse, Json};

pub use automations::automation_routes;
pub use webhooks::webhook_routes;

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
