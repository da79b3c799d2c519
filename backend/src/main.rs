use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod automations;
mod config;
mod database;
mod dispatch;
mod error;
mod events;
mod handlers;
mod jobs;
mod notifications;
mod services;
mod storage;
mod websocket;

pub use error::{ApiError, ApiResult, AppError};

#[cfg(test)]
mod tests;

use automations::{ExecutionEngine, PendingExecutionStore, PgPendingStore};
use dispatch::Dispatcher;
use notifications::WsSink;
use services::WhatsAppApiService;
use storage::{PgStorage, Storage};

pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub pending: Arc<dyn PendingExecutionStore>,
    pub engine: Arc<ExecutionEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub ws_manager: websocket::WsManager,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let ws_manager = websocket::WsManager::new();
    let storage: Arc<dyn Storage> = Arc::new(PgStorage::new(db_pool.clone()));
    let pending: Arc<dyn PendingExecutionStore> = Arc::new(PgPendingStore::new(db_pool));
    let gateway = Arc::new(WhatsAppApiService::new(config.graph_api.clone()));
    let notifier = Arc::new(WsSink::new(ws_manager.clone()));

    let engine = Arc::new(ExecutionEngine::new(
        storage.clone(),
        gateway.clone(),
        pending.clone(),
        notifier.clone(),
        config.automation.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        storage.clone(),
        gateway,
        engine.clone(),
        pending.clone(),
        notifier,
    ));

    let scheduler = jobs::JobScheduler::new(engine.clone(), config.automation.clone()).await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        storage,
        pending,
        engine,
        dispatcher,
        ws_manager,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Ondas Messaging Platform API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/webhook", handlers::webhook_routes())
        .nest("/api/v1/automations", handlers::automation_routes())
        .route("/ws", get(websocket::websocket_handler))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
