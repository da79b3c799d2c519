use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct WsConnection {
    pub id: Uuid,
    /// Conversations this client asked for; empty set means everything.
    pub conversations: HashSet<Uuid>,
    pub sender: broadcast::Sender<WsMessage>,
}

#[derive(Clone)]
pub struct WsManager {
    connections: Arc<RwLock<HashMap<Uuid, WsConnection>>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_connection(&self, conn: WsConnection) {
        let mut connections = self.connections.write().await;
        connections.insert(conn.id, conn);
    }

    pub async fn remove_connection(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        connections.remove(id);
    }

    pub async fn subscribe(&self, connection_id: &Uuid, conversation_id: Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(connection_id) {
            conn.conversations.insert(conversation_id);
        }
    }

    pub async fn broadcast_to_conversation(&self, conversation_id: Uuid, message: WsMessage) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            if conn.conversations.is_empty() || conn.conversations.contains(&conversation_id) {
                let _ = conn.sender.send(message.clone());
            }
        }
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    let (tx, mut rx) = broadcast::channel(100);

    let connection = WsConnection {
        id: connection_id,
        conversations: HashSet::new(),
        sender: tx.clone(),
    };

    state.ws_manager.add_connection(connection).await;

    let _ = sender
        .send(Message::Text(
            serde_json::json!({
                "event_type": "connected",
                "payload": { "connection_id": connection_id }
            })
            .to_string(),
        ))
        .await;

    let mut send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Ok(ws_msg) = serde_json::from_str::<WsMessage>(&text) {
                        handle_client_message(&state_clone, connection_id, ws_msg).await;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    state.ws_manager.remove_connection(&connection_id).await;
}

async fn handle_client_message(state: &Arc<AppState>, connection_id: Uuid, message: WsMessage) {
    match message.event_type.as_str() {
        "subscribe" => {
            if let Some(conversation_id) = message
                .payload
                .get("conversation_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                state.ws_manager.subscribe(&connection_id, conversation_id).await;
                tracing::info!(
                    "Connection {} subscribed to conversation {}",
                    connection_id,
                    conversation_id
                );
            }
        }
        "ping" => {
            let connections = state.ws_manager.connections.read().await;
            if let Some(conn) = connections.get(&connection_id) {
                let _ = conn.sender.send(WsMessage {
                    event_type: "pong".to_string(),
                    payload: serde_json::json!({}),
                    timestamp: chrono::Utc::now(),
                });
            }
        }
        _ => {
            tracing::warn!("Unknown message type: {}", message.event_type);
        }
    }
}
