// Pending Execution Store
//
// Holds the state of executions paused at a wait_for_reply step, keyed by
// the owning conversation. The store is the single synchronization point for
// per-conversation ordering: `take` removes and returns an entry in one
// atomic step, so a racing resume and expiry can never both claim the same
// execution. Backends must preserve that guarantee.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::storage::{StorageError, StorageResult};

/// Everything a resume needs to pick an execution back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingExecution {
    pub execution_id: Uuid,
    pub automation_id: Uuid,
    pub automation_version: i32,
    pub conversation_id: Uuid,
    pub channel_id: Uuid,
    pub contact_id: Uuid,
    /// The wait_for_reply step the execution is parked on.
    pub waiting_step_id: String,
    pub bindings: HashMap<String, String>,
    pub paused_at: DateTime<Utc>,
    pub resume_deadline: DateTime<Utc>,
}

impl PendingExecution {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.resume_deadline <= now
    }
}

#[async_trait]
pub trait PendingExecutionStore: Send + Sync {
    async fn put(&self, state: PendingExecution) -> StorageResult<()>;
    async fn get(&self, conversation_id: Uuid) -> StorageResult<Option<PendingExecution>>;
    /// Atomically fetch and remove. Exactly one of any number of concurrent
    /// callers observes the entry.
    async fn take(&self, conversation_id: Uuid) -> StorageResult<Option<PendingExecution>>;
    async fn remove(&self, conversation_id: Uuid) -> StorageResult<()>;
    async fn list_all(&self) -> StorageResult<Vec<PendingExecution>>;

    async fn has_pending(&self, conversation_id: Uuid) -> StorageResult<bool> {
        Ok(self.get(conversation_id).await?.is_some())
    }
}

/// Single-process store: a lock-guarded map. `take` holds the write lock
/// across lookup and removal, which is the whole atomicity argument.
#[derive(Default)]
pub struct MemoryPendingStore {
    entries: RwLock<HashMap<Uuid, PendingExecution>>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingExecutionStore for MemoryPendingStore {
    async fn put(&self, state: PendingExecution) -> StorageResult<()> {
        self.entries.write().await.insert(state.conversation_id, state);
        Ok(())
    }

    async fn get(&self, conversation_id: Uuid) -> StorageResult<Option<PendingExecution>> {
        Ok(self.entries.read().await.get(&conversation_id).cloned())
    }

    async fn take(&self, conversation_id: Uuid) -> StorageResult<Option<PendingExecution>> {
        Ok(self.entries.write().await.remove(&conversation_id))
    }

    async fn remove(&self, conversation_id: Uuid) -> StorageResult<()> {
        self.entries.write().await.remove(&conversation_id);
        Ok(())
    }

    async fn list_all(&self) -> StorageResult<Vec<PendingExecution>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }
}

/// Multi-instance store backed by the `pending_executions` table.
///
/// `take` is a single `DELETE ... RETURNING` statement, so concurrent
/// callers race on the row delete and exactly one gets the state back.
pub struct PgPendingStore {
    pool: PgPool,
}

impl PgPendingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(state: serde_json::Value) -> StorageResult<PendingExecution> {
        serde_json::from_value(state)
            .map_err(|e| StorageError::Database(format!("corrupt pending state: {}", e)))
    }
}

#[async_trait]
impl PendingExecutionStore for PgPendingStore {
    async fn put(&self, state: PendingExecution) -> StorageResult<()> {
        let payload = serde_json::to_value(&state)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO pending_executions (conversation_id, execution_id, state, resume_deadline, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (conversation_id)
            DO UPDATE SET execution_id = $2, state = $3, resume_deadline = $4
            "#,
        )
        .bind(state.conversation_id)
        .bind(state.execution_id)
        .bind(payload)
        .bind(state.resume_deadline)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, conversation_id: Uuid) -> StorageResult<Option<PendingExecution>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT state FROM pending_executions WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(state,)| Self::decode(state)).transpose()
    }

    async fn take(&self, conversation_id: Uuid) -> StorageResult<Option<PendingExecution>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "DELETE FROM pending_executions WHERE conversation_id = $1 RETURNING state",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(state,)| Self::decode(state)).transpose()
    }

    async fn remove(&self, conversation_id: Uuid) -> StorageResult<()> {
        sqlx::query("DELETE FROM pending_executions WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_all(&self) -> StorageResult<Vec<PendingExecution>> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT state FROM pending_executions ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|(state,)| Self::decode(state)).collect()
    }
}
