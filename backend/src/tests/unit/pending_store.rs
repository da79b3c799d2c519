// Unit tests for the pending execution store contract, in particular the
// exactly-once `take` guarantee under concurrency.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use tokio_test::assert_ok;

use crate::automations::{MemoryPendingStore, PendingExecution, PendingExecutionStore};

fn pending_entry(conversation_id: Uuid) -> PendingExecution {
    let now = Utc::now();
    PendingExecution {
        execution_id: Uuid::new_v4(),
        automation_id: Uuid::new_v4(),
        automation_version: 1,
        conversation_id,
        channel_id: Uuid::new_v4(),
        contact_id: Uuid::new_v4(),
        waiting_step_id: "step_wait".to_string(),
        bindings: HashMap::new(),
        paused_at: now,
        resume_deadline: now + Duration::minutes(30),
    }
}

#[tokio::test]
async fn test_put_get_remove_round_trip() {
    let store = MemoryPendingStore::new();
    let conversation_id = Uuid::new_v4();

    assert!(!store.has_pending(conversation_id).await.unwrap());

    store.put(pending_entry(conversation_id)).await.unwrap();
    assert!(store.has_pending(conversation_id).await.unwrap());
    assert_eq!(store.list_all().await.unwrap().len(), 1);

    let fetched = store.get(conversation_id).await.unwrap().unwrap();
    assert_eq!(fetched.conversation_id, conversation_id);
    // get does not consume
    assert!(store.has_pending(conversation_id).await.unwrap());

    store.remove(conversation_id).await.unwrap();
    assert!(!store.has_pending(conversation_id).await.unwrap());
}

#[tokio::test]
async fn test_take_consumes_the_entry() {
    let store = MemoryPendingStore::new();
    let conversation_id = Uuid::new_v4();
    store.put(pending_entry(conversation_id)).await.unwrap();

    assert!(store.take(conversation_id).await.unwrap().is_some());
    assert!(store.take(conversation_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_takes_yield_exactly_one_winner() {
    let store = Arc::new(MemoryPendingStore::new());
    let conversation_id = Uuid::new_v4();
    store.put(pending_entry(conversation_id)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.take(conversation_id).await.unwrap().is_some()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1, "exactly one concurrent take may succeed");
}

#[test]
fn test_put_is_keyed_by_conversation() {
    tokio_test::block_on(async {
        let store = MemoryPendingStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        tokio_test::assert_ok!(store.put(pending_entry(a)).await);
        tokio_test::assert_ok!(store.put(pending_entry(b)).await);

        assert_eq!(store.list_all().await.unwrap().len(), 2);
        assert!(store.take(a).await.unwrap().is_some());
        assert!(store.has_pending(b).await.unwrap());
    });
}

#[test]
fn test_expiry_check_uses_deadline() {
    let now = Utc::now();
    let mut entry = pending_entry(Uuid::new_v4());

    entry.resume_deadline = now - Duration::seconds(1);
    assert!(entry.is_expired_at(now));

    entry.resume_deadline = now + Duration::minutes(5);
    assert!(!entry.is_expired_at(now));
}
