//! Redis binding tests. These need a live server; run them with
//! `cargo test -p catga-redis -- --ignored` against
//! `REDIS_URL` (default redis://127.0.0.1:6379).

use std::time::Duration;

use bytes::Bytes;

use catga_core::MessageId;
use catga_lock::DistributedLock;
use catga_outbox::{IdempotencyStore, InboxStore, OutboxMessage, OutboxStore};
use catga_redis::{RedisBackend, RedisIdempotencyStore, RedisInbox, RedisLock, RedisOutbox};

async fn backend() -> RedisBackend {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let prefix = format!("catga-test-{}", uuid::Uuid::new_v4());
    RedisBackend::connect_with_prefix(&url, &prefix).await.expect("redis reachable")
}

#[tokio::test]
#[ignore]
async fn lock_mutual_exclusion_and_token_checks() {
    let lock = RedisLock::new(backend().await);

    let handle = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap();
    assert!(handle.is_some());
    assert!(lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().is_none());

    let mut handle = handle.unwrap();
    handle.extend(Duration::from_secs(10)).await.unwrap();
    handle.release().await.unwrap();

    assert!(lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().is_some());
}

#[tokio::test]
#[ignore]
async fn idempotency_first_win_with_ttl() {
    let store = RedisIdempotencyStore::new(backend().await, Duration::from_secs(60));
    let id = MessageId::next();

    store.mark_processed(id, Bytes::from_static(b"first")).await.unwrap();
    store.mark_processed(id, Bytes::from_static(b"second")).await.unwrap();

    assert!(store.has_been_processed(id).await.unwrap());
    assert_eq!(
        store.get_cached_result(id).await.unwrap(),
        Some(Bytes::from_static(b"first"))
    );
}

#[tokio::test]
#[ignore]
async fn inbox_lock_and_processed_marker() {
    let inbox = RedisInbox::new(backend().await, Duration::from_secs(300));
    let id = MessageId::next();

    assert!(inbox.try_lock(id, Duration::from_secs(30)).await.unwrap());
    assert!(!inbox.try_lock(id, Duration::from_secs(30)).await.unwrap());

    let record = catga_outbox::InboxMessage::received(id, "Evt", Bytes::from_static(b"{}"))
        .processed(Some(Bytes::from_static(b"ok")));
    inbox.mark_processed(record).await.unwrap();

    assert!(inbox.has_been_processed(id).await.unwrap());
    assert!(!inbox.try_lock(id, Duration::from_secs(30)).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn outbox_round_trip_and_retry_accounting() {
    let outbox = RedisOutbox::new(backend().await);
    let message = OutboxMessage::new(MessageId::next(), "Evt", Bytes::from_static(b"{}"));
    let id = message.message_id;
    outbox.add(message).await.unwrap();

    let pending = outbox.get_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, id);

    assert_eq!(outbox.mark_failed(id, "broker down").await.unwrap(), 1);
    let pending = outbox.get_pending(10).await.unwrap();
    assert_eq!(pending[0].retry_count, 1);

    outbox.mark_published(id).await.unwrap();
    assert!(outbox.get_pending(10).await.unwrap().is_empty());

    let swept = outbox
        .sweep_published(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(swept, 1);
}
