mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::channel::mpsc;
use futures::StreamExt;
use listening_api::error::{AppError, StoreError};
use listening_api::kv::{KeyValueStore, MemoryStore, Subscription};
use listening_api::live::{self, CloseReason, LiveSession};
use listening_api::models::{PlaybackSnapshot, VisitMetadata};
use tokio::task::JoinHandle;
use uuid::Uuid;

use common::{harness, harness_over, harness_with, playing, test_config, user, Harness};

/// Store whose key reads and renewals can be switched off while writes and
/// pub/sub keep working.
struct RenewalOutage {
    inner: Arc<MemoryStore>,
    down: AtomicBool,
}

impl RenewalOutage {
    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for RenewalOutage {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner.set_add(key, member, ttl).await
    }

    async fn set_touch(&self, key: &str, member: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.set_touch(key, member, ttl).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_remove(key, member).await
    }

    async fn set_card(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.set_card(key).await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.inner.subscribe(channel).await
    }
}

struct Client {
    inbound: mpsc::UnboundedReceiver<Message>,
    outbound: Option<mpsc::UnboundedSender<Result<Message, axum::Error>>>,
    session: JoinHandle<CloseReason>,
}

impl Client {
    /// Next snapshot the server pushed, skipping pings.
    async fn next_snapshot(&mut self) -> Option<PlaybackSnapshot> {
        while let Some(message) = self.inbound.next().await {
            if let Message::Text(text) = message {
                return Some(serde_json::from_str(&text).unwrap());
            }
        }
        None
    }

    async fn hang_up(mut self) -> CloseReason {
        self.outbound.take();
        self.session.await.unwrap()
    }
}

async fn connect(h: &Harness, profile_url: &str, visit_id: Uuid) -> Client {
    let visit = visit_id.to_string();
    let target = live::validate(h.state.repo.as_ref(), profile_url, Some(&visit))
        .await
        .unwrap();
    let session = LiveSession::new(&h.state, target);

    let (server_tx, inbound) = mpsc::unbounded();
    let (outbound, server_rx) = mpsc::unbounded();
    let session = tokio::spawn(session.stream(server_tx, server_rx));

    Client {
        inbound,
        outbound: Some(outbound),
        session,
    }
}

#[tokio::test]
async fn sends_the_cached_track_then_every_change() {
    let h = harness();
    let owner = user("dj");
    h.repo.add_user(owner.clone());
    h.state.cache.put(owner.id, &playing("t1")).await.unwrap();
    let visit = h
        .state
        .presence
        .begin_visit(owner.id, VisitMetadata::default())
        .await
        .unwrap();

    let mut client = connect(&h, "dj", visit).await;
    assert_eq!(client.next_snapshot().await, Some(playing("t1")));

    // Wait for the subscription to be registered before publishing
    while h.state.broadcaster.publish(owner.id, &playing("t2")).await.unwrap() == 0 {
        tokio::task::yield_now().await;
    }
    h.state
        .broadcaster
        .publish(owner.id, &playing("t3"))
        .await
        .unwrap();

    assert_eq!(client.next_snapshot().await, Some(playing("t2")));
    assert_eq!(client.next_snapshot().await, Some(playing("t3")));

    assert_eq!(client.hang_up().await, CloseReason::ClientClosed);
}

#[tokio::test]
async fn idle_cache_entry_is_not_sent_on_connect() {
    let h = harness();
    let owner = user("quiet");
    h.repo.add_user(owner.clone());
    h.state
        .cache
        .put(owner.id, &PlaybackSnapshot::idle())
        .await
        .unwrap();
    let visit = h
        .state
        .presence
        .begin_visit(owner.id, VisitMetadata::default())
        .await
        .unwrap();

    let mut client = connect(&h, "quiet", visit).await;
    while h.state.broadcaster.publish(owner.id, &playing("t1")).await.unwrap() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(client.next_snapshot().await, Some(playing("t1")));
    client.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_the_viewer_counted_and_expiry_cleans_up() {
    let h = harness();
    let owner = user("steady");
    h.repo.add_user(owner.clone());
    let visit = h
        .state
        .presence
        .begin_visit(owner.id, VisitMetadata::default())
        .await
        .unwrap();

    let client = connect(&h, "steady", visit).await;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.state.presence.active_count(owner.id).await.unwrap(), 1);
    }

    assert_eq!(client.hang_up().await, CloseReason::ClientClosed);

    // Closing does not end the visit; the entry lapses on its own
    assert_eq!(h.state.presence.active_count(owner.id).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(h.state.presence.active_count(owner.id).await.unwrap(), 0);
    assert!(h.repo.visit(visit).unwrap().ended_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn failing_renewals_do_not_end_the_session() {
    let store = Arc::new(MemoryStore::new());
    let outage = Arc::new(RenewalOutage {
        inner: store.clone(),
        down: AtomicBool::new(false),
    });
    let h = harness_over(test_config(), store, outage.clone());
    let owner = user("patchy");
    h.repo.add_user(owner.clone());
    let visit = h
        .state
        .presence
        .begin_visit(owner.id, VisitMetadata::default())
        .await
        .unwrap();

    let mut client = connect(&h, "patchy", visit).await;
    outage.down.store(true, Ordering::SeqCst);

    // Four heartbeat periods, every renewal failing
    tokio::time::sleep(Duration::from_secs(4 * 60 + 1)).await;
    assert!(!client.session.is_finished());

    while h.state.broadcaster.publish(owner.id, &playing("t1")).await.unwrap() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.next_snapshot().await, Some(playing("t1")));
    assert!(!client.session.is_finished());

    assert_eq!(client.hang_up().await, CloseReason::ClientClosed);
}

#[tokio::test]
async fn graceful_close_ends_the_visit_when_configured() {
    let mut config = test_config();
    config.end_visit_on_close = true;
    let h = harness_with(config);
    let owner = user("tidy");
    h.repo.add_user(owner.clone());
    let visit = h
        .state
        .presence
        .begin_visit(owner.id, VisitMetadata::default())
        .await
        .unwrap();

    let client = connect(&h, "tidy", visit).await;
    assert_eq!(client.hang_up().await, CloseReason::ClientClosed);

    assert_eq!(h.state.presence.active_count(owner.id).await.unwrap(), 0);
    assert!(h.repo.visit(visit).unwrap().ended_at.is_some());
}

#[tokio::test]
async fn transport_errors_leave_the_visit_to_expire() {
    let mut config = test_config();
    config.end_visit_on_close = true;
    let h = harness_with(config);
    let owner = user("abrupt");
    h.repo.add_user(owner.clone());
    let visit = h
        .state
        .presence
        .begin_visit(owner.id, VisitMetadata::default())
        .await
        .unwrap();

    let mut client = connect(&h, "abrupt", visit).await;
    if let Some(outbound) = client.outbound.as_mut() {
        outbound
            .unbounded_send(Err(axum::Error::new(std::io::Error::other("reset"))))
            .unwrap();
    }

    assert_eq!(client.session.await.unwrap(), CloseReason::TransportError);
    assert_eq!(h.state.presence.active_count(owner.id).await.unwrap(), 1);
    assert!(h.repo.visit(visit).unwrap().ended_at.is_none());
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let h = harness();
    let owner = user("late");
    h.repo.add_user(owner.clone());
    let visit = h
        .state
        .presence
        .begin_visit(owner.id, VisitMetadata::default())
        .await
        .unwrap();

    let client = connect(&h, "late", visit).await;
    h.state.shutdown.cancel();

    assert_eq!(client.session.await.unwrap(), CloseReason::Shutdown);
}

#[tokio::test]
async fn validation_rejects_bad_targets() {
    let h = harness();
    let owner = user("owner");
    let other = user("other");
    let mut private = user("private");
    private.is_sharing_enabled = false;
    let mut gone = user("gone");
    gone.is_active = false;
    for u in [&owner, &other, &private, &gone] {
        h.repo.add_user(u.clone());
    }
    let repo = h.state.repo.as_ref();

    let visit = h
        .state
        .presence
        .begin_visit(owner.id, VisitMetadata::default())
        .await
        .unwrap()
        .to_string();
    let other_visit = h
        .state
        .presence
        .begin_visit(other.id, VisitMetadata::default())
        .await
        .unwrap()
        .to_string();

    assert!(live::validate(repo, "owner", Some(&visit)).await.is_ok());

    let err = live::validate(repo, "nobody", Some(&visit)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = live::validate(repo, "gone", Some(&visit)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = live::validate(repo, "private", Some(&visit)).await.unwrap_err();
    assert!(matches!(err, AppError::SharingDisabled));

    let err = live::validate(repo, "owner", None).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let err = live::validate(repo, "owner", Some("not-a-uuid")).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let unknown = Uuid::new_v4().to_string();
    let err = live::validate(repo, "owner", Some(&unknown)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = live::validate(repo, "owner", Some(&other_visit)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    h.state
        .presence
        .end_visit(visit.parse().unwrap())
        .await
        .unwrap();
    let err = live::validate(repo, "owner", Some(&visit)).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));
}
