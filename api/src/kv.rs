//! Expiring key/value store with sets and pub/sub.
//!
//! This is the only shared mutable state behind the cache, the presence
//! tracker and the track broadcaster. Every operation is atomic per key, so
//! callers never need their own locking.

use std::collections::HashMap;
use std::future::ready;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::ops::compute::{CompResult, Op};
use moka::Expiry;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::StoreError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Overwrite `key` with `value`, expiring `ttl` from now.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the expiry of a live key. Returns false (and does nothing) if
    /// the key is absent or already expired.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Add `member` to the set at `key` with its own expiry.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Reset the expiry of a live set member. Never re-adds an expired one.
    async fn set_touch(&self, key: &str, member: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Number of unexpired members of the set at `key`.
    async fn set_card(&self, key: &str) -> Result<usize, StoreError>;

    /// Deliver `payload` to every current subscriber of `channel` and return
    /// how many were reached.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Receiving end of a channel subscription.
///
/// Messages arrive in publish order and are buffered without bound until
/// read. Dropping or closing the handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx: Some(rx),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next published payload, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<String> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Unsubscribe and discard anything still buffered.
    pub fn close(&mut self) {
        self.rx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn new(value: String, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            expires_at: now + ttl,
            ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Default)]
struct MemberSet {
    members: HashMap<String, Instant>,
    /// Time until the last member lapses, as of the last write.
    ttl: Duration,
}

impl MemberSet {
    fn prune(&mut self, now: Instant) {
        self.members.retain(|_, expires_at| *expires_at > now);
    }

    fn live_count(&self, now: Instant) -> usize {
        self.members.values().filter(|at| **at > now).count()
    }

    /// Write back, or drop the set once nothing in it is left.
    fn into_op(mut self, now: Instant) -> Op<MemberSet> {
        if self.members.is_empty() {
            return Op::Remove;
        }
        self.ttl = self
            .members
            .values()
            .max()
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default();
        Op::Put(self)
    }
}

trait Lifetime {
    fn lifetime(&self) -> Duration;
}

impl Lifetime for Entry {
    fn lifetime(&self) -> Duration {
        self.ttl
    }
}

impl Lifetime for MemberSet {
    fn lifetime(&self) -> Duration {
        self.ttl
    }
}

/// Evicts each cache entry once the lifetime granted by its last write runs out.
struct LifetimeExpiry;

impl<V: Lifetime> Expiry<String, V> for LifetimeExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &V,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.lifetime())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &V,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.lifetime())
    }
}

/// Entry counts after pending evictions have run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub values: u64,
    pub sets: u64,
    pub subscribers: usize,
}

/// In-process store with native per-key and per-member TTLs.
///
/// Values and sets live in moka caches that evict each entry when its TTL
/// runs out. Reads also check the deadline against tokio's clock, so an
/// expired entry is never observed even before moka gets to it.
pub struct MemoryStore {
    values: MokaCache<String, Entry>,
    sets: MokaCache<String, MemberSet>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: MokaCache::builder().expire_after(LifetimeExpiry).build(),
            sets: MokaCache::builder().expire_after(LifetimeExpiry).build(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<String>>>>, StoreError>
    {
        self.channels
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.values.run_pending_tasks().await;
        self.sets.run_pending_tasks().await;
        let subscribers = self.channels()?.values().map(Vec::len).sum();

        Ok(StoreStats {
            values: self.values.entry_count(),
            sets: self.sets.entry_count(),
            subscribers,
        })
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let entry = Entry::new(value, ttl, Instant::now());
        self.values.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .values
            .get(key)
            .await
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .values
            .remove(key)
            .await
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let result = self
            .values
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current.map(|e| e.into_value()) {
                    Some(entry) if entry.is_live(now) => {
                        Op::Put(Entry::new(entry.value, ttl, now))
                    }
                    Some(_) => Op::Remove,
                    None => Op::Nop,
                };
                ready(op)
            })
            .await;
        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        self.sets
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let mut set = current.map(|e| e.into_value()).unwrap_or_default();
                set.prune(now);
                set.members.insert(member.to_string(), now + ttl);
                ready(set.into_op(now))
            })
            .await;
        Ok(())
    }

    async fn set_touch(&self, key: &str, member: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut touched = false;
        self.sets
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current.map(|e| e.into_value()) {
                    Some(mut set) => {
                        set.prune(now);
                        if let Some(expires_at) = set.members.get_mut(member) {
                            *expires_at = now + ttl;
                            touched = true;
                        }
                        set.into_op(now)
                    }
                    None => Op::Nop,
                };
                ready(op)
            })
            .await;
        Ok(touched)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut removed = false;
        self.sets
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current.map(|e| e.into_value()) {
                    Some(mut set) => {
                        removed = set
                            .members
                            .remove(member)
                            .is_some_and(|expires_at| expires_at > now);
                        set.prune(now);
                        set.into_op(now)
                    }
                    None => Op::Nop,
                };
                ready(op)
            })
            .await;
        Ok(removed)
    }

    async fn set_card(&self, key: &str) -> Result<usize, StoreError> {
        let now = Instant::now();
        Ok(self
            .sets
            .get(key)
            .await
            .map_or(0, |set| set.live_count(now)))
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        let mut channels = self.channels()?;
        let Some(subscribers) = channels.get_mut(channel) else {
            return Ok(0);
        };

        subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        let reached = subscribers.len();
        if reached == 0 {
            channels.remove(channel);
        }
        Ok(reached)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels()?;
        let subscribers = channels.entry(channel.to_string()).or_default();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.push(tx);
        Ok(Subscription::new(channel, rx))
    }
}
