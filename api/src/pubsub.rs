use std::sync::Arc;

use uuid::Uuid;

use crate::error::StoreError;
use crate::kv::{KeyValueStore, Subscription};
use crate::models::PlaybackSnapshot;

fn channel_name(owner_id: Uuid) -> String {
    format!("track:updates:{}", owner_id)
}

/// Per-owner fan-out of track changes to live viewers.
///
/// Delivery is at-most-once with no history: a viewer subscribing after a
/// publish never sees it and relies on the cached snapshot instead.
#[derive(Clone)]
pub struct TrackBroadcaster {
    store: Arc<dyn KeyValueStore>,
}

impl TrackBroadcaster {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns the number of subscribers reached.
    pub async fn publish(
        &self,
        owner_id: Uuid,
        snapshot: &PlaybackSnapshot,
    ) -> Result<usize, StoreError> {
        let payload = serde_json::to_string(snapshot)?;
        let reached = self.store.publish(&channel_name(owner_id), payload).await?;
        tracing::debug!(
            "published {} for {} to {} viewers",
            snapshot.track_id,
            owner_id,
            reached
        );
        Ok(reached)
    }

    pub async fn subscribe(&self, owner_id: Uuid) -> Result<TrackSubscription, StoreError> {
        let inner = self.store.subscribe(&channel_name(owner_id)).await?;
        Ok(TrackSubscription { owner_id, inner })
    }
}

/// Snapshots published for one owner from the moment of subscribing.
#[derive(Debug)]
pub struct TrackSubscription {
    owner_id: Uuid,
    inner: Subscription,
}

impl TrackSubscription {
    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    /// Next snapshot, or `None` once closed. Payloads that fail to decode
    /// are skipped.
    pub async fn next(&mut self) -> Option<PlaybackSnapshot> {
        loop {
            let raw = self.inner.recv().await?;
            match serde_json::from_str(&raw) {
                Ok(snapshot) => return Some(snapshot),
                Err(e) => {
                    tracing::warn!("dropping undecodable update for {}: {}", self.owner_id, e)
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}
