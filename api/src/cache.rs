use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::kv::KeyValueStore;
use crate::models::PlaybackSnapshot;

fn cache_key(owner_id: Uuid) -> String {
    format!("track:current:{}", owner_id)
}

/// Most recent playing snapshot per owner, kept for a short absolute window.
#[derive(Clone)]
pub struct NowPlayingCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl NowPlayingCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Replace the owner's entry wholesale and restart its expiry.
    pub async fn put(&self, owner_id: Uuid, snapshot: &PlaybackSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))?;
        self.store
            .set_ex(&cache_key(owner_id), payload, self.ttl)
            .await
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))
    }

    pub async fn get(&self, owner_id: Uuid) -> Result<Option<PlaybackSnapshot>> {
        let payload = self
            .store
            .get(&cache_key(owner_id))
            .await
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))?;

        match payload {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| AppError::CacheUnavailable(format!("corrupt entry: {}", e))),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get), with an unavailable cache reported as a miss.
    pub async fn lookup(&self, owner_id: Uuid) -> Option<PlaybackSnapshot> {
        match self.get(owner_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("treating cache failure for {} as a miss: {}", owner_id, e);
                None
            }
        }
    }
}
