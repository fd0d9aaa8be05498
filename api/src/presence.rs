use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, Result, StoreError};
use crate::kv::KeyValueStore;
use crate::models::{ProfileVisit, VisitMetadata};
use crate::repo::Repository;

fn visitor_key(visit_id: Uuid) -> String {
    format!("visitor:{}", visit_id)
}

fn active_set_key(owner_id: Uuid) -> String {
    format!("visitors:{}", owner_id)
}

/// Approximate "who is watching right now" per owner.
///
/// Each visit holds a sliding-expiry entry that live sessions renew. A viewer
/// that vanishes without ending its visit stays counted until the window
/// lapses.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn KeyValueStore>,
    repo: Arc<dyn Repository>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, repo: Arc<dyn Repository>, ttl: Duration) -> Self {
        Self { store, repo, ttl }
    }

    /// Record the visit durably and mark it active. Only the audit insert
    /// can fail the call.
    pub async fn begin_visit(&self, owner_id: Uuid, metadata: VisitMetadata) -> Result<Uuid> {
        let visit = ProfileVisit {
            id: Uuid::new_v4(),
            user_id: owner_id,
            visitor_ip: metadata.visitor_ip,
            visitor_user_id: metadata.visitor_user_id,
            user_agent: metadata.user_agent,
            referrer_url: metadata.referrer_url,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.repo.insert_visit(&visit).await?;

        if let Err(e) = self
            .store
            .set_ex(&visitor_key(visit.id), owner_id.to_string(), self.ttl)
            .await
        {
            tracing::warn!("failed to set visitor key for {}: {}", visit.id, e);
        }
        if let Err(e) = self
            .store
            .set_add(&active_set_key(owner_id), &visit.id.to_string(), self.ttl)
            .await
        {
            tracing::warn!("failed to add {} to active visitors: {}", visit.id, e);
        }

        tracing::debug!("visit {} started for {}", visit.id, owner_id);
        Ok(visit.id)
    }

    /// Push the visit's expiry out by a full window. Returns false when the
    /// visit already lapsed; a lapsed visit is never revived.
    pub async fn renew(&self, visit_id: Uuid) -> std::result::Result<bool, StoreError> {
        let Some(raw_owner) = self.store.get(&visitor_key(visit_id)).await? else {
            return Ok(false);
        };
        let owner_id: Uuid = raw_owner.parse().map_err(|_| {
            StoreError::Unavailable(format!("corrupt visitor entry for {}", visit_id))
        })?;

        let key_live = self.store.expire(&visitor_key(visit_id), self.ttl).await?;
        let member_live = self
            .store
            .set_touch(&active_set_key(owner_id), &visit_id.to_string(), self.ttl)
            .await?;

        Ok(key_live && member_live)
    }

    /// Close the audit record and drop the visit from the active set now.
    pub async fn end_visit(&self, visit_id: Uuid) -> Result<()> {
        let visit = self
            .repo
            .visit_by_id(visit_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("visit {}", visit_id)))?;

        self.repo.end_visit(visit_id, Utc::now()).await?;

        if let Err(e) = self
            .store
            .set_remove(&active_set_key(visit.user_id), &visit_id.to_string())
            .await
        {
            tracing::warn!("failed to remove {} from active visitors: {}", visit_id, e);
        }
        if let Err(e) = self.store.delete(&visitor_key(visit_id)).await {
            tracing::warn!("failed to delete visitor key {}: {}", visit_id, e);
        }

        tracing::debug!("visit {} ended", visit_id);
        Ok(())
    }

    pub async fn active_count(&self, owner_id: Uuid) -> std::result::Result<usize, StoreError> {
        self.store.set_card(&active_set_key(owner_id)).await
    }
}
