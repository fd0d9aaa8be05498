use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::NowPlayingCache;
use crate::error::{AppError, Result};
use crate::history::{self, HistoryOutcome};
use crate::models::{PlaybackSnapshot, User};
use crate::pubsub::TrackBroadcaster;
use crate::repo::Repository;
use crate::spotify::SpotifyApi;
use crate::users;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve a cached playing snapshot when one exists.
    Cached,
    /// Always ask the provider.
    Live,
}

/// Produces an owner's current snapshot while keeping upstream calls low and
/// the cache, history and live viewers in step.
///
/// There is no retry loop here; callers decide whether to try again.
#[derive(Clone)]
pub struct RefreshOrchestrator {
    repo: Arc<dyn Repository>,
    spotify: Arc<dyn SpotifyApi>,
    cache: NowPlayingCache,
    broadcaster: TrackBroadcaster,
    token_margin: Duration,
}

impl RefreshOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        spotify: Arc<dyn SpotifyApi>,
        cache: NowPlayingCache,
        broadcaster: TrackBroadcaster,
        token_margin: Duration,
    ) -> Self {
        Self {
            repo,
            spotify,
            cache,
            broadcaster,
            token_margin,
        }
    }

    pub async fn refresh(&self, owner_id: Uuid, freshness: Freshness) -> Result<PlaybackSnapshot> {
        let mut user = self
            .repo
            .user_by_id(owner_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", owner_id)))?;
        self.refresh_user(&mut user, freshness).await
    }

    /// Same as [`refresh`](Self::refresh) for an already loaded owner. A
    /// token refresh is written back into `user`.
    pub async fn refresh_user(
        &self,
        user: &mut User,
        freshness: Freshness,
    ) -> Result<PlaybackSnapshot> {
        if !user.is_sharing_enabled {
            return Err(AppError::SharingDisabled);
        }

        if freshness == Freshness::Cached {
            if let Some(cached) = self.cache.lookup(user.id).await {
                if cached.is_playing {
                    tracing::debug!("serving cached snapshot for {}", user.id);
                    return Ok(cached);
                }
            }
        }

        self.ensure_fresh_token(user).await?;

        let snapshot = self
            .spotify
            .fetch_current_playback(&user.spotify_access_token)
            .await
            .map_err(|e| {
                tracing::warn!("playback poll failed for {}: {}", user.id, e);
                AppError::UpstreamUnavailable(e.to_string())
            })?;

        if snapshot.is_playing {
            self.record_playing(user.id, &snapshot).await;
        }

        Ok(snapshot)
    }

    async fn ensure_fresh_token(&self, user: &mut User) -> Result<()> {
        if !users::token_needs_refresh(user, Utc::now(), self.token_margin) {
            return Ok(());
        }

        tracing::debug!("refreshing provider token for {}", user.id);
        let tokens = self
            .spotify
            .refresh_token(&user.spotify_refresh_token)
            .await
            .map_err(|e| {
                tracing::error!("token refresh failed for {}: {}", user.id, e);
                AppError::AuthFailed(e.to_string())
            })?;

        let now = Utc::now();
        user.spotify_access_token = tokens.access_token;
        if let Some(refresh) = tokens.refresh_token {
            user.spotify_refresh_token = refresh;
        }
        user.token_expires_at = now + chrono::Duration::seconds(tokens.expires_in);
        user.updated_at = now;

        // The fresh token is still usable for this poll if persisting fails
        if let Err(e) = self
            .repo
            .update_user_tokens(
                user.id,
                &user.spotify_access_token,
                &user.spotify_refresh_token,
                user.token_expires_at,
            )
            .await
        {
            tracing::error!("failed to persist refreshed token for {}: {}", user.id, e);
        }

        Ok(())
    }

    /// Cache, record and announce a playing snapshot. Every step is best
    /// effort; only a track change is announced.
    async fn record_playing(&self, owner_id: Uuid, snapshot: &PlaybackSnapshot) {
        let previous = self.cache.lookup(owner_id).await;
        if let Err(e) = self.cache.put(owner_id, snapshot).await {
            tracing::warn!("failed to cache snapshot for {}: {}", owner_id, e);
        }

        let changed = match history::save_track(self.repo.as_ref(), owner_id, snapshot, Utc::now())
            .await
        {
            Ok(outcome) => outcome == HistoryOutcome::Started,
            Err(e) => {
                tracing::warn!("failed to save history for {}: {}", owner_id, e);
                // Fall back to the cached track to tell a change from a repeat
                previous.map_or(true, |prev| prev.track_id != snapshot.track_id)
            }
        };

        if changed {
            if let Err(e) = self.broadcaster.publish(owner_id, snapshot).await {
                tracing::warn!("failed to publish track change for {}: {}", owner_id, e);
            }
        }
    }
}
