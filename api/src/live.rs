//! Per-viewer live update sessions.
//!
//! A session moves `Connecting -> Validating -> Streaming -> Closed`. Failing
//! validation closes it before the websocket upgrade completes. While
//! streaming it relays every track change for the owner and keeps the
//! viewer's presence entry alive on a separate heartbeat task.
//!
//! A publish can reach a viewer before a concurrently connecting viewer sees
//! the matching cache write. Viewers converge on the next change, which is
//! acceptable for a live ticker.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::NowPlayingCache;
use crate::error::{AppError, Result};
use crate::models::{PlaybackSnapshot, User};
use crate::presence::PresenceTracker;
use crate::pubsub::TrackBroadcaster;
use crate::repo::Repository;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Validating,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The viewer sent a close frame or hung up.
    ClientClosed,
    /// Reading from or writing to the transport failed.
    TransportError,
    /// The owner's update subscription ended.
    SubscriptionEnded,
    /// Could not subscribe to the owner's updates at all.
    SubscribeFailed,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn is_graceful(self) -> bool {
        matches!(self, CloseReason::ClientClosed | CloseReason::Shutdown)
    }
}

/// The owner being watched and the visit watching it.
#[derive(Debug, Clone)]
pub struct LiveTarget {
    pub owner: User,
    pub visit_id: Uuid,
}

/// Check that the owner can be watched and the viewer holds a visit to it.
pub async fn validate(
    repo: &dyn Repository,
    profile_url: &str,
    visit_cookie: Option<&str>,
) -> Result<LiveTarget> {
    let owner = repo
        .user_by_profile_url(profile_url)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("profile {}", profile_url)))?;

    if !owner.is_active {
        return Err(AppError::NotFound(format!("profile {}", profile_url)));
    }
    if !owner.is_sharing_enabled {
        return Err(AppError::SharingDisabled);
    }

    let visit_id = visit_cookie
        .ok_or_else(|| AppError::Unauthorized("missing visit".to_string()))?
        .parse::<Uuid>()
        .map_err(|_| AppError::Unauthorized("invalid visit".to_string()))?;

    let visit = repo
        .visit_by_id(visit_id)
        .await?
        .filter(|visit| visit.user_id == owner.id)
        .ok_or_else(|| AppError::NotFound(format!("visit {}", visit_id)))?;

    if visit.ended_at.is_some() {
        return Err(AppError::Unauthorized("visit already ended".to_string()));
    }

    Ok(LiveTarget { owner, visit_id })
}

pub struct LiveSession {
    target: LiveTarget,
    state: SessionState,
    cache: NowPlayingCache,
    broadcaster: TrackBroadcaster,
    presence: PresenceTracker,
    heartbeat_interval: Duration,
    ping_interval: Duration,
    end_visit_on_close: bool,
    cancel: CancellationToken,
}

impl LiveSession {
    /// Run validation for an incoming connection.
    pub async fn open(
        app: &AppState,
        profile_url: &str,
        visit_cookie: Option<&str>,
    ) -> Result<Self> {
        tracing::debug!(
            "live session for {}: {:?} -> {:?}",
            profile_url,
            SessionState::Connecting,
            SessionState::Validating
        );

        match validate(app.repo.as_ref(), profile_url, visit_cookie).await {
            Ok(target) => Ok(Self::new(app, target)),
            Err(e) => {
                tracing::info!("rejected live session for {}: {}", profile_url, e);
                Err(e)
            }
        }
    }

    pub fn new(app: &AppState, target: LiveTarget) -> Self {
        Self {
            target,
            state: SessionState::Validating,
            cache: app.cache.clone(),
            broadcaster: app.broadcaster.clone(),
            presence: app.presence.clone(),
            heartbeat_interval: app.config.timings.heartbeat_interval,
            ping_interval: app.config.timings.ping_interval,
            end_visit_on_close: app.config.end_visit_on_close,
            cancel: app.shutdown.child_token(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            "live session {} for {}: {:?} -> {:?}",
            self.target.visit_id,
            self.target.owner.id,
            self.state,
            next
        );
        self.state = next;
    }

    pub async fn run(self, socket: WebSocket) -> CloseReason {
        let (tx, rx) = socket.split();
        self.stream(tx, rx).await
    }

    /// Drive the session over any message transport until it closes.
    pub async fn stream<Tx, Rx>(mut self, mut tx: Tx, mut rx: Rx) -> CloseReason
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: Display,
        Rx: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
    {
        self.transition(SessionState::Streaming);
        let owner_id = self.target.owner.id;
        let visit_id = self.target.visit_id;

        // Subscribe before reading the cache so no change slips between them
        let mut updates = match self.broadcaster.subscribe(owner_id).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::error!("failed to subscribe to updates for {}: {}", owner_id, e);
                return self.finish(CloseReason::SubscribeFailed).await;
            }
        };

        if let Some(snapshot) = self.cache.lookup(owner_id).await {
            if snapshot.is_playing && send_snapshot(&mut tx, &snapshot).await.is_err() {
                updates.close();
                return self.finish(CloseReason::TransportError).await;
            }
        }

        let heartbeat = tokio::spawn(heartbeat(
            self.presence.clone(),
            visit_id,
            self.heartbeat_interval,
            self.cancel.clone(),
        ));

        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break CloseReason::Shutdown,
                update = updates.next() => match update {
                    Some(snapshot) => {
                        if send_snapshot(&mut tx, &snapshot).await.is_err() {
                            break CloseReason::TransportError;
                        }
                    }
                    None => break CloseReason::SubscriptionEnded,
                },
                incoming = rx.next() => match incoming {
                    None | Some(Ok(Message::Close(_))) => break CloseReason::ClientClosed,
                    Some(Err(e)) => {
                        tracing::debug!("live session {} read failed: {}", visit_id, e);
                        break CloseReason::TransportError;
                    }
                    // Viewers only listen; anything they send is ignored
                    Some(Ok(_)) => {}
                },
                _ = ping.tick() => {
                    if let Err(e) = tx.send(Message::Ping(Vec::new())).await {
                        tracing::debug!("live session {} ping failed: {}", visit_id, e);
                        break CloseReason::TransportError;
                    }
                }
            }
        };

        updates.close();
        self.cancel.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!("heartbeat task for {} failed: {}", visit_id, e);
        }

        self.finish(reason).await
    }

    async fn finish(mut self, reason: CloseReason) -> CloseReason {
        self.cancel.cancel();

        if self.end_visit_on_close && reason.is_graceful() {
            if let Err(e) = self.presence.end_visit(self.target.visit_id).await {
                tracing::warn!("failed to end visit {}: {}", self.target.visit_id, e);
            }
        }

        self.transition(SessionState::Closed);
        tracing::info!(
            "live session {} for {} closed: {:?}",
            self.target.visit_id,
            self.target.owner.id,
            reason
        );
        reason
    }
}

async fn send_snapshot<Tx>(tx: &mut Tx, snapshot: &PlaybackSnapshot) -> std::result::Result<(), ()>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let payload = match serde_json::to_string(snapshot) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!("failed to encode snapshot: {}", e);
            return Ok(());
        }
    };

    tx.send(Message::Text(payload)).await.map_err(|e| {
        tracing::debug!("failed to write to live session: {}", e);
    })
}

/// Renew the visit every `period` until cancelled. Failures are logged and
/// never end the session.
async fn heartbeat(
    presence: PresenceTracker,
    visit_id: Uuid,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match presence.renew(visit_id).await {
                Ok(true) => tracing::trace!("renewed visit {}", visit_id),
                Ok(false) => tracing::debug!("visit {} already lapsed, not renewing", visit_id),
                Err(e) => tracing::warn!("failed to renew visit {}: {}", visit_id, e),
            },
        }
    }
}
