use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{PlaybackSnapshot, Track};
use crate::repo::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// A new track became the currently playing record.
    Started,
    /// The currently playing record already was this track; its timestamp moved.
    Continued,
}

/// Record that `snapshot` is playing for `owner_id`, keeping at most one
/// currently-playing row.
pub async fn save_track(
    repo: &dyn Repository,
    owner_id: Uuid,
    snapshot: &PlaybackSnapshot,
    now: DateTime<Utc>,
) -> Result<HistoryOutcome> {
    let outcome = repo
        .save_playing(&Track::from_snapshot(owner_id, snapshot, now))
        .await?;

    if outcome == HistoryOutcome::Started {
        tracing::debug!("history for {} now playing {}", owner_id, snapshot.track_id);
    }
    Ok(outcome)
}

pub async fn recent_tracks(repo: &dyn Repository, owner_id: Uuid, limit: i64) -> Result<Vec<Track>> {
    repo.recent_tracks(owner_id, limit.clamp(1, 50)).await
}
