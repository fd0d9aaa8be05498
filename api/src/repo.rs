use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::history::HistoryOutcome;
use crate::models::{Profile, ProfileVisit, Track, User};

/// Relational storage for users, profiles, listening history and visits.
///
/// Implementations keep at most one currently-playing track per user.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>>;
    async fn user_by_profile_url(&self, profile_url: &str) -> Result<Option<User>>;
    async fn user_by_spotify_id(&self, spotify_id: &str) -> Result<Option<User>>;
    async fn profile_url_taken(&self, profile_url: &str) -> Result<bool>;
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn update_user_tokens(
        &self,
        user_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn update_sharing(&self, user_id: Uuid, enabled: bool) -> Result<()>;

    async fn profile_for_user(&self, user_id: Uuid) -> Result<Option<Profile>>;
    async fn insert_profile(&self, profile: &Profile) -> Result<()>;
    async fn update_profile(&self, profile: &Profile) -> Result<()>;

    async fn playing_track(&self, user_id: Uuid) -> Result<Option<Track>>;
    /// Make `track` the owner's currently playing record in one atomic step.
    /// If that record already is the same track only its `played_at` moves;
    /// otherwise the old record is flipped off and `track` is inserted.
    async fn save_playing(&self, track: &Track) -> Result<HistoryOutcome>;
    async fn recent_tracks(&self, user_id: Uuid, limit: i64) -> Result<Vec<Track>>;

    async fn insert_visit(&self, visit: &ProfileVisit) -> Result<()>;
    async fn visit_by_id(&self, visit_id: Uuid) -> Result<Option<ProfileVisit>>;
    async fn end_visit(&self, visit_id: Uuid, ended_at: DateTime<Utc>) -> Result<()>;
}
