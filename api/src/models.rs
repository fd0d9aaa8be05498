use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub spotify_id: String,
    pub email: String,
    pub display_name: String,
    pub profile_url: String,
    #[serde(skip_serializing)]
    pub spotify_access_token: String,
    #[serde(skip_serializing)]
    pub spotify_refresh_token: String,
    #[serde(skip_serializing)]
    pub token_expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_sharing_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn public(&self) -> UserPublic {
        UserPublic {
            id: self.id,
            display_name: self.display_name.clone(),
            profile_url: self.profile_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub theme: String,
    pub background_color: String,
    pub text_color: String,
    pub custom_message: Option<String>,
    pub show_stats: bool,
    pub show_history: bool,
    pub animation_style: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn default_for(user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            theme: "default".to_string(),
            background_color: "#121212".to_string(),
            text_color: "#FFFFFF".to_string(),
            custom_message: None,
            show_stats: true,
            show_history: true,
            animation_style: "fade".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Editable subset of a profile accepted from its owner.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileUpdate {
    pub theme: String,
    pub background_color: String,
    pub text_color: String,
    #[serde(default)]
    pub custom_message: Option<String>,
    pub show_stats: bool,
    pub show_history: bool,
    pub animation_style: String,
}

/// One row of a user's listening history.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Track {
    pub id: Uuid,
    pub user_id: Uuid,
    pub spotify_track_id: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub album_art_url: Option<String>,
    pub track_url: Option<String>,
    pub duration_ms: i32,
    pub is_currently_playing: bool,
    pub played_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Track {
    pub fn from_snapshot(user_id: Uuid, snapshot: &PlaybackSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            spotify_track_id: snapshot.track_id.clone(),
            name: snapshot.track_name.clone(),
            artist: snapshot.artist_name.clone(),
            album: snapshot.album_name.clone(),
            album_art_url: snapshot.album_art_url.clone(),
            track_url: snapshot.track_url.clone(),
            duration_ms: i32::try_from(snapshot.duration_ms).unwrap_or(i32::MAX),
            is_currently_playing: true,
            played_at: now,
            created_at: now,
        }
    }
}

/// Audit record of one visit to a public profile.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ProfileVisit {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub visitor_ip: Option<String>,
    pub visitor_user_id: Option<Uuid>,
    #[serde(skip_serializing)]
    pub user_agent: Option<String>,
    pub referrer_url: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct VisitMetadata {
    pub visitor_ip: Option<String>,
    pub visitor_user_id: Option<Uuid>,
    pub user_agent: Option<String>,
    pub referrer_url: Option<String>,
}

/// A reading of what an owner is playing at poll time.
///
/// When `is_playing` is false the track fields carry no meaning and the
/// snapshot is never cached, recorded or broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub is_playing: bool,
    pub track_id: String,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
    pub album_art_url: Option<String>,
    pub track_url: Option<String>,
    pub duration_ms: i64,
    pub progress_ms: Option<i64>,
}

impl PlaybackSnapshot {
    pub fn idle() -> Self {
        Self::default()
    }
}

/// Token bundle returned by the provider's token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SpotifyProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPublic {
    pub id: Uuid,
    pub display_name: String,
    pub profile_url: String,
}

/// Everything a visitor's page needs to render an owner's profile.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileResponse {
    pub user: UserPublic,
    pub profile: Profile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_track: Option<PlaybackSnapshot>,
    pub recent_tracks: Vec<Track>,
    pub viewer_count: usize,
}
