#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use listening_api::config::{Config, SpotifyConfig, Timings};
use listening_api::error::UpstreamError;
use listening_api::history::HistoryOutcome;
use listening_api::kv::{KeyValueStore, MemoryStore};
use listening_api::models::{
    PlaybackSnapshot, Profile, ProfileVisit, SpotifyProfile, TokenBundle, Track, User,
};
use listening_api::repo::Repository;
use listening_api::spotify::SpotifyApi;
use listening_api::AppState;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    profiles: HashMap<Uuid, Profile>,
    tracks: Vec<Track>,
    visits: HashMap<Uuid, ProfileVisit>,
}

/// Repository over plain collections. `fail_history` makes every track write
/// fail, for exercising best-effort paths.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
    pub fail_history: std::sync::atomic::AtomicBool,
    pub token_updates: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: User) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .profiles
            .insert(user.id, Profile::default_for(user.id, user.created_at));
        tables.users.insert(user.id, user);
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.tables.lock().unwrap().users.get(&id).cloned()
    }

    pub fn tracks_for(&self, user_id: Uuid) -> Vec<Track> {
        self.tables
            .lock()
            .unwrap()
            .tracks
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn visit(&self, id: Uuid) -> Option<ProfileVisit> {
        self.tables.lock().unwrap().visits.get(&id).cloned()
    }

    pub fn set_profile_flags(&self, user_id: Uuid, show_stats: bool, show_history: bool) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(profile) = tables.profiles.get_mut(&user_id) {
            profile.show_stats = show_stats;
            profile.show_history = show_history;
        }
    }

    fn history_guard(&self) -> Result<()> {
        if self.fail_history.load(Ordering::SeqCst) {
            Err(anyhow!("history table unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.user(id))
    }

    async fn user_by_profile_url(&self, profile_url: &str) -> Result<Option<User>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .users
            .values()
            .find(|u| u.profile_url == profile_url)
            .cloned())
    }

    async fn user_by_spotify_id(&self, spotify_id: &str) -> Result<Option<User>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .users
            .values()
            .find(|u| u.spotify_id == spotify_id)
            .cloned())
    }

    async fn profile_url_taken(&self, profile_url: &str) -> Result<bool> {
        Ok(self.user_by_profile_url(profile_url).await?.is_some())
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .users
            .insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user_tokens(
        &self,
        user_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.token_updates.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock().unwrap();
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("no user {}", user_id))?;
        user.spotify_access_token = access_token.to_string();
        user.spotify_refresh_token = refresh_token.to_string();
        user.token_expires_at = expires_at;
        Ok(())
    }

    async fn update_sharing(&self, user_id: Uuid, enabled: bool) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.is_sharing_enabled = enabled;
        }
        Ok(())
    }

    async fn profile_for_user(&self, user_id: Uuid) -> Result<Option<Profile>> {
        Ok(self.tables.lock().unwrap().profiles.get(&user_id).cloned())
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .profiles
            .insert(profile.user_id, profile.clone());
        Ok(())
    }

    async fn update_profile(&self, profile: &Profile) -> Result<()> {
        self.insert_profile(profile).await
    }

    async fn playing_track(&self, user_id: Uuid) -> Result<Option<Track>> {
        self.history_guard()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .tracks
            .iter()
            .find(|t| t.user_id == user_id && t.is_currently_playing)
            .cloned())
    }

    async fn save_playing(&self, track: &Track) -> Result<HistoryOutcome> {
        self.history_guard()?;
        let mut tables = self.tables.lock().unwrap();
        let current = tables
            .tracks
            .iter_mut()
            .find(|t| t.user_id == track.user_id && t.is_currently_playing);

        match current {
            Some(current) if current.spotify_track_id == track.spotify_track_id => {
                current.played_at = track.played_at;
                Ok(HistoryOutcome::Continued)
            }
            Some(current) => {
                current.is_currently_playing = false;
                tables.tracks.push(track.clone());
                Ok(HistoryOutcome::Started)
            }
            None => {
                tables.tracks.push(track.clone());
                Ok(HistoryOutcome::Started)
            }
        }
    }

    async fn recent_tracks(&self, user_id: Uuid, limit: i64) -> Result<Vec<Track>> {
        let mut tracks = self.tracks_for(user_id);
        tracks.sort_by(|a, b| b.played_at.cmp(&a.played_at));
        tracks.truncate(limit.max(0) as usize);
        Ok(tracks)
    }

    async fn insert_visit(&self, visit: &ProfileVisit) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .visits
            .insert(visit.id, visit.clone());
        Ok(())
    }

    async fn visit_by_id(&self, visit_id: Uuid) -> Result<Option<ProfileVisit>> {
        Ok(self.visit(visit_id))
    }

    async fn end_visit(&self, visit_id: Uuid, ended_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(visit) = tables.visits.get_mut(&visit_id) {
            visit.ended_at = Some(ended_at);
        }
        Ok(())
    }
}

/// Provider whose playback answers are scripted in order. Once the script
/// runs out the last answer repeats.
#[derive(Default)]
pub struct FakeSpotify {
    playback: Mutex<VecDeque<Result<PlaybackSnapshot, String>>>,
    last_playback: Mutex<Option<Result<PlaybackSnapshot, String>>>,
    refresh_fails: std::sync::atomic::AtomicBool,
    pub playback_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub seen_tokens: Mutex<Vec<String>>,
}

impl FakeSpotify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_playback(&self, snapshot: PlaybackSnapshot) {
        self.playback.lock().unwrap().push_back(Ok(snapshot));
    }

    pub fn push_failure(&self, message: &str) {
        self.playback
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn fail_refresh(&self) {
        self.refresh_fails.store(true, Ordering::SeqCst);
    }

    pub fn playback_calls(&self) -> usize {
        self.playback_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpotifyApi for FakeSpotify {
    fn authorize_url(&self, state: &str) -> std::result::Result<String, UpstreamError> {
        Ok(format!("https://accounts.example/authorize?state={}", state))
    }

    async fn exchange_code(&self, code: &str) -> std::result::Result<TokenBundle, UpstreamError> {
        if code == "bad" {
            return Err(UpstreamError::Status {
                status: 400,
                body: "invalid_grant".into(),
            });
        }
        Ok(TokenBundle {
            access_token: format!("access-{}", code),
            refresh_token: Some(format!("refresh-{}", code)),
            expires_in: 3600,
        })
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<TokenBundle, UpstreamError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status {
                status: 400,
                body: "invalid_grant".into(),
            });
        }
        Ok(TokenBundle {
            access_token: format!("fresh-{}", refresh_token),
            refresh_token: None,
            expires_in: 3600,
        })
    }

    async fn fetch_profile(
        &self,
        _access_token: &str,
    ) -> std::result::Result<SpotifyProfile, UpstreamError> {
        Ok(SpotifyProfile {
            id: "spotify-user".into(),
            email: Some("listener@example.com".into()),
            display_name: Some("Night Owl".into()),
        })
    }

    async fn fetch_current_playback(
        &self,
        access_token: &str,
    ) -> std::result::Result<PlaybackSnapshot, UpstreamError> {
        self.playback_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_tokens
            .lock()
            .unwrap()
            .push(access_token.to_string());

        let next = self.playback.lock().unwrap().pop_front();
        let answer = match next {
            Some(answer) => {
                *self.last_playback.lock().unwrap() = Some(answer.clone());
                answer
            }
            None => self
                .last_playback
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(PlaybackSnapshot::idle())),
        };
        answer.map_err(UpstreamError::Malformed)
    }
}

pub fn user(profile_url: &str) -> User {
    let now = Utc::now();
    User {
        id: Uuid::new_v4(),
        spotify_id: format!("sp-{}", profile_url),
        email: format!("{}@example.com", profile_url),
        display_name: profile_url.to_string(),
        profile_url: profile_url.to_string(),
        spotify_access_token: "access".into(),
        spotify_refresh_token: "refresh".into(),
        token_expires_at: now + chrono::Duration::hours(1),
        is_active: true,
        is_sharing_enabled: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn playing(track_id: &str) -> PlaybackSnapshot {
    PlaybackSnapshot {
        is_playing: true,
        track_id: track_id.to_string(),
        track_name: format!("Song {}", track_id),
        artist_name: "Artist".into(),
        album_name: "Album".into(),
        album_art_url: Some(format!("https://img.example/{}.jpg", track_id)),
        track_url: Some(format!("https://open.example/track/{}", track_id)),
        duration_ms: 180_000,
        progress_ms: Some(1_000),
    }
}

pub fn test_config() -> Config {
    Config {
        port: 0,
        database_url: String::new(),
        database_max_connections: 1,
        spotify: SpotifyConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "http://localhost/auth/spotify/callback".into(),
            scopes: vec!["user-read-currently-playing".into()],
        },
        timings: Timings {
            cache_ttl: Duration::from_secs(120),
            presence_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            upstream_timeout: Duration::from_secs(10),
            token_refresh_margin: Duration::from_secs(300),
        },
        end_visit_on_close: false,
        history_limit: 10,
        cookie_secure: false,
    }
}

pub struct Harness {
    pub state: AppState,
    pub repo: Arc<MemoryRepository>,
    pub spotify: Arc<FakeSpotify>,
    pub store: Arc<MemoryStore>,
}

pub fn harness_with(config: Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    harness_over(config, store.clone(), store)
}

/// Harness whose services talk to `kv`; `store` is the memory store behind it.
pub fn harness_over(config: Config, store: Arc<MemoryStore>, kv: Arc<dyn KeyValueStore>) -> Harness {
    let repo = Arc::new(MemoryRepository::new());
    let spotify = Arc::new(FakeSpotify::new());
    let state = AppState::new(config, repo.clone(), spotify.clone(), kv);
    Harness {
        state,
        repo,
        spotify,
        store,
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}
