use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::config::SpotifyConfig;
use crate::error::UpstreamError;
use crate::models::{PlaybackSnapshot, SpotifyProfile, TokenBundle};

const ACCOUNTS_BASE_URL: &str = "https://accounts.spotify.com";
const API_BASE_URL: &str = "https://api.spotify.com/v1";

/// The music provider as seen by the core: OAuth plus two reads.
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    fn authorize_url(&self, state: &str) -> Result<String, UpstreamError>;

    async fn exchange_code(&self, code: &str) -> Result<TokenBundle, UpstreamError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenBundle, UpstreamError>;

    async fn fetch_profile(&self, access_token: &str) -> Result<SpotifyProfile, UpstreamError>;

    /// Current playback, or an idle snapshot when nothing is playing.
    async fn fetch_current_playback(
        &self,
        access_token: &str,
    ) -> Result<PlaybackSnapshot, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct CurrentlyPlayingResponse {
    #[serde(default)]
    is_playing: bool,
    progress_ms: Option<i64>,
    item: Option<TrackItem>,
}

#[derive(Debug, Deserialize)]
struct TrackItem {
    id: Option<String>,
    name: Option<String>,
    duration_ms: Option<i64>,
    #[serde(default)]
    artists: Vec<ArtistRef>,
    album: Option<AlbumRef>,
    #[serde(default)]
    external_urls: ExternalUrls,
}

#[derive(Debug, Deserialize)]
struct ArtistRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AlbumRef {
    name: Option<String>,
    #[serde(default)]
    images: Vec<ImageRef>,
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

impl CurrentlyPlayingResponse {
    fn into_snapshot(self) -> Result<PlaybackSnapshot, UpstreamError> {
        if !self.is_playing {
            return Ok(PlaybackSnapshot::idle());
        }
        // Ads and unloaded players report playing with no item
        let Some(item) = self.item else {
            return Ok(PlaybackSnapshot::idle());
        };

        let missing = |field: &str| UpstreamError::Malformed(format!("track {} missing", field));
        let album = item.album.ok_or_else(|| missing("album"))?;
        // Medium artwork sits second when several sizes are offered
        let album_art_url = album
            .images
            .get(1)
            .or_else(|| album.images.first())
            .map(|image| image.url.clone());

        Ok(PlaybackSnapshot {
            is_playing: true,
            track_id: item.id.ok_or_else(|| missing("id"))?,
            track_name: item.name.ok_or_else(|| missing("name"))?,
            artist_name: item
                .artists
                .into_iter()
                .next()
                .map(|artist| artist.name)
                .ok_or_else(|| missing("artist"))?,
            album_name: album.name.ok_or_else(|| missing("album name"))?,
            album_art_url,
            track_url: item.external_urls.spotify,
            duration_ms: item.duration_ms.ok_or_else(|| missing("duration"))?,
            progress_ms: self.progress_ms,
        })
    }
}

pub struct SpotifyClient {
    http: Client,
    config: SpotifyConfig,
    accounts_base: String,
    api_base: String,
}

impl SpotifyClient {
    /// Build the client once at startup; every request is bounded by `timeout`.
    pub fn new(config: SpotifyConfig, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            config,
            accounts_base: ACCOUNTS_BASE_URL.to_string(),
            api_base: API_BASE_URL.to_string(),
        })
    }

    pub fn with_base_urls(mut self, accounts_base: &str, api_base: &str) -> Self {
        self.accounts_base = accounts_base.trim_end_matches('/').to_string();
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenBundle, UpstreamError> {
        let auth = format!("{}:{}", self.config.client_id, self.config.client_secret);
        let encoded =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, auth.as_bytes());

        let response = self
            .http
            .post(format!("{}/api/token", self.accounts_base))
            .header("Authorization", format!("Basic {}", encoded))
            .form(form)
            .send()
            .await?;

        Ok(ensure_success(response).await?.json().await?)
    }
}

async fn ensure_success(response: Response) -> Result<Response, UpstreamError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Status { status, body })
}

#[async_trait]
impl SpotifyApi for SpotifyClient {
    fn authorize_url(&self, state: &str) -> Result<String, UpstreamError> {
        let scopes = self.config.scopes.join(" ");
        let url = reqwest::Url::parse_with_params(
            &format!("{}/authorize", self.accounts_base),
            &[
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", scopes.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenBundle, UpstreamError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenBundle, UpstreamError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<SpotifyProfile, UpstreamError> {
        let response = self
            .http
            .get(format!("{}/me", self.api_base))
            .bearer_auth(access_token)
            .send()
            .await?;

        Ok(ensure_success(response).await?.json().await?)
    }

    async fn fetch_current_playback(
        &self,
        access_token: &str,
    ) -> Result<PlaybackSnapshot, UpstreamError> {
        let response = self
            .http
            .get(format!("{}/me/player/currently-playing", self.api_base))
            .bearer_auth(access_token)
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(PlaybackSnapshot::idle());
        }

        let body: CurrentlyPlayingResponse = ensure_success(response).await?.json().await?;
        body.into_snapshot()
    }
}
