use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod history;
pub mod kv;
pub mod live;
pub mod models;
pub mod orchestrator;
pub mod presence;
pub mod profile;
pub mod pubsub;
pub mod repo;
pub mod spotify;
pub mod users;

use crate::cache::NowPlayingCache;
use crate::config::Config;
use crate::kv::{KeyValueStore, MemoryStore};
use crate::orchestrator::RefreshOrchestrator;
use crate::presence::PresenceTracker;
use crate::pubsub::TrackBroadcaster;
use crate::repo::Repository;
use crate::spotify::{SpotifyApi, SpotifyClient};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub spotify: Arc<dyn SpotifyApi>,
    pub cache: NowPlayingCache,
    pub presence: PresenceTracker,
    pub broadcaster: TrackBroadcaster,
    pub orchestrator: RefreshOrchestrator,
    /// Cancelled once on shutdown; every live session holds a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        spotify: Arc<dyn SpotifyApi>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let timings = config.timings;
        let cache = NowPlayingCache::new(store.clone(), timings.cache_ttl);
        let broadcaster = TrackBroadcaster::new(store.clone());
        let presence = PresenceTracker::new(store, repo.clone(), timings.presence_ttl);
        let orchestrator = RefreshOrchestrator::new(
            repo.clone(),
            spotify.clone(),
            cache.clone(),
            broadcaster.clone(),
            timings.token_refresh_margin,
        );

        Self {
            config: Arc::new(config),
            repo,
            spotify,
            cache,
            presence,
            broadcaster,
            orchestrator,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/auth/spotify", get(handlers::spotify_login))
        .route("/auth/spotify/callback", get(handlers::spotify_callback))
        .route("/auth/logout", get(handlers::logout))
        .route("/auth/status", get(handlers::auth_status))
        .route("/profile/:profile_url", get(handlers::public_profile))
        .route("/profile/:profile_url/leave", post(handlers::leave_profile))
        .route("/ws/tracks/:profile_url", get(handlers::live_tracks))
        .route(
            "/api/profile",
            get(handlers::get_own_profile).put(handlers::update_own_profile),
        )
        .route("/api/profile/settings", put(handlers::update_settings))
        .route("/api/tracks/current", get(handlers::current_track))
        .route("/api/tracks/refresh", post(handlers::refresh_track))
        .route("/api/tracks/history", get(handlers::track_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("listening_api=debug,tower_http=debug")),
        )
        .init();

    let config = Config::from_env();
    if config.spotify.client_id.is_empty() || config.spotify.client_secret.is_empty() {
        tracing::warn!("SPOTIFY_CLIENT_ID or SPOTIFY_CLIENT_SECRET not set, logins will fail");
    }

    let pool = db::init_db(&config).await?;
    tracing::info!("database initialized");

    let spotify = SpotifyClient::new(config.spotify.clone(), config.timings.upstream_timeout)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let port = config.port;

    let state = AppState::new(
        config,
        Arc::new(db::PgRepository::new(pool)),
        Arc::new(spotify),
        store,
    );
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
