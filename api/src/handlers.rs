use axum::{
    async_trait,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::history;
use crate::live::LiveSession;
use crate::models::{PlaybackSnapshot, Profile, ProfileResponse, ProfileUpdate, User, VisitMetadata};
use crate::orchestrator::Freshness;
use crate::profile;
use crate::users;
use crate::AppState;

const USER_COOKIE: &str = "user_id";
const VISIT_COOKIE: &str = "visit_id";
const AUTH_STATE_COOKIE: &str = "spotify_auth_state";

const AUTH_STATE_MAX_AGE: i64 = 15 * 60;
const SESSION_MAX_AGE: i64 = 30 * 24 * 3600;

/// Value of the named cookie from the request's `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// A `Set-Cookie` value scoped to the whole site. `max_age` of `None` makes a
/// session cookie; zero deletes it.
fn set_cookie(name: &str, value: &str, max_age: Option<i64>, http_only: bool, secure: bool) -> String {
    let mut cookie = format!("{}={}; Path=/; SameSite=Lax", name, value);
    if let Some(age) = max_age {
        cookie.push_str(&format!("; Max-Age={}", age));
    }
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    header_str("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next())
        .or_else(|| header_str("x-real-ip"))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// The logged-in owner, resolved from the `user_id` cookie.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let user_id = cookie_value(&parts.headers, USER_COOKIE)
            .ok_or_else(|| AppError::Unauthorized("authentication required".to_string()))?
            .parse::<Uuid>()
            .map_err(|_| AppError::Unauthorized("invalid authentication".to_string()))?;

        state
            .repo
            .user_by_id(user_id)
            .await?
            .map(AuthUser)
            .ok_or_else(|| AppError::Unauthorized("invalid authentication".to_string()))
    }
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn spotify_login(State(state): State<AppState>) -> Result<Response> {
    let auth_state = Uuid::new_v4().to_string();
    let url = state
        .spotify
        .authorize_url(&auth_state)
        .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

    let cookie = set_cookie(
        AUTH_STATE_COOKIE,
        &auth_state,
        Some(AUTH_STATE_MAX_AGE),
        true,
        state.config.cookie_secure,
    );
    Ok(([(header::SET_COOKIE, cookie)], Redirect::temporary(&url)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

pub async fn spotify_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackQuery>,
) -> Result<Response> {
    if let Some(error) = params.error {
        return Err(AppError::BadRequest(format!("authorization denied: {}", error)));
    }

    let stored = cookie_value(&headers, AUTH_STATE_COOKIE);
    match (params.state.as_deref(), stored) {
        (Some(provided), Some(stored)) if provided == stored => {}
        (provided, stored) => {
            tracing::error!(
                "auth state mismatch: provided {:?}, stored {:?}",
                provided,
                stored
            );
            return Err(AppError::BadRequest("state validation failed".to_string()));
        }
    }

    let code = params
        .code
        .ok_or_else(|| AppError::BadRequest("missing code".to_string()))?;

    let tokens = state.spotify.exchange_code(&code).await.map_err(|e| {
        tracing::error!("failed to exchange code: {}", e);
        AppError::AuthFailed(e.to_string())
    })?;
    let spotify_profile = state
        .spotify
        .fetch_profile(&tokens.access_token)
        .await
        .map_err(|e| {
            tracing::error!("failed to fetch provider profile: {}", e);
            AppError::UpstreamUnavailable(e.to_string())
        })?;

    let user =
        users::create_or_update_user(state.repo.as_ref(), &spotify_profile, &tokens, Utc::now())
            .await?;

    let secure = state.config.cookie_secure;
    let session = set_cookie(USER_COOKIE, &user.id.to_string(), Some(SESSION_MAX_AGE), true, secure);
    let cleared = set_cookie(AUTH_STATE_COOKIE, "", Some(0), true, secure);

    Ok((
        [(header::SET_COOKIE, session), (header::SET_COOKIE, cleared)],
        Redirect::temporary(&format!("/profile/{}", user.profile_url)),
    )
        .into_response())
}

pub async fn logout(State(state): State<AppState>) -> Response {
    let cleared = set_cookie(USER_COOKIE, "", Some(0), true, state.config.cookie_secure);
    ([(header::SET_COOKIE, cleared)], Redirect::temporary("/")).into_response()
}

pub async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let unauthenticated = || Json(serde_json::json!({ "authenticated": false }));

    let Some(user_id) = cookie_value(&headers, USER_COOKIE).and_then(|raw| raw.parse::<Uuid>().ok())
    else {
        return Ok(unauthenticated().into_response());
    };

    match state.repo.user_by_id(user_id).await? {
        Some(user) => Ok(Json(serde_json::json!({
            "authenticated": true,
            "user": {
                "id": user.id,
                "displayName": user.display_name,
                "profileUrl": user.profile_url,
                "isSharing": user.is_sharing_enabled,
            }
        }))
        .into_response()),
        None => {
            let cleared = set_cookie(USER_COOKIE, "", Some(0), true, state.config.cookie_secure);
            Ok(([(header::SET_COOKIE, cleared)], unauthenticated()).into_response())
        }
    }
}

async fn owner_by_url(state: &AppState, profile_url: &str) -> Result<User> {
    state
        .repo
        .user_by_profile_url(profile_url)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("profile {}", profile_url)))
}

pub async fn public_profile(
    State(state): State<AppState>,
    Path(profile_url): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let mut owner = owner_by_url(&state, &profile_url).await?;
    if !owner.is_active {
        return Err(AppError::NotFound(format!("profile {}", profile_url)));
    }
    if !owner.is_sharing_enabled {
        return Err(AppError::SharingDisabled);
    }

    // The owner looking at their own page is not a distinct visitor
    let visitor_user_id = cookie_value(&headers, USER_COOKIE)
        .and_then(|raw| raw.parse::<Uuid>().ok())
        .filter(|id| *id != owner.id);
    let metadata = VisitMetadata {
        visitor_ip: client_ip(&headers),
        visitor_user_id,
        user_agent: header_string(&headers, header::USER_AGENT),
        referrer_url: header_string(&headers, header::REFERER),
    };

    let visit_id = match state.presence.begin_visit(owner.id, metadata).await {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::error!("failed to record visit to {}: {}", owner.id, e);
            None
        }
    };

    let body: ProfileResponse = profile::build_profile_response(&state, &mut owner).await?;

    match visit_id {
        Some(id) => {
            let cookie = set_cookie(
                VISIT_COOKIE,
                &id.to_string(),
                None,
                false,
                state.config.cookie_secure,
            );
            Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
        }
        None => Ok(Json(body).into_response()),
    }
}

pub async fn leave_profile(
    State(state): State<AppState>,
    Path(profile_url): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let owner = owner_by_url(&state, &profile_url).await?;
    let visit_id = cookie_value(&headers, VISIT_COOKIE)
        .ok_or_else(|| AppError::Unauthorized("missing visit".to_string()))?
        .parse::<Uuid>()
        .map_err(|_| AppError::Unauthorized("invalid visit".to_string()))?;

    let belongs_to_owner = state
        .repo
        .visit_by_id(visit_id)
        .await?
        .is_some_and(|visit| visit.user_id == owner.id);
    if !belongs_to_owner {
        return Err(AppError::NotFound(format!("visit {}", visit_id)));
    }

    state.presence.end_visit(visit_id).await?;

    let cleared = set_cookie(VISIT_COOKIE, "", Some(0), false, state.config.cookie_secure);
    Ok(([(header::SET_COOKIE, cleared)], StatusCode::NO_CONTENT).into_response())
}

pub async fn live_tracks(
    State(state): State<AppState>,
    Path(profile_url): Path<String>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    // Validation runs before the upgrade so rejections are plain HTTP errors
    let session =
        LiveSession::open(&state, &profile_url, cookie_value(&headers, VISIT_COOKIE)).await?;
    let ws = ws.map_err(|e| AppError::BadRequest(e.body_text()))?;

    Ok(ws.on_upgrade(move |socket| async move {
        session.run(socket).await;
    }))
}

pub async fn get_own_profile(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Profile>> {
    state
        .repo
        .profile_for_user(user.id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("profile for {}", user.id)))
}

pub async fn update_own_profile(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<Profile>> {
    let updated = profile::update_profile(state.repo.as_ref(), user.id, update).await?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct SettingsUpdate {
    #[serde(rename = "isSharingEnabled")]
    is_sharing_enabled: bool,
}

pub async fn update_settings(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(settings): Json<SettingsUpdate>,
) -> Result<Json<serde_json::Value>> {
    state
        .repo
        .update_sharing(user.id, settings.is_sharing_enabled)
        .await?;
    tracing::info!(
        "sharing for {} set to {}",
        user.id,
        settings.is_sharing_enabled
    );
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn current_track(
    State(state): State<AppState>,
    AuthUser(mut user): AuthUser,
) -> Result<Json<PlaybackSnapshot>> {
    let snapshot = state
        .orchestrator
        .refresh_user(&mut user, Freshness::Cached)
        .await?;
    Ok(Json(snapshot))
}

pub async fn refresh_track(
    State(state): State<AppState>,
    AuthUser(mut user): AuthUser,
) -> Result<Json<PlaybackSnapshot>> {
    let snapshot = state
        .orchestrator
        .refresh_user(&mut user, Freshness::Live)
        .await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<i64>,
}

pub async fn track_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>> {
    let limit = params.limit.unwrap_or(state.config.history_limit);
    let tracks = history::recent_tracks(state.repo.as_ref(), user.id, limit).await?;
    Ok(Json(serde_json::json!({ "tracks": tracks })))
}
