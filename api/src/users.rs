use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Profile, SpotifyProfile, TokenBundle, User};
use crate::repo::Repository;

/// Create the account on first login, otherwise replace its tokens.
/// Any storage failure fails the login.
pub async fn create_or_update_user(
    repo: &dyn Repository,
    spotify: &SpotifyProfile,
    tokens: &TokenBundle,
    now: DateTime<Utc>,
) -> Result<User> {
    let expires_at = now + chrono::Duration::seconds(tokens.expires_in);

    if let Some(mut user) = repo.user_by_spotify_id(&spotify.id).await? {
        user.spotify_access_token = tokens.access_token.clone();
        if let Some(refresh) = &tokens.refresh_token {
            user.spotify_refresh_token = refresh.clone();
        }
        user.token_expires_at = expires_at;
        user.updated_at = now;

        repo.update_user_tokens(
            user.id,
            &user.spotify_access_token,
            &user.spotify_refresh_token,
            expires_at,
        )
        .await?;
        tracing::info!("refreshed login for {}", user.id);
        return Ok(user);
    }

    let display_name = spotify
        .display_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| spotify.id.clone());
    let profile_url = unique_profile_url(repo, &display_name).await?;

    let user = User {
        id: Uuid::new_v4(),
        spotify_id: spotify.id.clone(),
        email: spotify.email.clone().unwrap_or_default(),
        display_name,
        profile_url,
        spotify_access_token: tokens.access_token.clone(),
        spotify_refresh_token: tokens.refresh_token.clone().unwrap_or_default(),
        token_expires_at: expires_at,
        is_active: true,
        is_sharing_enabled: true,
        created_at: now,
        updated_at: now,
    };
    repo.insert_user(&user).await?;
    repo.insert_profile(&Profile::default_for(user.id, now)).await?;

    tracing::info!("created user {} at /profile/{}", user.id, user.profile_url);
    Ok(user)
}

/// True when the access token has expired or will within `margin`.
pub fn token_needs_refresh(user: &User, now: DateTime<Utc>, margin: Duration) -> bool {
    let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
    user.token_expires_at <= now + margin
}

fn slugify(display_name: &str) -> String {
    display_name
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

async fn unique_profile_url(repo: &dyn Repository, display_name: &str) -> Result<String> {
    let base = slugify(display_name);
    if !base.is_empty() && !repo.profile_url_taken(&base).await? {
        return Ok(base);
    }

    let id = Uuid::new_v4().simple().to_string();
    let suffix = &id[id.len() - 6..];
    if base.is_empty() {
        Ok(format!("user-{}", suffix))
    } else {
        Ok(format!("{}-{}", base, suffix))
    }
}
