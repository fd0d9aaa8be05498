use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::history;
use crate::models::{Profile, ProfileResponse, ProfileUpdate, User};
use crate::orchestrator::Freshness;
use crate::repo::Repository;
use crate::AppState;

/// Assemble what a visitor sees. Only a missing profile row or a storage
/// failure reading it is an error; everything else degrades to "nothing".
pub async fn build_profile_response(state: &AppState, user: &mut User) -> Result<ProfileResponse> {
    let profile = state
        .repo
        .profile_for_user(user.id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("profile for {}", user.id)))?;

    let current_track = match state.orchestrator.refresh_user(user, Freshness::Cached).await {
        Ok(snapshot) if snapshot.is_playing => Some(snapshot),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("rendering {} as not playing: {}", user.id, e);
            None
        }
    };

    let recent_tracks = if profile.show_history {
        history::recent_tracks(state.repo.as_ref(), user.id, state.config.history_limit)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("failed to get recent tracks for {}: {}", user.id, e);
                Vec::new()
            })
    } else {
        Vec::new()
    };

    let viewer_count = if profile.show_stats {
        state.presence.active_count(user.id).await.unwrap_or_else(|e| {
            tracing::error!("failed to count viewers for {}: {}", user.id, e);
            0
        })
    } else {
        0
    };

    Ok(ProfileResponse {
        user: user.public(),
        profile,
        current_track,
        recent_tracks,
        viewer_count,
    })
}

pub async fn update_profile(
    repo: &dyn Repository,
    user_id: Uuid,
    update: ProfileUpdate,
) -> Result<Profile> {
    let mut profile = repo
        .profile_for_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("profile for {}", user_id)))?;

    profile.theme = update.theme;
    profile.background_color = update.background_color;
    profile.text_color = update.text_color;
    profile.custom_message = update.custom_message;
    profile.show_stats = update.show_stats;
    profile.show_history = update.show_history;
    profile.animation_style = update.animation_style;
    profile.updated_at = Utc::now();

    repo.update_profile(&profile).await?;
    Ok(profile)
}
