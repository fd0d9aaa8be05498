use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::history::HistoryOutcome;
use crate::models::*;
use crate::repo::Repository;

pub async fn init_db(config: &Config) -> Result<PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

const USER_COLUMNS: &str = r#"
    id, spotify_id, email, display_name, profile_url,
    spotify_access_token, spotify_refresh_token, token_expires_at,
    is_active, is_sharing_enabled, created_at, updated_at
"#;

const TRACK_COLUMNS: &str = r#"
    id, user_id, spotify_track_id, name, artist, album, album_art_url,
    track_url, duration_ms, is_currently_playing, played_at, created_at
"#;

const VISIT_COLUMNS: &str = r#"
    id, user_id, visitor_ip, visitor_user_id, user_agent, referrer_url,
    started_at, ended_at
"#;

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn user_where(&self, clause: &str, value: &str) -> Result<Option<User>> {
        let query = format!("SELECT {} FROM users WHERE {} = $1", USER_COLUMNS, clause);
        let user = sqlx::query_as::<_, User>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let query = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn user_by_profile_url(&self, profile_url: &str) -> Result<Option<User>> {
        self.user_where("profile_url", profile_url).await
    }

    async fn user_by_spotify_id(&self, spotify_id: &str) -> Result<Option<User>> {
        self.user_where("spotify_id", spotify_id).await
    }

    async fn profile_url_taken(&self, profile_url: &str) -> Result<bool> {
        let taken: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE profile_url = $1)")
                .bind(profile_url)
                .fetch_one(&self.pool)
                .await?;
        Ok(taken)
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, spotify_id, email, display_name, profile_url,
                spotify_access_token, spotify_refresh_token, token_expires_at,
                is_active, is_sharing_enabled, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(user.id)
        .bind(&user.spotify_id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.profile_url)
        .bind(&user.spotify_access_token)
        .bind(&user.spotify_refresh_token)
        .bind(user.token_expires_at)
        .bind(user.is_active)
        .bind(user.is_sharing_enabled)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_user_tokens(
        &self,
        user_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users SET
                spotify_access_token = $1,
                spotify_refresh_token = $2,
                token_expires_at = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_sharing(&self, user_id: Uuid, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_sharing_enabled = $1, updated_at = NOW() WHERE id = $2")
            .bind(enabled)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn profile_for_user(&self, user_id: Uuid) -> Result<Option<Profile>> {
        let profile = sqlx::query_as::<_, Profile>(
            r#"
            SELECT id, user_id, theme, background_color, text_color, custom_message,
                   show_stats, show_history, animation_style, created_at, updated_at
            FROM profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (
                id, user_id, theme, background_color, text_color,
                custom_message, show_stats, show_history, animation_style,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(profile.id)
        .bind(profile.user_id)
        .bind(&profile.theme)
        .bind(&profile.background_color)
        .bind(&profile.text_color)
        .bind(&profile.custom_message)
        .bind(profile.show_stats)
        .bind(profile.show_history)
        .bind(&profile.animation_style)
        .bind(profile.created_at)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE profiles SET
                theme = $1,
                background_color = $2,
                text_color = $3,
                custom_message = $4,
                show_stats = $5,
                show_history = $6,
                animation_style = $7,
                updated_at = $8
            WHERE id = $9
            "#,
        )
        .bind(&profile.theme)
        .bind(&profile.background_color)
        .bind(&profile.text_color)
        .bind(&profile.custom_message)
        .bind(profile.show_stats)
        .bind(profile.show_history)
        .bind(&profile.animation_style)
        .bind(profile.updated_at)
        .bind(profile.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn playing_track(&self, user_id: Uuid) -> Result<Option<Track>> {
        let query = format!(
            "SELECT {} FROM tracks WHERE user_id = $1 AND is_currently_playing = true LIMIT 1",
            TRACK_COLUMNS
        );
        let track = sqlx::query_as::<_, Track>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(track)
    }

    async fn save_playing(&self, track: &Track) -> Result<HistoryOutcome> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the owner serializes concurrent polls for them
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(track.user_id)
            .fetch_optional(&mut *tx)
            .await?;

        let current: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT id, spotify_track_id FROM tracks WHERE user_id = $1 AND is_currently_playing = true LIMIT 1",
        )
        .bind(track.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id, spotify_track_id)) = current {
            if spotify_track_id == track.spotify_track_id {
                sqlx::query("UPDATE tracks SET played_at = $1 WHERE id = $2")
                    .bind(track.played_at)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                return Ok(HistoryOutcome::Continued);
            }
        }

        sqlx::query(
            "UPDATE tracks SET is_currently_playing = false WHERE user_id = $1 AND is_currently_playing = true",
        )
        .bind(track.user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO tracks (
                id, user_id, spotify_track_id, name, artist, album, album_art_url,
                track_url, duration_ms, is_currently_playing, played_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(track.id)
        .bind(track.user_id)
        .bind(&track.spotify_track_id)
        .bind(&track.name)
        .bind(&track.artist)
        .bind(&track.album)
        .bind(&track.album_art_url)
        .bind(&track.track_url)
        .bind(track.duration_ms)
        .bind(track.is_currently_playing)
        .bind(track.played_at)
        .bind(track.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!("failed to insert track {} for {}: {}", track.spotify_track_id, track.user_id, e);
            e
        })?;

        tx.commit().await?;
        Ok(HistoryOutcome::Started)
    }

    async fn recent_tracks(&self, user_id: Uuid, limit: i64) -> Result<Vec<Track>> {
        let query = format!(
            "SELECT {} FROM tracks WHERE user_id = $1 ORDER BY played_at DESC LIMIT $2",
            TRACK_COLUMNS
        );
        let tracks = sqlx::query_as::<_, Track>(&query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(tracks)
    }

    async fn insert_visit(&self, visit: &ProfileVisit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profile_visits (
                id, user_id, visitor_ip, visitor_user_id, user_agent, referrer_url, started_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(visit.id)
        .bind(visit.user_id)
        .bind(&visit.visitor_ip)
        .bind(visit.visitor_user_id)
        .bind(&visit.user_agent)
        .bind(&visit.referrer_url)
        .bind(visit.started_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn visit_by_id(&self, visit_id: Uuid) -> Result<Option<ProfileVisit>> {
        let query = format!("SELECT {} FROM profile_visits WHERE id = $1", VISIT_COLUMNS);
        let visit = sqlx::query_as::<_, ProfileVisit>(&query)
            .bind(visit_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(visit)
    }

    async fn end_visit(&self, visit_id: Uuid, ended_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE profile_visits SET ended_at = $1 WHERE id = $2 AND ended_at IS NULL")
            .bind(ended_at)
            .bind(visit_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Most recent visits to a user's profile, newest first.
pub async fn recent_visits(pool: &PgPool, user_id: Uuid, limit: i64) -> Result<Vec<ProfileVisit>> {
    let query = format!(
        "SELECT {} FROM profile_visits WHERE user_id = $1 ORDER BY started_at DESC LIMIT $2",
        VISIT_COLUMNS
    );
    let visits = sqlx::query_as::<_, ProfileVisit>(&query)
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(visits)
}
