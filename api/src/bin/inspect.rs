use anyhow::{Context, Result};
use listening_api::config::Config;
use listening_api::db::{self, PgRepository};
use listening_api::models::User;
use listening_api::repo::Repository;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("inspect=debug,listening_api=info")
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        print_usage();
        return Ok(());
    }

    let config = Config::from_env();
    let pool = db::init_db(&config).await?;
    let repo = PgRepository::new(pool);
    let profile_url = &args[2];

    match args[1].as_str() {
        "user" => {
            show_user(&repo, profile_url).await?;
        }
        "history" => {
            let limit = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(20);
            show_history(&repo, profile_url, limit).await?;
        }
        "visits" => {
            let limit = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(20);
            show_visits(&repo, profile_url, limit).await?;
        }
        _ => {
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("listening database inspector");
    println!();
    println!("usage:");
    println!("  inspect user <profile_url>              - show account and sharing state");
    println!("  inspect history <profile_url> [limit]   - show recent tracks");
    println!("  inspect visits <profile_url> [limit]    - show recent profile visits");
}

async fn find_user(repo: &PgRepository, profile_url: &str) -> Result<User> {
    repo.user_by_profile_url(profile_url)
        .await?
        .with_context(|| format!("no user at /profile/{}", profile_url))
}

async fn show_user(repo: &PgRepository, profile_url: &str) -> Result<()> {
    let user = find_user(repo, profile_url).await?;

    println!("{} ({})", user.display_name, user.id);
    println!("  spotify id:    {}", user.spotify_id);
    println!("  email:         {}", user.email);
    println!("  active:        {}", user.is_active);
    println!("  sharing:       {}", user.is_sharing_enabled);
    println!("  token expires: {}", user.token_expires_at);
    println!("  joined:        {}", user.created_at);

    if let Some(profile) = repo.profile_for_user(user.id).await? {
        println!(
            "  profile:       theme={} animation={} stats={} history={}",
            profile.theme, profile.animation_style, profile.show_stats, profile.show_history
        );
    }

    match repo.playing_track(user.id).await? {
        Some(track) => println!("  playing:       {} by {}", track.name, track.artist),
        None => println!("  playing:       nothing recorded"),
    }

    Ok(())
}

async fn show_history(repo: &PgRepository, profile_url: &str, limit: i64) -> Result<()> {
    let user = find_user(repo, profile_url).await?;
    let tracks = repo.recent_tracks(user.id, limit).await?;

    println!("{} tracks for {}:", tracks.len(), user.display_name);
    for track in tracks {
        let marker = if track.is_currently_playing { "*" } else { " " };
        println!(
            "{} {}  {} by {} ({})",
            marker,
            track.played_at.format("%Y-%m-%d %H:%M"),
            track.name,
            track.artist,
            track.album
        );
    }

    Ok(())
}

async fn show_visits(repo: &PgRepository, profile_url: &str, limit: i64) -> Result<()> {
    let user = find_user(repo, profile_url).await?;
    let visits = db::recent_visits(repo.pool(), user.id, limit).await?;

    println!("{} visits to {}:", visits.len(), user.display_name);
    for visit in visits {
        let ended = visit
            .ended_at
            .map(|at| at.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "open".to_string());
        println!(
            "  {}  {}  ended {}  from {}",
            visit.id,
            visit.started_at.format("%Y-%m-%d %H:%M:%S"),
            ended,
            visit.visitor_ip.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
