use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SCOPES: &str = "user-read-private user-read-email user-read-currently-playing";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub spotify: SpotifyConfig,
    pub timings: Timings,
    /// End the visit when a live session closes cleanly instead of waiting for expiry.
    pub end_visit_on_close: bool,
    pub history_limit: i64,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Fixed durations governing expiry, heartbeats and upstream waits.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub cache_ttl: Duration,
    pub presence_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub ping_interval: Duration,
    pub upstream_timeout: Duration,
    pub token_refresh_margin: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(120),
            presence_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            upstream_timeout: Duration::from_secs(10),
            token_refresh_margin: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Timings::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs()))
        };

        let timings = Timings {
            cache_ttl: secs("CACHE_TTL_SECS", defaults.cache_ttl),
            presence_ttl: secs("PRESENCE_TTL_SECS", defaults.presence_ttl),
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval),
            ping_interval: secs("LIVE_PING_INTERVAL_SECS", defaults.ping_interval),
            upstream_timeout: secs("UPSTREAM_TIMEOUT_SECS", defaults.upstream_timeout),
            token_refresh_margin: secs("TOKEN_REFRESH_MARGIN_SECS", defaults.token_refresh_margin),
        };

        let spotify = SpotifyConfig {
            client_id: lookup("SPOTIFY_CLIENT_ID").unwrap_or_default(),
            client_secret: lookup("SPOTIFY_CLIENT_SECRET").unwrap_or_default(),
            redirect_uri: lookup("SPOTIFY_REDIRECT_URI")
                .unwrap_or_else(|| "http://localhost:8080/auth/spotify/callback".to_string()),
            scopes: lookup("SPOTIFY_SCOPES")
                .unwrap_or_else(|| DEFAULT_SCOPES.to_string())
                .split_whitespace()
                .map(String::from)
                .collect(),
        };

        Self {
            port: parse_or(&lookup, "SERVER_PORT", 8080),
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "postgresql://localhost/listening".to_string()),
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 25),
            spotify,
            timings,
            end_visit_on_close: parse_or(&lookup, "END_VISIT_ON_CLOSE", false),
            history_limit: parse_or(&lookup, "HISTORY_LIMIT", 10),
            cookie_secure: parse_or(&lookup, "COOKIE_SECURE", false),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("invalid value {:?} for {}, using default", raw, key);
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_windows() {
        let config = config_from(&[]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.timings.cache_ttl, Duration::from_secs(120));
        assert_eq!(config.timings.presence_ttl, Duration::from_secs(300));
        assert_eq!(config.timings.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.spotify.scopes.len(), 3);
        assert!(!config.end_visit_on_close);
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = config_from(&[("SERVER_PORT", "eighty"), ("CACHE_TTL_SECS", "30")]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.timings.cache_ttl, Duration::from_secs(30));
    }

    #[test]
    fn reads_flags_and_scopes() {
        let config = config_from(&[
            ("END_VISIT_ON_CLOSE", "true"),
            ("SPOTIFY_SCOPES", "user-read-currently-playing"),
        ]);
        assert!(config.end_visit_on_close);
        assert_eq!(config.spotify.scopes, vec!["user-read-currently-playing"]);
    }
}
