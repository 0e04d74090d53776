use chrono::Duration;
use clap::{Parser, ValueEnum};
use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

pub mod oauth;
pub mod server;
pub mod token_store;
pub mod youtube;


pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const YOUTUBE_API_BASE_URL: &str = "https://www.googleapis.com";

pub const SCOPE_YOUTUBE_READONLY: &str = "https://www.googleapis.com/auth/youtube.readonly";
pub const SCOPE_YOUTUBE_UPLOAD: &str = "https://www.googleapis.com/auth/youtube.upload";

/// What the session does when the stored access token is about to expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RefreshPolicy {
    /// Keep using the stored token; the operator re-authorizes once the API rejects it.
    #[default]
    Never,
    /// Exchange the refresh token when the access token is within the leeway of expiring.
    OnExpiry,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one redirect URL must be configured")]
    MissingRedirectUrl,
    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("at least one OAuth scope must be configured")]
    MissingScopes,
}

#[derive(Parser, Debug, Clone)]
#[command(version,
          about = "Authorize a Google account and upload videos to its YouTube channel",
          long_about = None)]
pub struct Args {
    #[arg(long, env = "YTAPI_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short = 'p', long, env = "YTAPI_PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(long, env = "YTAPI_GOOGLE_CLIENT_ID", help = "OAuth client id")]
    pub client_id: String,

    #[arg(
        long,
        env = "YTAPI_GOOGLE_CLIENT_SECRET",
        hide_env_values = true,
        help = "OAuth client secret"
    )]
    pub client_secret: String,

    #[arg(
        long = "redirect-url",
        env = "YTAPI_GOOGLE_REDIRECT_URL",
        value_delimiter = ',',
        required = true,
        help = "Comma-separated redirect URLs; the first one is used"
    )]
    pub redirect_urls: Vec<String>,

    #[arg(
        long,
        env = "YTAPI_MAIN_SCOPES",
        value_delimiter = ' ',
        default_values_t = vec![SCOPE_YOUTUBE_READONLY.to_string(), SCOPE_YOUTUBE_UPLOAD.to_string()],
        help = "Space-separated OAuth scopes"
    )]
    pub scopes: Vec<String>,

    #[arg(long, env = "YTAPI_TOKEN_DIR", default_value = ".credentials")]
    pub token_dir: String,

    #[arg(long, env = "YTAPI_TOKEN_FILE", default_value = "ytapi-token.json")]
    pub token_file: String,

    #[arg(
        long,
        env = "YTAPI_UPLOAD_DIR",
        default_value = "tmp",
        help = "Directory where received videos wait for upload"
    )]
    pub upload_dir: String,

    #[arg(long, env = "YTAPI_REFRESH_POLICY", value_enum, default_value_t = RefreshPolicy::Never)]
    pub refresh_policy: RefreshPolicy,

    #[arg(
        long,
        env = "YTAPI_REFRESH_LEEWAY",
        value_name = "DURATION",
        value_parser = parse_duration,
        default_value = "5m",
        help = "How long before expiry a token is refreshed (e.g., 30s, 5m, 1h)"
    )]
    pub refresh_leeway: Duration,

    #[arg(long, env = "YTAPI_MAX_UPLOAD_BYTES", help = "Request body limit for uploads")]
    pub max_upload_bytes: Option<usize>,

    #[arg(
        long,
        env = "YTAPI_REQUEST_TIMEOUT",
        value_name = "DURATION",
        value_parser = parse_duration,
        help = "Timeout for calls to Google (e.g., 30s, 10m)"
    )]
    pub request_timeout: Option<Duration>,

    #[arg(long, hide = true, default_value = GOOGLE_AUTH_URL)]
    pub auth_url: String,

    #[arg(long, hide = true, default_value = GOOGLE_TOKEN_URL)]
    pub token_url: String,

    #[arg(long, hide = true, default_value = YOUTUBE_API_BASE_URL)]
    pub api_base_url: String,
}

impl Args {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let redirect = self.redirect_url()?;
        for url in [
            redirect,
            self.auth_url.as_str(),
            self.token_url.as_str(),
            self.api_base_url.as_str(),
        ] {
            url::Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
                url: url.to_string(),
                source,
            })?;
        }
        if self.scopes.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::MissingScopes);
        }
        Ok(())
    }

    pub fn redirect_url(&self) -> Result<&str, ConfigError> {
        self.redirect_urls
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .ok_or(ConfigError::MissingRedirectUrl)
    }

    pub fn token_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.token_dir)).join(&self.token_file)
    }

    pub fn upload_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.upload_dir))
    }
}

#[derive(Debug, Error)]
pub enum DurationError {
    #[error(transparent)]
    Invalid(#[from] ParseIntError),
    #[error("duration is out of range")]
    OutOfRange,
}

pub fn parse_duration(duration_str: &str) -> Result<Duration, DurationError> {
    let duration_str = duration_str.trim().to_lowercase();

    let duration = if duration_str.ends_with("h") {
        let hours: i64 = duration_str.trim_end_matches("h").parse()?;
        Duration::try_hours(hours)
    } else if duration_str.ends_with("m") {
        let minutes: i64 = duration_str.trim_end_matches("m").parse()?;
        Duration::try_minutes(minutes)
    } else if duration_str.ends_with("s") {
        let seconds: i64 = duration_str.trim_end_matches("s").parse()?;
        Duration::try_seconds(seconds)
    } else if duration_str.ends_with("d") {
        let days: i64 = duration_str.trim_end_matches("d").parse()?;
        Duration::try_days(days)
    } else {
        // Bare numbers are seconds
        let seconds: i64 = duration_str.parse()?;
        Duration::try_seconds(seconds)
    };
    duration.ok_or(DurationError::OutOfRange)
}

/// Splits the comma-separated tag field of the upload form.
pub fn split_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn expand_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            path.replacen("~", &home, 1)
        } else {
            path.to_string()
        }
    } else {
        path.to_string()
    }
}
