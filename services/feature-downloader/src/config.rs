//!
//! src/config.rs
//!
//! Loads every setting the downloader needs from the environment
//! (optionally seeded by a .env file) at program start
//!

use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use url::Url;

use crate::errors::DownloaderError;
use crate::types::{GenreMap, PlaylistId};

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 4;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

pub const RETRY_MAX_ATTEMPTS: u8 = 3;
pub const RETRY_BASE_BACKOFF: u64 = 500;
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Vendor limits: 100 playlist items per page, 100 ids per features call
pub const PLAYLIST_PAGE_LIMIT: u32 = 100;
pub const FEATURE_BATCH_LIMIT: usize = 100;
/// One under the vendor limit; matches the batches the dataset was built with
pub const FEATURE_BATCH_DEFAULT: usize = 99;

/// Wrapper over env::var to return an invalid enviroment var error
fn env_check(s: &str) -> Result<String, DownloaderError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DownloaderError::Config(format!("{s} was not set"))),
    }
}

/// Parses an optional env var, falling back to `default` when unset or junk
fn env_or<T: FromStr>(s: &str, default: T) -> T {
    std::env::var(s)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
}

/// Configuration that Spotify expects when hitting endpoints
#[derive(Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: Url,
    pub api_base: Url,
}

// keeps the secret out of the startup log
impl std::fmt::Debug for SpotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url.as_str())
            .field("api_base", &self.api_base.as_str())
            .finish()
    }
}

fn build_spotify() -> Result<SpotifyConfig, DownloaderError> {
    let client_id     = env_check("SPOTIFY_CLIENT_ID")?;
    let client_secret = env_check("SPOTIFY_CLIENT_SECRET")?;

    // form urls
    let token_url = std::env::var("SPOTIFY_TOKEN_URL")
        .unwrap_or_else(|_| "https://accounts.spotify.com/api/token".to_string());

    let api_base  = std::env::var("SPOTIFY_API_BASE")
        .unwrap_or_else(|_| "https://api.spotify.com/v1/".to_string());

    let token_url = Url::parse(&token_url)
        .map_err(|e| DownloaderError::Config(
            format!("SPOTIFY_TOKEN_URL invalid {e}")
        ))?;

    let mut api_base = Url::parse(&api_base)
        .map_err(|e| DownloaderError::Config(
            format!("SPOTIFY_API_BASE invalid {e}")
        ))?;

    // ensure valid https and hostname for both urls
    ensure_https(&token_url).map_err(DownloaderError::Config)?;
    ensure_https(&api_base).map_err(DownloaderError::Config)?;
    ensure_host(&token_url, "accounts.spotify.com")
        .map_err(DownloaderError::Config)?;
    ensure_host(&api_base, "api.spotify.com")
        .map_err(DownloaderError::Config)?;

    ensure_trailing_slash(&mut api_base);

    Ok( SpotifyConfig { client_id, client_secret, token_url, api_base })
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub base_backoff: time::Duration,
    pub retryable_statuses: Vec<u16>
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_backoff: time::Duration::from_millis(RETRY_BASE_BACKOFF),
            retryable_statuses: RETRYABLE_STATUSES.to_vec()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
    pub retry: RetryConfig
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
            retry: RetryConfig::default()
        }
    }
}

fn build_http() -> HttpConfig {
    let mut http = HttpConfig::default();
    http.retry.max_attempts = env_or("HTTP_MAX_RETRIES", RETRY_MAX_ATTEMPTS);
    http.retry.base_backoff = time::Duration::from_millis(
        env_or("HTTP_BACKOFF_MS", RETRY_BASE_BACKOFF)
    );
    http
}

///
/// Configuration for paging, batching and where datasets land
///
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub page_size: u32,
    pub feature_batch: usize,
    pub output_dir: PathBuf
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: PLAYLIST_PAGE_LIMIT,
            feature_batch: FEATURE_BATCH_DEFAULT,
            output_dir: default_output_dir()
        }
    }
}

/// `data/` next to the running binary, or under the cwd if that is unknown
fn default_output_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("data")))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn build_pipeline() -> PipelineConfig {
    let page_size = env_or("PLAYLIST_PAGE_SIZE", PLAYLIST_PAGE_LIMIT)
        .clamp(1, PLAYLIST_PAGE_LIMIT);
    let feature_batch = env_or("FEATURE_BATCH_SIZE", FEATURE_BATCH_DEFAULT)
        .clamp(1, FEATURE_BATCH_LIMIT);
    let output_dir = std::env::var("FEATURES_OUT_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_output_dir);

    PipelineConfig { page_size, feature_batch, output_dir }
}

///
/// Playlists that make up each genre's dataset
///
const DEFAULT_GENRES: &[(&str, &[&str])] = &[
    ("rock", &[
        "37i9dQZF1DWZJhOVGWqUKF",
        "37i9dQZF1DX4vth7idTQch",
        "37i9dQZF1DX3oM43CtKnRV",
        "37i9dQZF1DX1spT6G94GFC",
        "37i9dQZF1DXcF6B6QPhFDv",
        "37i9dQZF1DWWzBc3TOlaAV",
    ]),
    ("edm", &[
        "37i9dQZF1DX0pH2SQMRXnC",
        "37i9dQZF1DX6J5NfMJS675",
        "37i9dQZF1DX7ZUug1ANKRP",
        "6FjUyONoZCmdvKPfeWEohP",
        "5oJkaanfqM8upo86pAu96I",
    ]),
    ("classic", &[
        "37i9dQZF1DXaHEllsiT8lf",
        "37i9dQZF1DWZf52HmhYw49",
        "37i9dQZF1DWWEJlAGA9gs0",
        "1h0CEZCm6IbFTbxThn6Xcs",
        "37i9dQZF1DXaHEllsiT8lf",
    ]),
    ("jazz", &[
        "37i9dQZF1DWTR4ZOXTfd9K",
        "37i9dQZF1DX1C8KR4UJlnr",
        "37i9dQZF1DX9n1kQRulpEn",
        "37i9dQZF1DWYxwmBaMqxsl",
        "37i9dQZF1DX2iVTU1bf67i",
    ]),
    ("hiphop", &[
        "37i9dQZF1DX7Mq3mO5SSDc",
        "37i9dQZF1DX186v583rmzp",
        "5TZkls9cEOzWDR6qCxwDot",
        "3A46xM92rYMDL7Ohezea0H",
    ]),
];

pub fn default_genre_map() -> GenreMap {
    GenreMap(
        DEFAULT_GENRES
            .iter()
            .map(|(genre, ids)| {
                (genre.to_string(), ids.iter().map(|id| PlaylistId::from(*id)).collect())
            })
            .collect()
    )
}

fn build_genre_map() -> Result<GenreMap, DownloaderError> {
    let Ok(path) = std::env::var("GENRE_MAP_PATH") else {
        return Ok(default_genre_map());
    };

    let raw = std::fs::read_to_string(&path)
        .map_err(|e| DownloaderError::Config(format!("GENRE_MAP_PATH {path}: {e}")))?;
    let map = GenreMap::from_json_str(&raw)
        .map_err(|e| DownloaderError::Config(format!("GENRE_MAP_PATH {path} invalid: {e}")))?;

    if map.is_empty() {
        return Err(DownloaderError::Config(format!("GENRE_MAP_PATH {path} has no genres")));
    }
    Ok(map)
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json"   => Ok(LogFormat::Json),
            other    => Err(format!("unknown log format {other}"))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,feature_downloader=debug,reqwest=warn".to_string(),
            format: LogFormat::Pretty,
            with_ansi: true,
            include_file_line: false,
            include_target: true
        }
    }
}

fn build_logging() -> LoggingConfig {
    LoggingConfig {
        format: env_or("LOG_FORMAT", LogFormat::Pretty),
        ..LoggingConfig::default()
    }
}

///
/// AppConfig which holds everything main wires together
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spotify: SpotifyConfig,
    pub http: HttpConfig,
    pub pipeline: PipelineConfig,
    pub genres: GenreMap,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, DownloaderError> {
    dotenvy::dotenv().ok();

    let spotify  = build_spotify()?;
    let http     = build_http();
    let pipeline = build_pipeline();
    let genres   = build_genre_map()?;
    let logging  = build_logging();

    Ok( AppConfig { spotify, http, pipeline, genres, logging } )
}
