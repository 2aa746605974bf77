//!
//! src/fetch.rs
//!
//! Defines the Spotify Web API client: token exchange, request
//! builders for the two endpoints the pipeline reads, and the
//! retrying transport underneath them
//!

use std::time::Duration;

use async_trait::async_trait;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use reqwest::{Client, StatusCode, header, redirect, RequestBuilder};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::config::{HttpConfig, RetryConfig, SpotifyConfig};
use crate::errors::{ApiError, DownloaderError};
use crate::types::{AudioFeaturesPage, FeatureRecord, PlaylistId, PlaylistPage, TrackId};

/// Only the fields of a playlist page the enumerator reads
const PLAYLIST_FIELDS: &str = "total,items(track(id))";

/// What the pipeline needs from the vendor. Implemented over HTTP by
/// `SpotifyClient`; tests script their own.
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    /// One window of a playlist's entries, starting at `offset`
    async fn playlist_items(&self, playlist: &PlaylistId, offset: u32, limit: u32) ->
        Result<PlaylistPage, ApiError>;

    /// Audio features for up to 100 ids. Entries are `None` where the
    /// vendor has no analysis for a track.
    async fn audio_features(&self, ids: &[TrackId]) ->
        Result<Vec<Option<FeatureRecord>>, ApiError>;
}

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder  {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, DownloaderError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_helper(http)
        .default_headers(h)
        .build()
        .map_err(|e| DownloaderError::Config(format!("build client: {e}")))
}

/// Simple function to generate random wait for http_with_retry
fn generate_backoff(base: Duration, attempt: u8, rng: &mut SmallRng) -> Duration {
    let exp = base * (1_u32 << attempt.min(6));
    let jitter = rng.gen_range(50..=200);
    exp + Duration::from_millis(jitter)
}

/// Maps a non-success status to the error the caller sees
fn status_error(status: StatusCode, url: &str) -> ApiError {
    match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(url.to_string()),
        _ => ApiError::Transport(format!("status {status} for {url}")),
    }
}

async fn http_with_retry(
    request: RequestBuilder,
    retry: &RetryConfig
) -> Result<serde_json::Value, ApiError> {
    let mut rng = SmallRng::from_entropy();
    let mut attempt = 0_u8;
    loop {
        let response = request.try_clone()
            .ok_or_else(|| ApiError::Transport("non-cloneable request".to_string()))?
            .send()
            .await;
        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return resp.json::<serde_json::Value>()
                        .await
                        .map_err(|e| ApiError::Malformed(e.to_string()));
                }
                let url = resp.url().to_string();
                let retryable = retry.retryable_statuses.contains(&status.as_u16());
                if !retryable || attempt >= retry.max_attempts {
                    return Err(status_error(status, &url));
                }
                let backoff = generate_backoff(retry.base_backoff, attempt, &mut rng);
                warn!(status = %status, backoff = ?backoff.as_millis(), "http.retry");
                sleep(backoff).await;
                attempt += 1;
            },
            Err(e) => {
                if attempt >= retry.max_attempts {
                    return Err(e.into());
                }
                let backoff = generate_backoff(retry.base_backoff, attempt, &mut rng);
                warn!(error = %e, backoff = ?backoff.as_millis(), "http.retry.error");
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Clone, Debug)]
pub struct SpotifyClient {
    pub http: Client,
    pub cfg: SpotifyConfig,
    retry: RetryConfig,
    bearer: Option<String>
}

impl SpotifyClient {
    pub fn new(http_config: &HttpConfig, cfg: &SpotifyConfig) ->
        Result<Self, DownloaderError> {

        let http = base_client(http_config)?;
        Ok( Self {
            http,
            cfg: cfg.clone(),
            retry: http_config.retry.clone(),
            bearer: None
        })
    }

    /// POST {token_url} grant_type=client_credentials
    pub fn token_request(&self) -> RequestBuilder {
        self.http
            .post(self.cfg.token_url.clone())
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
    }

    /// Exchanges the client credentials for a bearer token. Called once at
    /// startup; the client is read-only afterwards.
    pub async fn authenticate(&mut self) -> Result<(), ApiError> {
        let value = http_with_retry(self.token_request(), &self.retry).await?;
        let token: TokenResponse = serde_json::from_value(value)?;
        debug!(expires_in = token.expires_in, "spotify.token");
        self.bearer = Some(token.access_token);
        Ok(())
    }

    fn bearer(&self) -> Result<&str, ApiError> {
        self.bearer
            .as_deref()
            .ok_or_else(|| ApiError::Transport("spotify client not authenticated".to_string()))
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.cfg.api_base
            .join(path)
            .map_err(|e| ApiError::Transport(format!("bad endpoint {path}: {e}")))
    }

    /// GET /v1/playlists/{id}/tracks?offset=&limit=&fields=
    pub fn playlist_tracks(&self, playlist_id: &str, offset: u32, limit: u32, bearer: &str) ->
        Result<RequestBuilder, ApiError> {
        let url = self.endpoint(&format!("playlists/{playlist_id}/tracks"))?;
        Ok(self.http.get(url).bearer_auth(bearer).query(&[
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            ("fields", PLAYLIST_FIELDS.to_string())
        ]))
    }

    /// GET /v1/audio-features?ids=...
    pub fn batch_audio_features(&self, ids_csv: &str, bearer: &str) ->
        Result<RequestBuilder, ApiError> {
        let url = self.endpoint("audio-features")?;
        Ok(self.http.get(url).bearer_auth(bearer).query(&[("ids", ids_csv)]))
    }
}

#[async_trait]
impl SpotifyApi for SpotifyClient {
    async fn playlist_items(&self, playlist: &PlaylistId, offset: u32, limit: u32) ->
        Result<PlaylistPage, ApiError> {
        let request = self.playlist_tracks(playlist.as_str(), offset, limit, self.bearer()?)?;
        let value = http_with_retry(request, &self.retry).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn audio_features(&self, ids: &[TrackId]) ->
        Result<Vec<Option<FeatureRecord>>, ApiError> {
        let ids_csv = ids.iter().map(TrackId::as_str).collect::<Vec<_>>().join(",");
        let request = self.batch_audio_features(&ids_csv, self.bearer()?)?;
        let value = http_with_retry(request, &self.retry).await?;
        let page: AudioFeaturesPage = serde_json::from_value(value)?;
        Ok(page.audio_features)
    }
}
