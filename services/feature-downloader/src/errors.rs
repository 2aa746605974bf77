//!
//! src/errors.rs
//!
//! Defines enums and methods of error conversion
//! for errors the downloader uses
//!
//!

use thiserror::Error;

/// Failure kinds of a single Spotify API call. The pipeline branches on
/// these, so the set is kept closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Malformed(e.to_string())
        } else if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            ApiError::NotFound(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self { ApiError::Malformed(e.to_string()) }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SinkError {
    pub fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        SinkError::Io { path: path.to_string(), source }
    }
}

#[derive(Error, Debug)]
pub enum DownloaderError {
    #[error("config error: {0}")]
    Config(String),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for DownloaderError {
    fn from(e: reqwest::Error) -> Self { DownloaderError::Api(e.into()) }
}

impl From<serde_json::Error> for DownloaderError {
    fn from(e: serde_json::Error) -> Self { DownloaderError::Api(e.into()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_are_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err();
        assert!(matches!(ApiError::from(err), ApiError::Malformed(_)));
    }

    #[test]
    fn api_errors_lift_into_downloader_errors() {
        let err: DownloaderError = ApiError::NotFound("playlists/x".into()).into();
        assert_eq!(err.to_string(), "api error: not found: playlists/x");
    }
}
