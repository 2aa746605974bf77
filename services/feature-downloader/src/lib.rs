//!
//! src/lib.rs
//!
//! Builds genre labeled audio-feature datasets from Spotify playlists
//! for the classifier's training data
//!
//!

pub mod config;
pub mod errors;
pub mod fetch;
pub mod logging;
pub mod pipeline;
pub mod sink;
pub mod types;

pub use errors::{ApiError, DownloaderError, SinkError};
pub use fetch::{SpotifyApi, SpotifyClient};
pub use pipeline::{Downloader, DownloaderLimits, ExtractReport};
