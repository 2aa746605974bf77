//!
//! src/main.rs
//!
//! Entry point: load config, authenticate once, then build one
//! dataset per genre in the configured genre map
//!
//!

use feature_downloader::{config, fetch, logging, sink};
use feature_downloader::{Downloader, DownloaderError, DownloaderLimits};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), DownloaderError> {
    let cfgs = config::load_config()?;
    let _logger = logging::init_logging(&cfgs.logging)?;

    tracing::info!(
        service="feature-downloader",
        version=%env!("CARGO_PKG_VERSION"),
        genres = cfgs.genres.len(),
        out = %cfgs.pipeline.output_dir.display(),
        "starting"
    );
    tracing::debug!(config = ?cfgs, "config.loaded");

    let mut spotify = fetch::SpotifyClient::new(&cfgs.http, &cfgs.spotify)?;
    spotify.authenticate().await?;

    let disk   = sink::DiskJsonSink::new(&cfgs.pipeline.output_dir);
    let limits = DownloaderLimits::from(&cfgs.pipeline);
    let downloader = Downloader::new(&spotify, disk, limits);

    let reports = downloader.extract_features_from_multiple_playlists(&cfgs.genres).await;

    let written = reports.iter().filter(|r| r.path.is_some()).count();
    let records: usize = reports.iter().map(|r| r.record_count).sum();
    tracing::info!(datasets = written, failed = reports.len() - written, records, "finished");

    Ok(())
}
