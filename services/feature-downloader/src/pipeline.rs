//!
//! src/pipeline.rs
//!
//! Playlist -> track ids -> audio features -> genre labeled dataset.
//! Every request is awaited before the next one goes out.
//!

use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, FEATURE_BATCH_DEFAULT, FEATURE_BATCH_LIMIT, PLAYLIST_PAGE_LIMIT};
use crate::errors::ApiError;
use crate::fetch::SpotifyApi;
use crate::sink::DiskJsonSink;
use crate::types::{FeatureRecord, GenreMap, PlaylistId, TrackId};

#[derive(Clone, Debug)]
pub struct DownloaderLimits {
    pub page_size: u32,
    pub feature_batch: usize
}

impl Default for DownloaderLimits {
    fn default() -> Self {
        Self {
            page_size: PLAYLIST_PAGE_LIMIT,
            feature_batch: FEATURE_BATCH_DEFAULT
        }
    }
}

impl DownloaderLimits {
    /// Pulls both sizes into what the vendor accepts; a zero window would
    /// never advance and a zero batch cannot be chunked.
    pub fn clamped(self) -> Self {
        Self {
            page_size: self.page_size.clamp(1, PLAYLIST_PAGE_LIMIT),
            feature_batch: self.feature_batch.clamp(1, FEATURE_BATCH_LIMIT)
        }
    }
}

impl From<&PipelineConfig> for DownloaderLimits {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            page_size: cfg.page_size,
            feature_batch: cfg.feature_batch
        }.clamped()
    }
}

/// Outcome of one dataset: how many ids went in, how many labeled records
/// came out, and where they were written (`None` if the write failed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub name: String,
    pub track_count: usize,
    pub record_count: usize,
    pub path: Option<PathBuf>
}

/// Drops missing records and stamps `genre` on the rest
pub fn label_features(records: Vec<Option<FeatureRecord>>, genre: &str) -> Vec<FeatureRecord> {
    records
        .into_iter()
        .flatten()
        .map(|record| record.with_genre(genre))
        .collect()
}

/// Offset of the window after `offset`, or `None` once `total` is covered.
/// An offset past `u32::MAX` ends the walk.
fn next_window(offset: u32, limit: u32, total: u32) -> Option<u32> {
    offset.checked_add(limit).filter(|next| *next < total)
}

pub struct Downloader<'a, A: ?Sized> {
    api: &'a A,
    sink: DiskJsonSink,
    limits: DownloaderLimits
}

impl<'a, A: SpotifyApi + ?Sized> Downloader<'a, A> {
    pub fn new(api: &'a A, sink: DiskJsonSink, limits: DownloaderLimits) -> Self {
        Self { api, sink, limits: limits.clamped() }
    }

    pub fn sink(&self) -> &DiskJsonSink {
        &self.sink
    }

    /// Walks the playlist one window at a time until the reported total is
    /// covered. Null ids are dropped and duplicates are removed per page.
    pub async fn track_ids_from_playlist(&self, playlist: &PlaylistId) ->
        Result<Vec<TrackId>, ApiError> {

        let limit = self.limits.page_size;
        let first = self.api.playlist_items(playlist, 0, limit).await?;
        let total = first.total;
        let mut ids = first.track_ids();
        debug!(playlist = %playlist, offset = 0, total, kept = ids.len(), "pipeline.enumerate.page");

        let mut next = (limit < total).then_some(limit);
        while let Some(offset) = next {
            let page = self.api.playlist_items(playlist, offset, limit).await?;
            let page_ids = page.track_ids();
            debug!(playlist = %playlist, offset, total, kept = page_ids.len(), "pipeline.enumerate.page");
            ids.extend(page_ids);
            next = next_window(offset, limit, total);
        }

        info!(playlist = %playlist, total, tracks = ids.len(), "pipeline.enumerate.done");
        Ok(ids)
    }

    /// One batched request per chunk. A failed chunk is retried one id at a
    /// time and ids that still fail are dropped.
    pub async fn features_from_track_ids(&self, ids: &[TrackId]) -> Vec<Option<FeatureRecord>> {
        let batch = self.limits.feature_batch;
        let mut features = Vec::with_capacity(ids.len());

        for (n, chunk) in ids.chunks(batch).enumerate() {
            let start = n * batch;
            let end = start + chunk.len() - 1;
            info!(start, end, "pipeline.features.chunk");

            match self.api.audio_features(chunk).await {
                Ok(returned) => features.extend(returned),
                Err(e) => {
                    warn!(start, end, error = %e, "pipeline.features.chunk.failed");
                    for id in chunk {
                        match self.api.audio_features(std::slice::from_ref(id)).await {
                            Ok(single) => features.extend(single),
                            Err(e) => {
                                warn!(track = %id, error = %e, "pipeline.features.dropped");
                            }
                        }
                    }
                }
            }
        }

        features
    }

    /// Writes the dataset; failures are logged and reported, never raised
    fn write_dataset(&self, filename: &str, records: &[FeatureRecord]) -> Option<PathBuf> {
        match self.sink.write_records(filename, records) {
            Ok(path) => {
                info!(path = %path.display(), records = records.len(), "pipeline.write");
                Some(path)
            }
            Err(e) => {
                error!(file = %self.sink.path_for(filename).display(), error = %e, "pipeline.write.failed");
                None
            }
        }
    }

    /// Single playlist dataset, written to `filename` or `<playlist_id>.json`
    pub async fn extract_features_from_playlist(
        &self,
        playlist: &PlaylistId,
        genre: &str,
        filename: Option<&str>
    ) -> ExtractReport {
        let track_ids = match self.track_ids_from_playlist(playlist).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(playlist = %playlist, error = %e, "pipeline.enumerate.failed");
                Vec::new()
            }
        };

        let features = self.features_from_track_ids(&track_ids).await;
        let records = label_features(features, genre);

        let filename = filename
            .map(str::to_string)
            .unwrap_or_else(|| format!("{playlist}.json"));
        let path = self.write_dataset(&filename, &records);

        let report = ExtractReport {
            name: playlist.to_string(),
            track_count: track_ids.len(),
            record_count: records.len(),
            path
        };
        info!(name = %report.name, genre, tracks = report.track_count,
            records = report.record_count, "pipeline.extract.done");
        report
    }

    /// One `<genre>.json` per genre holding every playlist's tracks. Playlists
    /// are concatenated as-is, so a track listed twice is fetched twice.
    pub async fn extract_features_from_multiple_playlists(&self, genres: &GenreMap) ->
        Vec<ExtractReport> {

        let mut reports = Vec::with_capacity(genres.len());
        for (genre, playlists) in genres.iter() {
            let mut track_ids = Vec::new();
            for playlist in playlists {
                match self.track_ids_from_playlist(playlist).await {
                    Ok(ids) => track_ids.extend(ids),
                    Err(e) => {
                        error!(genre, playlist = %playlist, error = %e, "pipeline.enumerate.failed");
                    }
                }
            }

            let features = self.features_from_track_ids(&track_ids).await;
            let records = label_features(features, genre);
            let path = self.write_dataset(&format!("{genre}.json"), &records);

            let report = ExtractReport {
                name: genre.to_string(),
                track_count: track_ids.len(),
                record_count: records.len(),
                path
            };
            info!(genre, playlists = playlists.len(), tracks = report.track_count,
                records = report.record_count, "pipeline.extract.done");
            reports.push(report);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::types::{PlaylistItem, PlaylistPage, TrackRef};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Page { playlist: String, offset: u32, limit: u32 },
        Features(Vec<String>),
    }

    /// Scripted backend. A batch containing a `broken` id fails, and so does
    /// the single lookup of that id; `unanalyzed` ids come back as null.
    #[derive(Default)]
    struct MockApi {
        playlists: HashMap<String, Vec<Option<String>>>,
        broken: HashSet<String>,
        unanalyzed: HashSet<String>,
        calls: Mutex<Vec<Call>>,
    }

    impl MockApi {
        fn with_playlist(mut self, id: &str, entries: Vec<Option<&str>>) -> Self {
            self.playlists.insert(
                id.to_string(),
                entries.into_iter().map(|e| e.map(str::to_string)).collect()
            );
            self
        }

        fn with_broken(mut self, ids: &[&str]) -> Self {
            self.broken.extend(ids.iter().map(|s| s.to_string()));
            self
        }

        fn with_unanalyzed(mut self, ids: &[&str]) -> Self {
            self.unanalyzed.extend(ids.iter().map(|s| s.to_string()));
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn feature_calls(&self) -> Vec<Vec<String>> {
            self.calls().into_iter()
                .filter_map(|c| match c { Call::Features(ids) => Some(ids), _ => None })
                .collect()
        }

        fn page_offsets(&self) -> Vec<u32> {
            self.calls().into_iter()
                .filter_map(|c| match c { Call::Page { offset, .. } => Some(offset), _ => None })
                .collect()
        }
    }

    fn features_for(id: &str) -> FeatureRecord {
        let energy = id.bytes().map(u32::from).sum::<u32>() % 100;
        serde_json::from_value(json!({
            "id": id,
            "energy": f64::from(energy) / 100.0,
            "tempo": 120.5,
            "mode": 1
        })).unwrap()
    }

    #[async_trait]
    impl SpotifyApi for MockApi {
        async fn playlist_items(&self, playlist: &PlaylistId, offset: u32, limit: u32) ->
            Result<PlaylistPage, ApiError> {
            self.calls.lock().unwrap().push(Call::Page {
                playlist: playlist.to_string(), offset, limit
            });

            let entries = self.playlists.get(playlist.as_str())
                .ok_or_else(|| ApiError::NotFound(format!("playlists/{playlist}")))?;
            let items = entries.iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(|id| Some(PlaylistItem { track: Some(TrackRef { id: id.clone() }) }))
                .collect();
            Ok(PlaylistPage { total: entries.len() as u32, items })
        }

        async fn audio_features(&self, ids: &[TrackId]) ->
            Result<Vec<Option<FeatureRecord>>, ApiError> {
            let ids: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
            self.calls.lock().unwrap().push(Call::Features(ids.clone()));

            if ids.iter().any(|id| self.broken.contains(id)) {
                return Err(ApiError::Transport("status 400 Bad Request".to_string()));
            }
            Ok(ids.iter()
                .map(|id| (!self.unanalyzed.contains(id)).then(|| features_for(id)))
                .collect())
        }
    }

    fn ids(raw: &[&str]) -> Vec<TrackId> {
        raw.iter().map(|s| TrackId::from(*s)).collect()
    }

    fn numbered(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i:03}")).collect()
    }

    fn downloader<'a>(api: &'a MockApi, root: &std::path::Path) -> Downloader<'a, MockApi> {
        Downloader::new(api, DiskJsonSink::new(root), DownloaderLimits::default())
    }

    #[tokio::test]
    async fn enumerator_pages_until_total_and_filters_nulls() {
        // 250 entries, mostly local files without ids
        let mut entries: Vec<Option<&str>> = vec![None; 250];
        entries[0] = Some("a");
        entries[1] = Some("a");
        entries[2] = Some("b");
        entries[150] = Some("a");
        entries[249] = Some("c");

        let api = MockApi::default().with_playlist("pl", entries);
        let dir = tempfile::tempdir().unwrap();
        let got = downloader(&api, dir.path())
            .track_ids_from_playlist(&PlaylistId::from("pl"))
            .await
            .unwrap();

        assert_eq!(api.page_offsets(), vec![0, 100, 200]);
        // "a" repeats across pages but not within one
        assert_eq!(got, ids(&["a", "b", "a", "c"]));
    }

    #[tokio::test]
    async fn enumerator_handles_empty_and_exact_multiple_totals() {
        let full: Vec<String> = numbered("t", 200);
        let api = MockApi::default()
            .with_playlist("empty", vec![])
            .with_playlist("full", full.iter().map(|s| Some(s.as_str())).collect());
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&api, dir.path());

        assert!(dl.track_ids_from_playlist(&PlaylistId::from("empty")).await.unwrap().is_empty());
        assert_eq!(dl.track_ids_from_playlist(&PlaylistId::from("full")).await.unwrap().len(), 200);
        assert_eq!(api.page_offsets(), vec![0, 0, 100]);
    }

    #[tokio::test]
    async fn enumerator_surfaces_unknown_playlist() {
        let api = MockApi::default();
        let dir = tempfile::tempdir().unwrap();
        let err = downloader(&api, dir.path())
            .track_ids_from_playlist(&PlaylistId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn fetcher_chunks_by_99_and_keeps_input_order() {
        let raw = numbered("t", 250);
        let track_ids: Vec<TrackId> = raw.iter().map(|s| TrackId::from(s.as_str())).collect();
        let api = MockApi::default();
        let dir = tempfile::tempdir().unwrap();

        let features = downloader(&api, dir.path()).features_from_track_ids(&track_ids).await;

        let sizes: Vec<usize> = api.feature_calls().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![99, 99, 52]);
        assert_eq!(features.len(), 250);
        let got: Vec<&str> = features.iter().map(|f| f.as_ref().unwrap().id().unwrap()).collect();
        assert_eq!(got, raw.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn fetcher_does_not_dedup_and_passes_nulls_through() {
        let api = MockApi::default().with_unanalyzed(&["n"]);
        let dir = tempfile::tempdir().unwrap();

        let features = downloader(&api, dir.path())
            .features_from_track_ids(&ids(&["a", "n", "a"]))
            .await;

        assert_eq!(features.len(), 3);
        assert!(features[1].is_none());
        assert_eq!(features[0], features[2]);
    }

    #[tokio::test]
    async fn fetcher_degrades_failed_chunk_to_single_lookups() {
        let mut raw = numbered("t", 120);
        raw[105] = "bad1".to_string();
        raw[110] = "bad2".to_string();
        let track_ids: Vec<TrackId> = raw.iter().map(|s| TrackId::from(s.as_str())).collect();
        let api = MockApi::default().with_broken(&["bad1", "bad2"]);
        let dir = tempfile::tempdir().unwrap();

        let features = downloader(&api, dir.path()).features_from_track_ids(&track_ids).await;

        let calls = api.feature_calls();
        // first chunk fine, second chunk (21 ids) fails then 21 singles
        assert_eq!(calls.len(), 1 + 1 + 21);
        assert_eq!(calls[0].len(), 99);
        assert_eq!(calls[1].len(), 21);
        assert_eq!(calls[2..].iter().map(|c| c[0].clone()).collect::<Vec<_>>(), raw[99..].to_vec());
        assert!(calls[2..].iter().all(|c| c.len() == 1));

        assert_eq!(features.len(), 118);
        assert!(features.iter().flatten().all(|f| !f.id().unwrap().starts_with("bad")));
    }

    #[test]
    fn labeler_drops_nulls_and_stamps_every_record() {
        let records = vec![
            Some(features_for("a")),
            None,
            Some(features_for("b").with_genre("stale")),
        ];
        let labeled = label_features(records, "edm");
        assert_eq!(labeled.len(), 2);
        assert!(labeled.iter().all(|r| r.genre() == Some("edm")));
    }

    #[tokio::test]
    async fn end_to_end_single_playlist_with_failing_chunk() {
        let mut entries: Vec<Option<&str>> = vec![None; 250];
        let picks = ["p01", "p02", "bad1", "p03", "p04", "p05",
                     "p06", "p07", "bad2", "p08", "p09", "p10"];
        for (slot, id) in [0, 7, 30, 99, 100, 101, 140, 199, 200, 220, 230, 249]
            .into_iter()
            .zip(picks)
        {
            entries[slot] = Some(id);
        }

        let api = MockApi::default()
            .with_playlist("pl", entries)
            .with_broken(&["bad1", "bad2"]);
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&api, dir.path());

        let report = dl.extract_features_from_playlist(&PlaylistId::from("pl"), "rock", None).await;

        assert_eq!(api.page_offsets(), vec![0, 100, 200]);
        let feature_calls = api.feature_calls();
        assert_eq!(feature_calls.len(), 1 + 12);
        assert_eq!(feature_calls[0].len(), 12);

        assert_eq!(report.track_count, 12);
        assert_eq!(report.record_count, 10);
        let path = report.path.unwrap();
        assert_eq!(path, dir.path().join("pl.json"));

        let written = dl.sink().read_records("pl.json").unwrap();
        assert_eq!(written.len(), 10);
        assert!(written.iter().all(|r| r.genre() == Some("rock")));
        let written_ids: Vec<&str> = written.iter().map(|r| r.id().unwrap()).collect();
        assert_eq!(written_ids, picks.iter().copied().filter(|id| !id.starts_with("bad")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn explicit_filename_wins() {
        let api = MockApi::default().with_playlist("pl", vec![Some("a")]);
        let dir = tempfile::tempdir().unwrap();
        let report = downloader(&api, dir.path())
            .extract_features_from_playlist(&PlaylistId::from("pl"), "jazz", Some("custom.json"))
            .await;
        assert_eq!(report.path, Some(dir.path().join("custom.json")));
    }

    #[tokio::test]
    async fn failed_enumeration_still_writes_empty_dataset() {
        let api = MockApi::default();
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&api, dir.path());

        let report = dl.extract_features_from_playlist(&PlaylistId::from("gone"), "jazz", None).await;
        assert_eq!(report.record_count, 0);
        assert!(dl.sink().read_records("gone.json").unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, "x").unwrap();

        let api = MockApi::default().with_playlist("pl", vec![Some("a"), Some("b")]);
        let dl = Downloader::new(&api, DiskJsonSink::new(&blocker), DownloaderLimits::default());

        let report = dl.extract_features_from_playlist(&PlaylistId::from("pl"), "rock", None).await;
        assert_eq!(report.record_count, 2);
        assert_eq!(report.path, None);
    }

    #[tokio::test]
    async fn aggregator_writes_one_file_per_genre() {
        let api = MockApi::default()
            .with_playlist("r1", vec![Some("shared"), Some("r-only")])
            .with_playlist("r2", vec![Some("shared"), None])
            .with_playlist("e1", vec![Some("shared"), Some("e-only")])
            .with_unanalyzed(&["r-only"]);
        let genres = GenreMap::from_json_str(
            r#"{ "rock": ["r1", "missing", "r2"], "edm": ["e1"] }"#
        ).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&api, dir.path());

        let reports = dl.extract_features_from_multiple_playlists(&genres).await;

        assert_eq!(reports.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["rock", "edm"]);
        // rock: shared, r-only, shared (missing playlist skipped, no dedup)
        assert_eq!(reports[0].track_count, 3);
        assert_eq!(reports[0].record_count, 2);
        assert_eq!(reports[1].record_count, 2);

        let rock = dl.sink().read_records("rock.json").unwrap();
        assert_eq!(rock.iter().map(|r| r.id().unwrap()).collect::<Vec<_>>(), vec!["shared", "shared"]);
        assert!(rock.iter().all(|r| r.genre() == Some("rock")));

        let edm = dl.sink().read_records("edm.json").unwrap();
        assert!(edm.iter().any(|r| r.id() == Some("shared")));
        assert!(edm.iter().all(|r| r.genre() == Some("edm")));
    }

    #[tokio::test]
    async fn rerun_produces_identical_bytes() {
        let api = MockApi::default()
            .with_playlist("r1", vec![Some("a"), Some("b"), None, Some("c")])
            .with_broken(&["b"]);
        let genres = GenreMap::from_json_str(r#"{ "rock": ["r1"] }"#).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&api, dir.path());

        dl.extract_features_from_multiple_playlists(&genres).await;
        let first = std::fs::read(dir.path().join("rock.json")).unwrap();
        dl.extract_features_from_multiple_playlists(&genres).await;
        let second = std::fs::read(dir.path().join("rock.json")).unwrap();

        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn zero_batch_size_is_clamped_not_panicking() {
        let api = MockApi::default();
        let dir = tempfile::tempdir().unwrap();
        let limits = DownloaderLimits { page_size: 100, feature_batch: 0 };
        let dl = Downloader::new(&api, DiskJsonSink::new(dir.path()), limits);

        let features = dl.features_from_track_ids(&ids(&["a", "b", "c"])).await;

        assert_eq!(features.len(), 3);
        assert_eq!(api.feature_calls().len(), 3);
    }

    #[tokio::test]
    async fn zero_page_size_still_advances() {
        let api = MockApi::default()
            .with_playlist("pl", vec![Some("a"), Some("b"), None, Some("c"), Some("d")]);
        let dir = tempfile::tempdir().unwrap();
        let limits = DownloaderLimits { page_size: 0, feature_batch: 99 };
        let dl = Downloader::new(&api, DiskJsonSink::new(dir.path()), limits);

        let got = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            dl.track_ids_from_playlist(&PlaylistId::from("pl"))
        ).await.expect("enumeration should finish").unwrap();

        assert_eq!(got, ids(&["a", "b", "c", "d"]));
        assert_eq!(api.page_offsets(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn oversized_limits_are_capped_at_vendor_limits() {
        let limits = DownloaderLimits { page_size: 500, feature_batch: 1000 }.clamped();
        assert_eq!(limits.page_size, 100);
        assert_eq!(limits.feature_batch, 100);
    }

    #[test]
    fn next_window_stops_at_total_and_on_overflow() {
        assert_eq!(next_window(0, 100, 250), Some(100));
        assert_eq!(next_window(200, 100, 250), None);
        assert_eq!(next_window(100, 100, 200), None);
        assert_eq!(next_window(u32::MAX - 50, 100, u32::MAX), None);
    }

    #[test]
    fn limits_follow_pipeline_config() {
        let cfg = PipelineConfig {
            page_size: 50,
            feature_batch: 0,
            output_dir: PathBuf::from("data")
        };
        let limits = DownloaderLimits::from(&cfg);
        assert_eq!(limits.page_size, 50);
        assert_eq!(limits.feature_batch, 1);
    }
}
