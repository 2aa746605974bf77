use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaylistId(pub String);

impl TrackId {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl PlaylistId {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl fmt::Display for PlaylistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self { TrackId(s.to_string()) }
}

impl From<&str> for PlaylistId {
    fn from(s: &str) -> Self { PlaylistId(s.to_string()) }
}

/// Track payload of a playlist entry. Local files and unavailable tracks
/// come back without an id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistItem {
    #[serde(default)]
    pub track: Option<TrackRef>,
}

/// GET /v1/playlists/{id}/tracks, trimmed to the fields we read
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistPage {
    pub total: u32,
    #[serde(default)]
    pub items: Vec<Option<PlaylistItem>>,
}

impl PlaylistPage {
    /// Non-null track ids of this page, deduplicated within the page only.
    /// First occurrence wins, so the page order is kept.
    pub fn track_ids(&self) -> Vec<TrackId> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .flatten()
            .filter_map(|item| item.track.as_ref())
            .filter_map(|track| track.id.as_deref())
            .filter(|id| seen.insert(*id))
            .map(TrackId::from)
            .collect()
    }
}

/// Vendor-defined audio features of one track, kept as a raw JSON object so
/// new attributes flow through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureRecord(pub Map<String, Value>);

impl FeatureRecord {
    pub const GENRE_KEY: &'static str = "genre";

    pub fn with_genre(mut self, genre: &str) -> Self {
        self.0.insert(Self::GENRE_KEY.to_string(), Value::String(genre.to_string()));
        self
    }

    pub fn genre(&self) -> Option<&str> {
        self.0.get(Self::GENRE_KEY).and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }
}

/// GET /v1/audio-features?ids=...
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioFeaturesPage {
    #[serde(default)]
    pub audio_features: Vec<Option<FeatureRecord>>,
}

/// Genre label -> playlists, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenreMap(pub Vec<(String, Vec<PlaylistId>)>);

impl GenreMap {
    /// Parses `{ "genre": ["playlist id", ...], ... }`, keeping key order
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        let raw: Map<String, Value> = serde_json::from_str(s)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (genre, playlists) in raw {
            let playlists: Vec<String> = serde_json::from_value(playlists)?;
            entries.push((genre, playlists.into_iter().map(PlaylistId).collect()));
        }
        Ok(GenreMap(entries))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[PlaylistId])> {
        self.0.iter().map(|(genre, ids)| (genre.as_str(), ids.as_slice()))
    }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}
