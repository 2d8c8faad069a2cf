//! Track metadata as broadcast to the relay, and its dedup identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A track playing on the performer's deck.
///
/// Only `artist` and `title` take part in dedup. The remaining fields are
/// informational and travel with `BROADCAST_TRACK` and `METADATA_UPDATED`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f32>,

    /// Musical key as reported by the analysis engine, e.g. `"8A"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Identity of a track for broadcast dedup and repeat tracking.
///
/// The wire-compatible form is `artist:title` with `"Unknown"` and
/// `"Untitled"` substituted for missing or empty parts. Dedup correctness
/// depends on this exact concatenation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackKey(String);

impl Track {
    /// Fallback for a missing or empty artist.
    pub const UNKNOWN_ARTIST: &'static str = "Unknown";

    /// Fallback for a missing or empty title.
    pub const UNTITLED: &'static str = "Untitled";

    /// Separator between artist and title in a [`TrackKey`].
    pub const KEY_SEPARATOR: char = ':';

    #[must_use]
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: Some(artist.into()),
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// The artist, or `"Unknown"` when missing or empty.
    #[must_use]
    pub fn artist(&self) -> &str {
        self.artist
            .as_deref()
            .filter(|artist| !artist.is_empty())
            .unwrap_or(Self::UNKNOWN_ARTIST)
    }

    /// The title, or `"Untitled"` when missing or empty.
    #[must_use]
    pub fn title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|title| !title.is_empty())
            .unwrap_or(Self::UNTITLED)
    }

    #[must_use]
    pub fn key(&self) -> TrackKey {
        TrackKey(format!(
            "{}{}{}",
            self.artist(),
            Self::KEY_SEPARATOR,
            self.title()
        ))
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist(), self.title())
    }
}

impl TrackKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
