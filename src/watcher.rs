//! VirtualDJ history watcher.
//!
//! VirtualDJ appends every track it plays to a daily `.m3u` file in its
//! `History` directory. The last two lines of the newest file describe the
//! track on air:
//!
//! ```text
//! #EXTVDJ:<time>23:14</time><lastplaytime>1718230440</lastplaytime><artist>Bicep</artist><title>Glue</title>
//! /Users/dj/Music/Bicep - Glue.mp3
//! ```
//!
//! The newest file is picked by modification time rather than by date in
//! its name: after midnight VirtualDJ keeps writing to the file of the day
//! the set started.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::{Duration, SystemTime},
};

use regex_lite::Regex;

use crate::{error::Result, track::Track};

/// Prefix of the metadata line of a history entry.
const EXTVDJ: &str = "#EXTVDJ:";

/// Fallback for a missing artist or title.
const UNKNOWN: &str = "Unknown";

static ARTIST: LazyLock<Regex> = LazyLock::new(|| tag("artist"));
static TITLE: LazyLock<Regex> = LazyLock::new(|| tag("title"));
static LAST_PLAY_TIME: LazyLock<Regex> = LazyLock::new(|| tag("lastplaytime"));

fn tag(name: &str) -> Regex {
    Regex::new(&format!("<{name}>(.*?)</{name}>")).expect("tag pattern is valid")
}

fn extract<'a>(regex: &Regex, line: &'a str) -> Option<&'a str> {
    regex
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// The last entry of a history file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HistoryEntry {
    pub artist: String,
    pub title: String,
    pub file_path: String,

    /// Seconds since the epoch as VirtualDJ wrote it, or 0 when missing.
    pub played_at: u64,
}

impl HistoryEntry {
    #[must_use]
    pub fn track(&self) -> Track {
        Track {
            file_path: Some(self.file_path.clone()),
            ..Track::new(self.artist.clone(), self.title.clone())
        }
    }
}

/// Parses the last entry of the contents of a history file.
#[must_use]
pub fn parse(contents: &str) -> Option<HistoryEntry> {
    let lines: Vec<&str> = contents.trim().lines().collect();
    let [.., metadata, file_path] = lines.as_slice() else {
        return None;
    };

    if !metadata.starts_with(EXTVDJ) {
        return None;
    }

    Some(HistoryEntry {
        artist: extract(&ARTIST, metadata).unwrap_or(UNKNOWN).to_owned(),
        title: extract(&TITLE, metadata).unwrap_or(UNKNOWN).to_owned(),
        file_path: (*file_path).to_owned(),
        played_at: extract(&LAST_PLAY_TIME, metadata)
            .and_then(|time| time.parse().ok())
            .unwrap_or(0),
    })
}

/// Returns the most recently modified `.m3u` file in `dir`.
///
/// # Errors
///
/// Will return `Err` if `dir` cannot be read.
pub async fn latest_file(dir: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut latest: Option<(SystemTime, PathBuf)> = None;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "m3u") {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if latest.as_ref().is_none_or(|(newest, _)| modified > *newest) {
            latest = Some((modified, path));
        }
    }

    Ok(latest.map(|(_, path)| path))
}

/// Reads the last entry of the newest history file in `dir`.
///
/// # Errors
///
/// Will return `Err` if `dir` cannot be read.
pub async fn latest_entry(dir: impl AsRef<Path>) -> Result<Option<HistoryEntry>> {
    let Some(path) = latest_file(dir).await? else {
        return Ok(None);
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(parse(&contents)),
        Err(e) => {
            // VirtualDJ may be rewriting the file; try again next poll.
            debug!("could not read {}: {e}", path.display());
            Ok(None)
        }
    }
}

/// Polls a history directory for new entries.
#[derive(Debug)]
pub struct Watcher {
    dir: PathBuf,
    interval: Duration,
    last: Option<HistoryEntry>,
}

impl Watcher {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
            last: None,
        }
    }

    /// Polls once. Returns the newest entry if it changed since the last
    /// poll.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the history directory cannot be read.
    pub async fn poll(&mut self) -> Result<Option<HistoryEntry>> {
        let entry = latest_entry(&self.dir).await?;
        match entry {
            Some(entry) if self.last.as_ref() != Some(&entry) => {
                trace!("new history entry: {entry:?}");
                self.last = Some(entry.clone());
                Ok(Some(entry))
            }
            _ => Ok(None),
        }
    }

    /// Waits for the next new entry. Unreadable directories are logged and
    /// polled again.
    pub async fn next(&mut self) -> HistoryEntry {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.poll().await {
                Ok(Some(entry)) => return entry,
                Ok(None) => {}
                Err(e) => warn!("could not read history in {}: {e}", self.dir.display()),
            }
        }
    }
}
