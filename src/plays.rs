//! Play history and its duplicate guard.
//!
//! Deck watchers report the same physical play more than once: a watcher
//! fires several times within seconds, and a long track is still "now
//! playing" minutes later. [`PlayDeduplicator`] applies two layers and a
//! play is only recorded when both pass:
//!
//! 1. A rolling window key `artist-title-bucket`, with the bucket being
//!    `floor(now / window)`. Catches bursts within one window.
//! 2. A minimum replay interval per lower-cased `artist-title`. Catches a
//!    track whose play spans window boundaries.
//!
//! The window layer is case-sensitive while the interval layer is not.
//!
//! Recorded plays go to a [`PlayStore`], kept in the local database by
//! [`SqlitePlays`].

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::{
    config::DedupConfig,
    db::{from_sql, to_sql},
    error::Result,
    track::Track,
    util,
};

/// Why a play was or was not recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accepted,

    /// The same track was recorded in the current window.
    SameWindow,

    /// The track was recorded less than the minimum replay interval ago.
    TooSoon { elapsed: Duration },
}

impl Verdict {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlayDeduplicator {
    config: DedupConfig,
    processed: HashSet<String>,
    last_recorded: HashMap<String, u64>,
}

impl PlayDeduplicator {
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    fn window_key(&self, track: &Track, now: u64) -> String {
        let bucket = now / util::as_millis(self.config.window).max(1);
        format!("{}-{}-{bucket}", track.artist(), track.title())
    }

    fn absolute_key(track: &Track) -> String {
        format!("{}-{}", track.artist(), track.title()).to_lowercase()
    }

    /// Checks a play at `now` (milliseconds since the epoch) without
    /// recording it.
    #[must_use]
    pub fn check(&self, track: &Track, now: u64) -> Verdict {
        if self.processed.contains(&self.window_key(track, now)) {
            return Verdict::SameWindow;
        }

        if let Some(last) = self.last_recorded.get(&Self::absolute_key(track)) {
            let elapsed = now.saturating_sub(*last);
            if elapsed < util::as_millis(self.config.min_replay_interval) {
                return Verdict::TooSoon {
                    elapsed: Duration::from_millis(elapsed),
                };
            }
        }

        Verdict::Accepted
    }

    /// Checks a play at `now` and records it if both layers pass.
    pub fn record(&mut self, track: &Track, now: u64) -> Verdict {
        let verdict = self.check(track, now);
        match verdict {
            Verdict::Accepted => self.mark_seen(track, now),
            Verdict::SameWindow => debug!("{track}: already recorded in this window"),
            Verdict::TooSoon { elapsed } => debug!(
                "{track}: recorded {:.0}s ago, not recording again",
                elapsed.as_secs_f32()
            ),
        }
        verdict
    }

    /// Marks `track` as recorded at `now` in both layers.
    pub fn mark_seen(&mut self, track: &Track, now: u64) {
        self.processed.insert(self.window_key(track, now));
        self.last_recorded.insert(Self::absolute_key(track), now);
    }
}

/// Local play history.
#[async_trait]
pub trait PlayStore: Send + Sync {
    /// Creates a set and returns its id.
    async fn create_session(&self, name: &str, started_at: u64) -> Result<u64>;

    /// Records a play in set `session_id` and returns its id.
    async fn create_play(&self, session_id: u64, track: &Track, played_at: u64) -> Result<u64>;
}

/// Play history in the `sessions` and `plays` tables.
#[derive(Clone, Debug)]
pub struct SqlitePlays {
    pool: SqlitePool,
}

impl SqlitePlays {
    /// Creates the history tables in `pool` unless they exist.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the tables cannot be created.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                started_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plays (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions (id),
                artist TEXT,
                title TEXT,
                bpm REAL,
                musical_key TEXT,
                energy REAL,
                file_path TEXT,
                played_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl PlayStore for SqlitePlays {
    async fn create_session(&self, name: &str, started_at: u64) -> Result<u64> {
        let result = sqlx::query("INSERT INTO sessions (name, started_at) VALUES (?, ?)")
            .bind(name)
            .bind(to_sql(started_at)?)
            .execute(&self.pool)
            .await?;

        from_sql(result.last_insert_rowid())
    }

    async fn create_play(&self, session_id: u64, track: &Track, played_at: u64) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO plays
                (session_id, artist, title, bpm, musical_key, energy, file_path, played_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(to_sql(session_id)?)
        .bind(track.artist.as_deref())
        .bind(track.title.as_deref())
        .bind(track.bpm)
        .bind(track.key.as_deref())
        .bind(track.energy)
        .bind(track.file_path.as_deref())
        .bind(to_sql(played_at)?)
        .execute(&self.pool)
        .await?;

        from_sql(result.last_insert_rowid())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use super::*;

    #[derive(Debug, Default)]
    struct History {
        sessions: u64,
        plays: Vec<Track>,
    }

    /// Play history that lives as long as the test.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryPlays {
        history: Mutex<History>,
    }

    impl MemoryPlays {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Tracks recorded so far, in order.
        pub(crate) fn plays(&self) -> Vec<Track> {
            self.history().plays.clone()
        }

        fn history(&self) -> MutexGuard<'_, History> {
            self.history.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl PlayStore for MemoryPlays {
        async fn create_session(&self, _name: &str, _started_at: u64) -> Result<u64> {
            let mut history = self.history();
            history.sessions += 1;
            Ok(history.sessions)
        }

        async fn create_play(&self, _session_id: u64, track: &Track, _played_at: u64) -> Result<u64> {
            let mut history = self.history();
            history.plays.push(track.clone());
            Ok(u64::try_from(history.plays.len()).unwrap())
        }
    }
}
