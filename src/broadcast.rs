//! Suppression of redundant "now playing" broadcasts.

use std::collections::HashSet;

use crate::{reliability::Delivery, track::TrackKey};

/// Result of a broadcast request.
#[derive(Debug)]
pub struct Broadcast {
    /// Whether a `BROADCAST_TRACK` was sent.
    pub broadcasted: bool,
    pub track_key: TrackKey,

    /// Delivery of the broadcast; resolves `false` when nothing was sent.
    pub delivery: Delivery,
}

/// Remembers the last broadcast track of a set and every track played in
/// it.
#[derive(Clone, Debug, Default)]
pub struct BroadcastGuard {
    last_key: Option<TrackKey>,
    played: HashSet<TrackKey>,
}

impl BroadcastGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `key` should be broadcast, and records it if so.
    ///
    /// Only a repeat of the last broadcast key is refused: a track that
    /// comes back after another one is broadcast again.
    pub fn admit(&mut self, key: &TrackKey) -> bool {
        if self.last_key.as_ref() == Some(key) {
            debug!("{key}: already broadcast");
            return false;
        }

        self.last_key = Some(key.clone());
        self.played.insert(key.clone());
        true
    }

    /// Forgets the last broadcast key so the next [`admit`](Self::admit)
    /// passes.
    pub fn force(&mut self) {
        self.last_key = None;
    }

    /// Records `key` as broadcast and played without broadcasting it.
    pub fn seed(&mut self, key: TrackKey) {
        self.played.insert(key.clone());
        self.last_key = Some(key);
    }

    #[must_use]
    pub fn last_key(&self) -> Option<&TrackKey> {
        self.last_key.as_ref()
    }

    #[must_use]
    pub fn has_played(&self, key: &TrackKey) -> bool {
        self.played.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;

    #[test]
    fn repeated_key_is_admitted_once() {
        let mut guard = BroadcastGuard::new();
        let key = Track::new("Moderat", "A New Error").key();

        assert!(guard.admit(&key));
        for _ in 0..5 {
            assert!(!guard.admit(&key));
        }
        assert_eq!(guard.last_key(), Some(&key));
    }

    #[test]
    fn different_track_resets_the_guard() {
        let mut guard = BroadcastGuard::new();
        let first = Track::new("A", "One").key();
        let second = Track::new("B", "Two").key();

        assert!(guard.admit(&first));
        assert!(guard.admit(&second));
        assert!(guard.admit(&first));
        assert!(guard.has_played(&first) && guard.has_played(&second));
    }

    #[test]
    fn force_bypasses_the_guard_once() {
        let mut guard = BroadcastGuard::new();
        let key = Track::new("A", "One").key();

        assert!(guard.admit(&key));
        guard.force();
        assert!(guard.admit(&key));
        assert!(!guard.admit(&key));
    }

    #[test]
    fn seeded_track_is_played_but_not_admitted() {
        let mut guard = BroadcastGuard::new();
        let key = Track::new("A", "One").key();

        guard.seed(key.clone());
        assert!(guard.has_played(&key));
        assert!(!guard.admit(&key));
    }
}
