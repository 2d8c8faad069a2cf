//! Process-wide session state.
//!
//! [`SharedState`] is the single owner of the fields of a live set. Every
//! mutation goes through a named setter; readers get either a single field
//! or a [`SessionState`] snapshot. The dedup sets of a set are not kept
//! here: they belong to the per-set value the connection manager allocates
//! at go-live.

use std::{
    fmt,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};

use crate::protocol::{
    messages::{PollStarted, TempoFeedback},
    SessionId,
};

/// Where the connection to the relay stands.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Offline,
    Connecting,
    Live,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Connecting => write!(f, "connecting"),
            Self::Live => write!(f, "live"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// The poll currently shown to listeners.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollSnapshot {
    pub poll_id: u64,
    pub question: String,
    pub options: Vec<String>,
    pub votes: Vec<u32>,
    pub total_votes: u32,
    pub ends_at: Option<String>,
}

impl From<PollStarted> for PollSnapshot {
    fn from(poll: PollStarted) -> Self {
        Self {
            poll_id: poll.poll_id,
            votes: vec![0; poll.options.len()],
            question: poll.question,
            options: poll.options,
            total_votes: 0,
            ends_at: poll.ends_at,
        }
    }
}

/// A copy of the session state at one point in time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    /// Set identifier as registered with the relay.
    pub session_id: Option<SessionId>,

    /// Set identifier echoed by the relay on registration.
    pub cloud_session_id: Option<SessionId>,

    /// Row id of the set in local play history.
    pub local_session_id: Option<u64>,

    /// Row id of the play currently on the deck.
    pub current_play_id: Option<u64>,

    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub listener_count: u32,
    pub poll: Option<PollSnapshot>,
    pub announcement: Option<String>,
    pub tempo: Option<TempoFeedback>,

    /// Likes for the track currently on air.
    pub live_likes: u32,

    /// Whether sends that cannot go out now should be queued.
    pub live_mode: bool,
}

impl SessionState {
    /// Live mode as seen by senders: the flag is on, a set is registered
    /// and the connection is up or coming back.
    #[must_use]
    pub fn is_live_mode(&self) -> bool {
        self.live_mode
            && self.session_id.is_some()
            && matches!(
                self.status,
                ConnectionStatus::Live | ConnectionStatus::Connecting
            )
    }
}

/// Owner of the [`SessionState`] of this process.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: RwLock<SessionState>,
}

impl SharedState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.read().clone()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.read().status
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.read().session_id.clone()
    }

    #[must_use]
    pub fn is_live_mode(&self) -> bool {
        self.read().is_live_mode()
    }

    /// Starts a new set: everything is cleared, the set is `connecting` and
    /// live mode is on.
    pub fn begin(&self, session_id: SessionId) {
        *self.write() = SessionState {
            session_id: Some(session_id),
            status: ConnectionStatus::Connecting,
            live_mode: true,
            ..SessionState::default()
        };
    }

    /// Ends the set: back to `offline` with every field cleared.
    pub fn reset(&self) {
        *self.write() = SessionState::default();
    }

    /// Sets the status and returns the previous one.
    pub fn set_status(&self, status: ConnectionStatus) -> ConnectionStatus {
        let mut state = self.write();
        let previous = state.status;
        state.status = status;
        if status != ConnectionStatus::Error {
            state.last_error = None;
        }
        previous
    }

    /// Moves to `error`, keeping the message for the UI.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut state = self.write();
        state.status = ConnectionStatus::Error;
        state.last_error = Some(message.into());
    }

    pub fn set_live_mode(&self, live_mode: bool) {
        self.write().live_mode = live_mode;
    }

    pub fn set_cloud_session_id(&self, session_id: SessionId) {
        self.write().cloud_session_id = Some(session_id);
    }

    pub fn set_local_session_id(&self, id: Option<u64>) {
        self.write().local_session_id = id;
    }

    pub fn set_current_play_id(&self, id: Option<u64>) {
        self.write().current_play_id = id;
    }

    pub fn set_listener_count(&self, count: u32) {
        self.write().listener_count = count;
    }

    pub fn set_tempo(&self, tempo: TempoFeedback) {
        self.write().tempo = Some(tempo);
    }

    pub fn set_announcement(&self, announcement: Option<String>) {
        self.write().announcement = announcement;
    }

    pub fn set_poll(&self, poll: Option<PollSnapshot>) {
        self.write().poll = poll;
    }

    /// Applies a tally to the current poll and returns the updated
    /// snapshot. Tallies for any other poll are ignored.
    pub fn update_poll_votes(
        &self,
        poll_id: u64,
        votes: Vec<u32>,
        total_votes: u32,
    ) -> Option<PollSnapshot> {
        let mut state = self.write();
        let poll = state.poll.as_mut().filter(|poll| poll.poll_id == poll_id)?;
        poll.votes = votes;
        poll.total_votes = total_votes;
        Some(poll.clone())
    }

    /// Clears the current poll if it is `poll_id`.
    pub fn end_poll(&self, poll_id: u64) {
        let mut state = self.write();
        if state.poll.as_ref().is_some_and(|poll| poll.poll_id == poll_id) {
            state.poll = None;
        }
    }

    pub fn reset_live_likes(&self) {
        self.write().live_likes = 0;
    }

    /// Counts one like for the track on air and returns the new total.
    pub fn add_live_like(&self) -> u32 {
        let mut state = self.write();
        state.live_likes = state.live_likes.saturating_add(1);
        state.live_likes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        "set_test".parse().unwrap()
    }

    #[test]
    fn live_mode_requires_flag_session_and_status() {
        let state = SharedState::new();
        assert!(!state.is_live_mode());

        state.begin(session());
        assert!(state.is_live_mode());

        state.set_status(ConnectionStatus::Live);
        assert!(state.is_live_mode());

        state.set_error("relay unreachable");
        assert!(!state.is_live_mode());

        state.set_status(ConnectionStatus::Connecting);
        state.set_live_mode(false);
        assert!(!state.is_live_mode());
    }

    #[test]
    fn begin_clears_previous_set() {
        let state = SharedState::new();
        state.begin(session());
        state.set_listener_count(12);
        state.add_live_like();
        state.set_announcement(Some("Last track".to_owned()));

        state.begin("set_next".parse().unwrap());
        let snapshot = state.snapshot();
        assert_eq!(snapshot.listener_count, 0);
        assert_eq!(snapshot.live_likes, 0);
        assert_eq!(snapshot.announcement, None);
        assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    }

    #[test]
    fn reset_returns_to_offline() {
        let state = SharedState::new();
        state.begin(session());
        state.set_error("boom");
        state.reset();

        assert_eq!(state.snapshot(), SessionState::default());
    }

    #[test]
    fn error_message_is_cleared_on_recovery() {
        let state = SharedState::new();
        state.set_error("boom");
        assert_eq!(state.snapshot().last_error.as_deref(), Some("boom"));

        assert_eq!(
            state.set_status(ConnectionStatus::Connecting),
            ConnectionStatus::Error
        );
        assert_eq!(state.snapshot().last_error, None);
    }

    #[test]
    fn poll_tallies_apply_to_current_poll_only() {
        let state = SharedState::new();
        state.set_poll(Some(PollSnapshot {
            poll_id: 3,
            options: vec!["A".to_owned(), "B".to_owned()],
            votes: vec![0, 0],
            ..PollSnapshot::default()
        }));

        assert!(state.update_poll_votes(4, vec![1, 0], 1).is_none());
        let poll = state.update_poll_votes(3, vec![2, 1], 3).unwrap();
        assert_eq!(poll.votes, [2, 1]);

        state.end_poll(4);
        assert!(state.snapshot().poll.is_some());
        state.end_poll(3);
        assert!(state.snapshot().poll.is_none());
    }

    #[test]
    fn status_displays_lowercase() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Live).unwrap(),
            "\"live\""
        );
    }
}
