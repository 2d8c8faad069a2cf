//! Events for the performer's UI.
//!
//! The synchronization layer never talks to a UI directly. It emits
//! [`Event`]s over an unbounded channel, and the UI decides how to render
//! them. Only a message given up after its last retry, a failed queue
//! flush, or a queued track or poll produce a toast.
//!
//! # Example
//!
//! ```rust
//! use pika_sync::events::{Event, Notifier};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let notifier = Notifier::new(tx);
//! notifier.warning("Track update could not be delivered");
//! assert!(matches!(rx.try_recv(), Ok(Event::Toast { .. })));
//! ```

use std::fmt;

use tokio::sync::mpsc;

use crate::{
    protocol::messages::TempoFeedback,
    state::{ConnectionStatus, PollSnapshot},
};

/// Severity of a toast.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// Things the UI may want to show or react to.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The connection status changed.
    StatusChanged(ConnectionStatus),

    /// A short, non-blocking notification.
    Toast { level: Level, message: String },

    /// The relay reported a new number of listeners.
    ListenerCount(u32),

    /// A batch of likes was flushed, e.g. "3 people liked Strobe".
    Likes {
        count: u32,
        title: String,
        message: String,
    },

    TempoFeedback(TempoFeedback),

    /// A poll started or its tally changed.
    Poll(PollSnapshot),

    /// A poll closed. `winner` is the winning option, if any.
    PollEnded {
        poll_id: u64,
        winner: Option<String>,
    },

    /// A listener sent an emoji reaction.
    Reaction(String),

    /// The relay no longer knows this set; it was ended locally.
    SessionExpired { reason: Option<String> },
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Emits [`Event`]s to an optional UI channel.
///
/// Emission never fails: without a receiver, events are dropped after a
/// trace line.
#[derive(Clone, Debug, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl Notifier {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A notifier that drops every event.
    #[must_use]
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: Event) {
        match &self.tx {
            Some(tx) => {
                if let Err(e) = tx.send(event) {
                    trace!("no listener for event: {:?}", e.0);
                }
            }
            None => trace!("dropping event: {event:?}"),
        }
    }

    pub fn toast(&self, level: Level, message: impl Into<String>) {
        self.emit(Event::Toast {
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.toast(Level::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.toast(Level::Warning, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_notifier_drops_events() {
        Notifier::silent().warning("nobody listens");
    }

    #[test]
    fn emits_toasts_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(tx);
        notifier.info("first");
        notifier.warning("second");

        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Toast {
                level: Level::Info,
                message: "first".to_owned()
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::Toast {
                level: Level::Warning,
                ..
            }
        ));
    }

    #[test]
    fn closed_receiver_is_not_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        Notifier::new(tx).emit(Event::ListenerCount(3));
    }
}
