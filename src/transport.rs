//! The transport handle shared by every component that sends.
//!
//! One [`RelayTransport`] lives as long as the connection manager. Each
//! websocket connection attaches its writer channel to it on open and
//! detaches on close, so the sender, the reliability tracker and the queue
//! flusher keep a single handle across reconnects and always observe the
//! current state.
//!
//! Sending is synchronous and non-blocking: frames go into an unbounded
//! channel drained by the connection's writer task.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WebsocketMessage;

use crate::error::{Error, Result};

/// Connection state as seen by senders.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportState {
    Connecting,
    Open,
    #[default]
    Closed,
}

/// A message-oriented, bidirectional connection to the relay.
pub trait Transport: Send + Sync {
    fn state(&self) -> TransportState;

    /// Queues one text frame for transmission.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the transport is not open or the connection
    /// is going away.
    fn send(&self, text: &str) -> Result<()>;

    /// Closes the connection. Further sends fail until it reopens.
    fn close(&self);

    fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }
}

/// The relay websocket, seen through its writer channel.
#[derive(Debug, Default)]
pub struct RelayTransport {
    link: Mutex<Link>,
}

#[derive(Debug, Default)]
struct Link {
    state: TransportState,
    tx: Option<mpsc::UnboundedSender<WebsocketMessage>>,
}

impl RelayTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a connection attempt in progress.
    pub fn connecting(&self) {
        let mut link = self.link();
        link.tx = None;
        link.state = TransportState::Connecting;
    }

    /// Attaches the writer channel of a freshly opened connection.
    pub fn attach(&self, tx: mpsc::UnboundedSender<WebsocketMessage>) {
        let mut link = self.link();
        link.tx = Some(tx);
        link.state = TransportState::Open;
    }

    /// Forgets the current connection. Dropping the writer channel stops
    /// the writer task once it has drained.
    pub fn detach(&self) {
        let mut link = self.link();
        link.tx = None;
        link.state = TransportState::Closed;
    }

    /// Queues a raw websocket frame, e.g. a pong.
    pub(crate) fn send_frame(&self, frame: WebsocketMessage) -> Result<()> {
        let link = self.link();
        match &link.tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| Error::unavailable("relay writer has stopped")),
            None => Err(Error::unavailable("relay connection is not open")),
        }
    }
}

impl Transport for RelayTransport {
    fn state(&self) -> TransportState {
        self.link().state
    }

    fn send(&self, text: &str) -> Result<()> {
        if self.state() != TransportState::Open {
            return Err(Error::unavailable("relay connection is not open"));
        }
        trace!("-> {text}");
        self.send_frame(WebsocketMessage::Text(text.to_owned().into()))
    }

    /// Asks the relay to close the connection, then detaches.
    fn close(&self) {
        let mut link = self.link();
        if let Some(tx) = link.tx.take() {
            // The writer may already be gone.
            let _ = tx.send(WebsocketMessage::Close(None));
        }
        link.state = TransportState::Closed;
    }
}
