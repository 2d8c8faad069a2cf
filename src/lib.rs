//! Reliable live-session synchronization between a DJ desktop and the
//! Pika! relay.
//!
//! A performer goes live, and every track they play is broadcast to the
//! relay, which fans it out to listeners. Listeners send back likes, tempo
//! votes, poll votes and reactions. The crate keeps that exchange reliable
//! over a flaky venue network:
//!
//! * [`reliability`] tracks every important message until the relay
//!   acknowledges it, retrying with bounded backoff.
//! * [`sender`] is the single entry point for outbound messages and diverts
//!   them to the durable [`queue`] while the connection is down. The queue
//!   and the play history live in a local SQLite [`db`].
//! * [`flusher`] replays the queue after a reconnect with adaptive pacing
//!   and a circuit breaker.
//! * [`router`] dispatches inbound messages to the live set.
//! * [`session`] is the connection state machine tying it all together,
//!   with the dedup guards of [`broadcast`] and [`plays`] and the like
//!   batching of [`likes`].
//! * [`remote`] is the websocket client and [`watcher`] reads VirtualDJ
//!   history.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod flusher;
pub mod likes;
pub mod plays;
pub mod protocol;
pub mod queue;
pub mod reliability;
pub mod remote;
pub mod router;
pub mod secrets;
pub mod sender;
pub mod session;
pub mod signal;
pub mod state;
pub mod track;
pub mod transport;
pub mod util;
pub mod watcher;
