//! Wire types for the Pika! relay protocol.
//!
//! * [`ids`] - message and session identifiers
//! * [`messages`] - outbound envelope, inbound tags and payloads

pub mod ids;
pub mod messages;

pub use ids::{MessageId, SessionId};
pub use messages::{Envelope, Outbound};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;

use crate::error::Result;

/// Decodes a payload of a known message type and logs the outcome.
///
/// Traces the decoded structure on success. On failure the raw frame is
/// traced and the error returned, so callers can decide whether a
/// malformed payload is worth more than a debug line.
pub fn decode<T>(frame: &Value, origin: &str) -> Result<T>
where
    T: DeserializeOwned + Debug,
{
    match T::deserialize(frame) {
        Ok(result) => {
            trace!("{origin}: {result:?}");
            Ok(result)
        }
        Err(e) => {
            debug!("{origin}: ignoring malformed payload ({e})");
            trace!("{origin}: {frame}");
            Err(e.into())
        }
    }
}
