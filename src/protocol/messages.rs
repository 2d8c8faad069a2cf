//! Relay wire messages.
//!
//! Every frame is a newline-free JSON object with a `type` string field:
//!
//! ```json
//! { "type": "BROADCAST_TRACK", "sessionId": "set_…", "track": { … }, "messageId": "…" }
//! ```
//!
//! Outbound messages are a closed set ([`Outbound`]) wrapped in an
//! [`Envelope`] that adds the `messageId` of reliable sends. Inbound
//! messages are an open set: the relay may add types at any time, so they
//! are decoded per type by the [router](crate::router) from the tags in
//! [`kind`], with one payload struct per known type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{MessageId, SessionId};
use crate::track::Track;

/// Messages produced by this client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Outbound {
    /// Announces a new set to the relay. Answered by `SESSION_REGISTERED`.
    RegisterSession {
        session_id: SessionId,
        dj_name: String,
        client_id: String,
    },

    /// Re-attaches to a set after a reconnect. Answered by `SESSION_VALID`
    /// or `SESSION_EXPIRED`.
    ValidateSession { session_id: SessionId },

    BroadcastTrack { session_id: SessionId, track: Track },

    /// Analysis results arrived for the track that is already playing.
    MetadataUpdated { session_id: SessionId, track: Track },

    TrackStopped { session_id: SessionId },

    StartPoll {
        session_id: SessionId,
        question: String,
        options: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<u32>,
    },

    EndPoll { session_id: SessionId, poll_id: u64 },

    CancelPoll { session_id: SessionId, poll_id: u64 },

    SendAnnouncement {
        session_id: SessionId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<u32>,
    },

    CancelAnnouncement { session_id: SessionId },

    EndSession { session_id: SessionId },
}

impl Outbound {
    /// Wire tag of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterSession { .. } => "REGISTER_SESSION",
            Self::ValidateSession { .. } => "VALIDATE_SESSION",
            Self::BroadcastTrack { .. } => "BROADCAST_TRACK",
            Self::MetadataUpdated { .. } => "METADATA_UPDATED",
            Self::TrackStopped { .. } => "TRACK_STOPPED",
            Self::StartPoll { .. } => "START_POLL",
            Self::EndPoll { .. } => "END_POLL",
            Self::CancelPoll { .. } => "CANCEL_POLL",
            Self::SendAnnouncement { .. } => "SEND_ANNOUNCEMENT",
            Self::CancelAnnouncement { .. } => "CANCEL_ANNOUNCEMENT",
            Self::EndSession { .. } => "END_SESSION",
        }
    }

    /// Whether queueing this message while offline is worth telling the
    /// performer about.
    #[must_use]
    pub fn is_high_value(&self) -> bool {
        matches!(self, Self::BroadcastTrack { .. } | Self::StartPoll { .. })
    }
}

/// An [`Outbound`] message as it goes on the wire.
///
/// Reliable sends carry a `messageId` that stays the same across retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Outbound,

    #[serde(
        default,
        rename = "messageId",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<MessageId>,
}

impl Envelope {
    #[must_use]
    pub fn fire_and_forget(message: Outbound) -> Self {
        Self {
            message,
            message_id: None,
        }
    }

    /// Wraps `message` with a freshly generated message id.
    #[must_use]
    pub fn reliable(message: Outbound) -> Self {
        Self {
            message,
            message_id: Some(MessageId::generate()),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Wire tags of inbound messages.
pub mod kind {
    pub const ACK: &str = "ACK";
    pub const NACK: &str = "NACK";
    pub const SESSION_REGISTERED: &str = "SESSION_REGISTERED";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const SESSION_VALID: &str = "SESSION_VALID";
    pub const LIKE_RECEIVED: &str = "LIKE_RECEIVED";
    pub const LISTENER_COUNT: &str = "LISTENER_COUNT";
    pub const TEMPO_FEEDBACK: &str = "TEMPO_FEEDBACK";
    pub const POLL_STARTED: &str = "POLL_STARTED";
    pub const POLL_UPDATE: &str = "POLL_UPDATE";
    pub const POLL_ENDED: &str = "POLL_ENDED";
    pub const REACTION_RECEIVED: &str = "REACTION_RECEIVED";
}

/// Human-readable name of an outbound message type, for notifications.
#[must_use]
pub fn describe(kind: &str) -> &'static str {
    match kind {
        "BROADCAST_TRACK" => "Track update",
        "METADATA_UPDATED" => "Track details",
        "TRACK_STOPPED" => "Track stop",
        "START_POLL" => "Poll",
        "END_POLL" | "CANCEL_POLL" => "Poll change",
        "SEND_ANNOUNCEMENT" | "CANCEL_ANNOUNCEMENT" => "Announcement",
        "END_SESSION" => "End of set",
        _ => "Message",
    }
}

/// Returns the `type` tag of a decoded frame, if it has a string one.
#[must_use]
pub fn message_type(frame: &Value) -> Option<&str> {
    frame.get("type").and_then(Value::as_str)
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub message_id: MessageId,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nack {
    pub message_id: MessageId,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRegistered {
    pub session_id: SessionId,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionValid {
    pub session_id: SessionId,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExpired {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LikeReceived {
    pub payload: LikePayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LikePayload {
    pub track: LikedTrack,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LikedTrack {
    #[serde(default)]
    pub artist: Option<String>,
    pub title: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct ListenerCount {
    pub count: u32,
}

/// Aggregated "faster / slower / perfect" votes from the dance floor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TempoFeedback {
    pub faster: u32,
    pub slower: u32,
    pub perfect: u32,
    #[serde(default)]
    pub total: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStarted {
    pub poll_id: u64,
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub ends_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollUpdate {
    pub poll_id: u64,
    pub votes: Vec<u32>,
    pub total_votes: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollEnded {
    pub poll_id: u64,
    #[serde(default)]
    pub results: Vec<u32>,
    #[serde(default)]
    pub total_votes: u32,
    #[serde(default)]
    pub winner: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ReactionReceived {
    pub reaction: String,
}
