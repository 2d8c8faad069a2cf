//! Dispatch of inbound relay messages.
//!
//! Each known message type maps to one entry in a lookup table. The entry
//! decodes the typed payload and hands it to the [`SessionHandlers`] of the
//! live set. Handlers are only reachable while a set has installed its
//! [`RouteContext`]; ending the set clears it.
//!
//! Outcomes of [`Router::dispatch`]:
//!
//! | Frame                                  | Result  |
//! |----------------------------------------|---------|
//! | not JSON, or no string `type`          | `false` |
//! | no live set                            | `false` |
//! | unknown `type`                         | `true`  |
//! | known `type`, malformed payload        | `true`  |
//! | handler returned an error or panicked  | `false` |
//! | handled                                | `true`  |

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock},
};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::Result,
    protocol::{
        self,
        messages::{
            self, kind, Ack, LikeReceived, ListenerCount, Nack, PollEnded, PollStarted,
            PollUpdate, ReactionReceived, SessionExpired, SessionRegistered, SessionValid,
            TempoFeedback,
        },
        SessionId,
    },
};

/// Callbacks of a live set, one per inbound message type.
///
/// Every method defaults to ignoring the message.
#[expect(unused_variables)]
pub trait SessionHandlers: Send + Sync {
    fn ack(&self, message: Ack) -> Result<()> {
        Ok(())
    }

    fn nack(&self, message: Nack) -> Result<()> {
        Ok(())
    }

    fn session_registered(&self, message: SessionRegistered) -> Result<()> {
        Ok(())
    }

    fn session_valid(&self, message: SessionValid) -> Result<()> {
        Ok(())
    }

    fn session_expired(&self, message: SessionExpired) -> Result<()> {
        Ok(())
    }

    fn like_received(&self, message: LikeReceived) -> Result<()> {
        Ok(())
    }

    fn listener_count(&self, message: ListenerCount) -> Result<()> {
        Ok(())
    }

    fn tempo_feedback(&self, message: TempoFeedback) -> Result<()> {
        Ok(())
    }

    fn poll_started(&self, message: PollStarted) -> Result<()> {
        Ok(())
    }

    fn poll_update(&self, message: PollUpdate) -> Result<()> {
        Ok(())
    }

    fn poll_ended(&self, message: PollEnded) -> Result<()> {
        Ok(())
    }

    fn reaction_received(&self, message: ReactionReceived) -> Result<()> {
        Ok(())
    }
}

/// The live set messages are routed to.
pub struct RouteContext {
    pub session_id: SessionId,
    pub handlers: Box<dyn SessionHandlers>,
}

type Handler = fn(&RouteContext, &Value) -> Result<()>;

pub struct Router {
    routes: HashMap<&'static str, Handler>,
    context: RwLock<Option<Arc<RouteContext>>>,
}

/// Decodes the payload of `frame` and passes it on. A payload that does not
/// decode is dropped.
fn route<T, F>(frame: &Value, origin: &str, handler: F) -> Result<()>
where
    T: DeserializeOwned + Debug,
    F: FnOnce(T) -> Result<()>,
{
    match protocol::decode::<T>(frame, origin) {
        Ok(message) => handler(message),
        Err(_) => Ok(()),
    }
}

macro_rules! routes {
    ($($kind:expr => $method:ident),+ $(,)?) => {
        HashMap::from([
            $((
                $kind,
                (|context: &RouteContext, frame: &Value| {
                    route(frame, $kind, |message| context.handlers.$method(message))
                }) as Handler,
            )),+
        ])
    };
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        let routes = routes! {
            kind::ACK => ack,
            kind::NACK => nack,
            kind::SESSION_REGISTERED => session_registered,
            kind::SESSION_VALID => session_valid,
            kind::SESSION_EXPIRED => session_expired,
            kind::LIKE_RECEIVED => like_received,
            kind::LISTENER_COUNT => listener_count,
            kind::TEMPO_FEEDBACK => tempo_feedback,
            kind::POLL_STARTED => poll_started,
            kind::POLL_UPDATE => poll_update,
            kind::POLL_ENDED => poll_ended,
            kind::REACTION_RECEIVED => reaction_received,
        };

        Self {
            routes,
            context: RwLock::new(None),
        }
    }

    /// Routes messages to `context` from now on, replacing any previous set.
    pub fn set_context(&self, context: RouteContext) {
        debug!("routing messages for {}", context.session_id);
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(context));
    }

    pub fn clear_context(&self) {
        if let Some(context) = self
            .context
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            debug!("stopped routing messages for {}", context.session_id);
        }
    }

    fn context(&self) -> Option<Arc<RouteContext>> {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Dispatches one text frame.
    pub fn dispatch(&self, text: &str) -> bool {
        match serde_json::from_str::<Value>(text) {
            Ok(frame) => self.dispatch_value(&frame),
            Err(e) => {
                debug!("ignoring frame that is not JSON: {e}");
                trace!("{text}");
                false
            }
        }
    }

    /// Dispatches one decoded frame.
    pub fn dispatch_value(&self, frame: &Value) -> bool {
        let Some(kind) = messages::message_type(frame) else {
            debug!("ignoring frame without type");
            trace!("{frame}");
            return false;
        };

        // Handlers may end the set, which clears the context. Run them on
        // a clone so the lock is not held.
        let Some(context) = self.context() else {
            debug!("{kind}: no live set");
            return false;
        };

        let Some(handler) = self.routes.get(kind) else {
            debug!("{kind}: unknown message type");
            return true;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(&context, frame))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("{kind}: handler failed: {e}");
                false
            }
            Err(_) => {
                warn!("{kind}: handler panicked");
                false
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .field(
                "session_id",
                &self.context().map(|context| context.session_id.clone()),
            )
            .finish()
    }
}
