//! Single entry point for outbound messages.

use std::{fmt, sync::Arc};

use crate::{
    events::Notifier,
    protocol::{messages, Envelope, Outbound},
    queue::QueueWriter,
    reliability::{Delivery, Tracker},
    state::SharedState,
    transport::Transport,
};

/// Sends [`Outbound`] messages, tracked or fire-and-forget.
///
/// While the connection is down and the set is live, messages go to the
/// durable queue and the returned [`Delivery`] resolves `false`. Outside a
/// live set they are dropped.
#[derive(Clone)]
pub struct Sender {
    transport: Arc<dyn Transport>,
    tracker: Tracker,
    queue: QueueWriter,
    state: Arc<SharedState>,
    notifier: Notifier,
}

impl Sender {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        tracker: Tracker,
        queue: QueueWriter,
        state: Arc<SharedState>,
        notifier: Notifier,
    ) -> Self {
        Self {
            transport,
            tracker,
            queue,
            state,
            notifier,
        }
    }

    /// Sends `message`. With `reliable`, a message id is attached once and
    /// the delivery resolves when the relay acknowledges it or the
    /// tracker gives up.
    pub fn send(&self, message: Outbound, reliable: bool) -> Delivery {
        let kind = message.kind();
        let high_value = message.is_high_value();
        let envelope = if reliable {
            Envelope::reliable(message)
        } else {
            Envelope::fire_and_forget(message)
        };

        let payload = match envelope.to_text() {
            Ok(payload) => payload,
            Err(e) => {
                error!("{kind}: cannot serialize message: {e}");
                return Delivery::resolved(false);
            }
        };

        if self.transport.is_open() {
            return match envelope.message_id {
                Some(id) => {
                    let delivery = self.tracker.track(id.clone(), kind, payload.clone());
                    if let Err(e) = self.transport.send(&payload) {
                        debug!("{kind} {id}: not sent, awaiting retry: {e}");
                    }
                    delivery
                }
                None => match self.transport.send(&payload) {
                    Ok(()) => Delivery::resolved(true),
                    Err(e) => {
                        debug!("{kind}: not sent: {e}");
                        Delivery::resolved(false)
                    }
                },
            };
        }

        if self.state.is_live_mode() {
            debug!("{kind}: connection down, queueing");
            self.queue.enqueue(kind, payload);
            if high_value {
                self.notifier.info(format!(
                    "{} queued, will be sent when back online",
                    messages::describe(kind)
                ));
            }
        } else {
            debug!("{kind}: not live, dropping");
        }

        Delivery::resolved(false)
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("transport", &self.transport.state())
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}
