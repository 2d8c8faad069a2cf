//! Acknowledgment tracking for reliable messages.
//!
//! Every reliable message is registered with the [`Tracker`] before it is
//! transmitted. The relay answers with `ACK` or `NACK` carrying the
//! message id. Without an answer within the ack timeout, the message is
//! considered lost.
//!
//! A `NACK` or timeout schedules a retry after a growing delay, up to
//! `max_retries` re-sends. A retry that finds the connection down moves the
//! message to the durable queue instead. When retries run out, the
//! performer gets a warning and the [`Delivery`] resolves `false`.
//!
//! Each entry is removed from the pending map before its completion fires,
//! so only one of ack, give-up or teardown ever resolves it and late
//! signals are no-ops.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    config::ReliabilityConfig,
    events::Notifier,
    protocol::{messages, MessageId},
    queue::QueueWriter,
    transport::Transport,
};

/// Outcome of a send: `true` once confirmed delivered, `false` when the
/// message was given up, queued for later, or dropped.
#[must_use = "a delivery does nothing unless awaited"]
#[derive(Debug)]
pub struct Delivery {
    state: DeliveryState,
}

#[derive(Debug)]
enum DeliveryState {
    Ready(bool),
    Waiting(oneshot::Receiver<bool>),
}

impl Delivery {
    /// A delivery whose outcome is already known.
    pub fn resolved(delivered: bool) -> Self {
        Self {
            state: DeliveryState::Ready(delivered),
        }
    }

    fn waiting(rx: oneshot::Receiver<bool>) -> Self {
        Self {
            state: DeliveryState::Waiting(rx),
        }
    }
}

impl Future for Delivery {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            DeliveryState::Ready(delivered) => Poll::Ready(*delivered),
            // A dropped sender means the tracker went away with the entry.
            DeliveryState::Waiting(rx) => Pin::new(rx).poll(cx).map(|result| result.unwrap_or(false)),
        }
    }
}

#[derive(Clone)]
pub struct Tracker {
    shared: Arc<Shared>,
}

struct Shared {
    config: ReliabilityConfig,
    transport: Arc<dyn Transport>,
    queue: QueueWriter,
    notifier: Notifier,
    pending: Mutex<HashMap<MessageId, Pending>>,
}

/// A reliable message awaiting acknowledgment.
struct Pending {
    kind: &'static str,
    payload: String,
    retry_count: u32,
    retry_scheduled: bool,
    timer: Option<JoinHandle<()>>,
    done: oneshot::Sender<bool>,
}

impl Pending {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn resolve(mut self, delivered: bool) {
        self.cancel_timer();
        // The caller may have stopped waiting.
        let _ = self.done.send(delivered);
    }
}

#[derive(Copy, Clone, Debug)]
enum Action {
    Timeout,
    Retry,
}

impl Tracker {
    #[must_use]
    pub fn new(
        config: ReliabilityConfig,
        transport: Arc<dyn Transport>,
        queue: QueueWriter,
        notifier: Notifier,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                queue,
                notifier,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<MessageId, Pending>> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a reliable message and arms its ack timeout.
    ///
    /// Call before transmitting `payload`, so an immediate answer finds the
    /// entry. A second registration of an id that is still pending is
    /// refused and resolves `false`; the first one is unaffected.
    pub fn track(&self, id: MessageId, kind: &'static str, payload: String) -> Delivery {
        let mut pending = self.pending();
        if pending.contains_key(&id) {
            warn!("{kind} {id}: already awaiting acknowledgment");
            return Delivery::resolved(false);
        }

        let (tx, rx) = oneshot::channel();
        let timer = self.schedule(&id, self.shared.config.ack_timeout, Action::Timeout);
        trace!("{kind} {id}: awaiting acknowledgment");
        pending.insert(
            id,
            Pending {
                kind,
                payload,
                retry_count: 0,
                retry_scheduled: false,
                timer: Some(timer),
                done: tx,
            },
        );

        Delivery::waiting(rx)
    }

    /// Confirms delivery. Returns `false` if `id` was not pending.
    pub fn ack(&self, id: &MessageId) -> bool {
        let Some(entry) = self.pending().remove(id) else {
            debug!("ACK for unknown message {id}");
            return false;
        };

        debug!(
            "{} {id}: acknowledged after {} retries",
            entry.kind, entry.retry_count
        );
        entry.resolve(true);
        true
    }

    /// Handles a rejection. Returns `false` if `id` was not pending.
    pub fn nack(&self, id: &MessageId, error: Option<&str>) -> bool {
        self.fail(id, error.unwrap_or("rejected by relay"))
    }

    /// Handles a missing answer. Returns `false` if `id` was not pending.
    pub fn timeout(&self, id: &MessageId) -> bool {
        self.fail(id, "no response")
    }

    fn fail(&self, id: &MessageId, reason: &str) -> bool {
        let mut pending = self.pending();
        let Some(entry) = pending.get_mut(id) else {
            debug!("{reason} for unknown message {id}");
            return false;
        };

        if entry.retry_scheduled {
            debug!("{} {id}: {reason}, retry already scheduled", entry.kind);
            return true;
        }

        let max_retries = self.shared.config.max_retries;
        if entry.retry_count < max_retries {
            let delay = self.shared.config.retry_delay(entry.retry_count);
            debug!(
                "{} {id}: {reason}, retry {}/{max_retries} in {}ms",
                entry.kind,
                entry.retry_count + 1,
                delay.as_millis()
            );

            entry.cancel_timer();
            entry.retry_scheduled = true;
            entry.timer = Some(self.schedule(id, delay, Action::Retry));
            return true;
        }

        if let Some(entry) = pending.remove(id) {
            warn!(
                "{} {id}: giving up after {} retries: {reason}",
                entry.kind, entry.retry_count
            );
            self.shared.notifier.warning(format!(
                "{} could not be delivered",
                messages::describe(entry.kind)
            ));
            entry.resolve(false);
        }
        true
    }

    fn retry(&self, id: &MessageId) {
        let mut pending = self.pending();
        let Some(entry) = pending.get_mut(id) else {
            return;
        };
        entry.retry_scheduled = false;

        if self.shared.transport.is_open() {
            entry.retry_count += 1;
            debug!("{} {id}: sending retry {}", entry.kind, entry.retry_count);
            if let Err(e) = self.shared.transport.send(&entry.payload) {
                debug!("{} {id}: retry not sent: {e}", entry.kind);
            }
            entry.cancel_timer();
            entry.timer = Some(self.schedule(id, self.shared.config.ack_timeout, Action::Timeout));
        } else if let Some(entry) = pending.remove(id) {
            info!("{} {id}: connection lost, moving to offline queue", entry.kind);
            self.shared.queue.enqueue(entry.kind, entry.payload.clone());
            entry.resolve(false);
        }
    }

    /// Resolves every pending message `false` and cancels all timers.
    /// Returns the number of messages that were pending.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<_> = self.pending().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            trace!("{} {id}: abandoned", entry.kind);
            entry.resolve(false);
        }

        if count > 0 {
            debug!("abandoned {count} unacknowledged messages");
        }
        count
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Runs `action` for `id` after `delay`, unless the tracker is gone.
    fn schedule(&self, id: &MessageId, delay: Duration, action: Action) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                let tracker = Tracker { shared };
                match action {
                    Action::Timeout => {
                        tracker.timeout(&id);
                    }
                    Action::Retry => tracker.retry(&id),
                }
            }
        })
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("config", &self.shared.config)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, sleep_until, Instant};

    use super::*;
    use crate::{
        events::{Event, Level},
        queue::{testing::MemoryQueue, QueueStore},
        transport::{testing::MockTransport, TransportState},
    };

    struct Fixture {
        tracker: Tracker,
        transport: Arc<MockTransport>,
        queue: Arc<MemoryQueue>,
        events: tokio::sync::mpsc::UnboundedReceiver<Event>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::open());
        let queue = Arc::new(MemoryQueue::new());
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        let tracker = Tracker::new(
            ReliabilityConfig::default(),
            transport.clone(),
            QueueWriter::new(queue.clone()),
            Notifier::new(tx),
        );
        Fixture {
            tracker,
            transport,
            queue,
            events,
        }
    }

    /// Registers and transmits a frame the way the sender does.
    fn send_tracked(fixture: &Fixture) -> (MessageId, Delivery) {
        let id = MessageId::generate();
        let payload = format!(r#"{{"type":"BROADCAST_TRACK","messageId":"{id}"}}"#);
        let delivery = fixture
            .tracker
            .track(id.clone(), "BROADCAST_TRACK", payload.clone());
        fixture.transport.send(&payload).unwrap();
        (id, delivery)
    }

    fn secs(start: Instant, secs: f64) -> Instant {
        start + Duration::from_secs_f64(secs)
    }

    #[tokio::test(start_paused = true)]
    async fn ack_resolves_true() {
        let fixture = fixture();
        let (id, delivery) = send_tracked(&fixture);

        assert!(fixture.tracker.ack(&id));
        assert!(delivery.await);
        assert_eq!(fixture.tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_three_times_then_gives_up() {
        let mut fixture = fixture();
        let start = Instant::now();
        let (_, delivery) = send_tracked(&fixture);

        // Timeouts at 5s, 11s, 18s and 27s; retries 1s, 2s and 4s later.
        let expected = [(4.9, 1), (6.1, 2), (12.9, 2), (13.1, 3), (21.9, 3), (22.1, 4)];
        for (at, sends) in expected {
            sleep_until(secs(start, at)).await;
            assert_eq!(fixture.transport.sent_count(), sends, "at {at}s");
        }
        assert_eq!(fixture.tracker.pending_count(), 1);

        assert!(!delivery.await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(27), "resolved after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(27_100), "resolved after {elapsed:?}");
        assert_eq!(fixture.transport.sent_count(), 4);
        assert_eq!(fixture.tracker.pending_count(), 0);

        let all_sent: Vec<_> = fixture.transport.sent();
        assert!(all_sent.windows(2).all(|pair| pair[0] == pair[1]));

        assert!(matches!(
            fixture.events.try_recv(),
            Ok(Event::Toast {
                level: Level::Warning,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn nack_retries_without_waiting_for_timeout() {
        let fixture = fixture();
        let start = Instant::now();
        let (id, delivery) = send_tracked(&fixture);

        assert!(fixture.tracker.nack(&id, Some("busy")));
        // A second rejection while the retry is pending changes nothing.
        assert!(fixture.tracker.nack(&id, None));

        sleep_until(secs(start, 1.1)).await;
        assert_eq!(fixture.transport.sent_count(), 2);

        sleep_until(secs(start, 3.0)).await;
        assert_eq!(fixture.transport.sent_count(), 2);

        fixture.tracker.ack(&id);
        assert!(delivery.await);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_is_idempotent() {
        let fixture = fixture();
        let (id, delivery) = send_tracked(&fixture);

        assert!(fixture.tracker.ack(&id));
        assert!(!fixture.tracker.ack(&id));
        assert!(!fixture.tracker.nack(&id, None));
        assert!(delivery.await);

        // No timer survives the ack.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(fixture.transport.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_registration_is_refused() {
        let fixture = fixture();
        let (id, first) = send_tracked(&fixture);

        let second = fixture
            .tracker
            .track(id.clone(), "BROADCAST_TRACK", "{}".to_owned());
        assert!(!second.await);
        assert_eq!(fixture.tracker.pending_count(), 1);

        fixture.tracker.ack(&id);
        assert!(first.await);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_while_offline_moves_message_to_queue() {
        let fixture = fixture();
        let (_, delivery) = send_tracked(&fixture);
        fixture.transport.set_state(TransportState::Closed);

        assert!(!delivery.await);
        sleep(Duration::from_millis(1)).await;

        assert_eq!(fixture.transport.sent_count(), 1);
        let queued = fixture.queue.get_all().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].payload.contains("BROADCAST_TRACK"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_drains_everything() {
        let fixture = fixture();
        let deliveries: Vec<_> = (0..3).map(|_| send_tracked(&fixture).1).collect();

        assert_eq!(fixture.tracker.clear_all(), 3);
        assert_eq!(fixture.tracker.pending_count(), 0);
        for delivery in deliveries {
            assert!(!delivery.await);
        }

        sleep(Duration::from_secs(120)).await;
        assert_eq!(fixture.transport.sent_count(), 3);
        assert_eq!(fixture.queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resolved_delivery_is_ready() {
        assert!(Delivery::resolved(true).await);
        assert!(!Delivery::resolved(false).await);
    }
}
