//! Drains the durable queue after a reconnect.
//!
//! Messages go out oldest first, one at a time, with a delay between them
//! that ramps up every few messages so a long backlog does not flood the
//! relay. A closed connection stops the flush and leaves the remainder
//! queued in order. Repeated send failures trip a circuit breaker.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde_json::Value;

use crate::{
    config::FlushConfig, error::Result, events::Notifier, queue::QueueStore,
    transport::Transport,
};

/// How a flush ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FlushOutcome {
    /// Another flush was running; nothing was done.
    AlreadyRunning,

    Empty,

    /// Every queued message was sent or discarded.
    Completed { sent: usize, discarded: usize },

    /// The connection closed; `remaining` messages stay queued.
    Interrupted { sent: usize, remaining: usize },

    /// Too many consecutive send failures; `remaining` messages stay queued.
    CircuitOpen { sent: usize, remaining: usize },

    /// The queue could not be read or updated.
    Failed,
}

#[derive(Clone)]
pub struct Flusher {
    transport: Arc<dyn Transport>,
    queue: Arc<dyn QueueStore>,
    config: FlushConfig,
    notifier: Notifier,
    running: Arc<AtomicBool>,
}

/// Releases the single-flight flag however the flush ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stop {
    Closed,
    CircuitOpen,
}

impl Flusher {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<dyn QueueStore>,
        config: FlushConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            transport,
            queue,
            config,
            notifier,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Sends every queued message. Returns immediately when a flush is
    /// already in progress.
    pub async fn flush(&self) -> FlushOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("queue flush already running");
            return FlushOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.running);

        match self.drain().await {
            Ok(outcome) => {
                if let FlushOutcome::CircuitOpen { .. } = outcome {
                    self.notifier.warning("Offline sync failed, will retry");
                }
                outcome
            }
            Err(e) => {
                error!("offline sync failed: {e}");
                self.notifier.warning("Offline sync failed, will retry");
                FlushOutcome::Failed
            }
        }
    }

    async fn drain(&self) -> Result<FlushOutcome> {
        let items = self.queue.get_all().await?;
        if items.is_empty() {
            trace!("offline queue is empty");
            return Ok(FlushOutcome::Empty);
        }
        info!("sending {} queued messages", items.len());

        let last = items.len() - 1;
        let mut done = Vec::with_capacity(items.len());
        let mut sent = 0;
        let mut consecutive_failures = 0;
        let mut stop = None;

        for (index, item) in items.iter().enumerate() {
            if !self.transport.is_open() {
                stop = Some(Stop::Closed);
                break;
            }

            if !is_sendable(&item.payload) {
                warn!("discarding unreadable queued message #{}", item.id);
                done.push(item.id);
                continue;
            }

            match self.transport.send(&item.payload) {
                Ok(()) => {
                    trace!("sent queued message #{}", item.id);
                    done.push(item.id);
                    sent += 1;
                    consecutive_failures = 0;
                    if index < last {
                        tokio::time::sleep(self.config.delay_after(index)).await;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        "queued message #{} not sent ({consecutive_failures} in a row): {e}",
                        item.id
                    );
                    if consecutive_failures >= self.config.failure_threshold {
                        stop = Some(Stop::CircuitOpen);
                        break;
                    }
                    tokio::time::sleep(self.config.failure_delay(consecutive_failures)).await;
                }
            }
        }

        if !done.is_empty() {
            self.queue.delete_many(&done).await?;
        }

        let remaining = items.len() - done.len();
        let discarded = done.len() - sent;
        let outcome = match stop {
            None if remaining == 0 => FlushOutcome::Completed { sent, discarded },
            Some(Stop::CircuitOpen) => FlushOutcome::CircuitOpen { sent, remaining },
            // Failed items that did not trip the breaker stay queued too.
            None | Some(Stop::Closed) => FlushOutcome::Interrupted { sent, remaining },
        };

        info!("offline queue flush: {outcome}");
        Ok(outcome)
    }
}

/// Whether a queued payload is a JSON object worth sending.
fn is_sendable(payload: &str) -> bool {
    !payload.trim().is_empty()
        && serde_json::from_str::<Value>(payload).is_ok_and(|value| value.is_object())
}

impl fmt::Display for FlushOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "already running"),
            Self::Empty => write!(f, "nothing to send"),
            Self::Completed { sent, discarded } => {
                write!(f, "{sent} sent, {discarded} discarded")
            }
            Self::Interrupted { sent, remaining } => {
                write!(f, "{sent} sent, {remaining} left for later")
            }
            Self::CircuitOpen { sent, remaining } => {
                write!(f, "aborted after repeated failures, {sent} sent, {remaining} left")
            }
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl fmt::Debug for Flusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flusher")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::Instant};

    use super::*;
    use crate::{
        events::Event,
        queue::{testing::MemoryQueue, QueuedMessage},
        transport::testing::MockTransport,
    };

    async fn queued(count: usize) -> Arc<MemoryQueue> {
        let queue = Arc::new(MemoryQueue::new());
        for n in 1..=count {
            queue
                .enqueue(&format!(r#"{{"type":"TRACK_STOPPED","n":{n}}}"#))
                .await
                .unwrap();
        }
        queue
    }

    fn flusher(transport: &Arc<MockTransport>, queue: &Arc<MemoryQueue>) -> Flusher {
        Flusher::new(
            transport.clone(),
            queue.clone(),
            FlushConfig::default(),
            Notifier::silent(),
        )
    }

    fn numbers(rows: &[QueuedMessage]) -> Vec<u64> {
        rows.iter()
            .map(|row| {
                let value: Value = serde_json::from_str(&row.payload).unwrap();
                value["n"].as_u64().unwrap()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn sends_everything_in_order() {
        let transport = Arc::new(MockTransport::open());
        let queue = queued(3).await;

        let outcome = flusher(&transport, &queue).flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Completed {
                sent: 3,
                discarded: 0
            }
        );

        let sent: Vec<_> = transport
            .sent_values()
            .iter()
            .map(|value| value["n"].as_u64().unwrap())
            .collect();
        assert_eq!(sent, [1, 2, 3]);
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_mid_flush_keeps_the_rest_in_order() {
        let transport = Arc::new(MockTransport::open());
        transport.close_after(2);
        let queue = queued(5).await;

        let outcome = flusher(&transport, &queue).flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Interrupted {
                sent: 2,
                remaining: 3
            }
        );
        assert_eq!(numbers(&queue.get_all().await.unwrap()), [3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_breaker_stops_after_three_failures() {
        let transport = Arc::new(MockTransport::open());
        transport.fail_sends(true);
        let queue = queued(6).await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let flusher = Flusher::new(
            transport.clone(),
            queue.clone(),
            FlushConfig::default(),
            Notifier::new(tx),
        );

        let start = Instant::now();
        let outcome = flusher.flush().await;

        assert_eq!(
            outcome,
            FlushOutcome::CircuitOpen {
                sent: 0,
                remaining: 6
            }
        );
        assert_eq!(transport.attempts(), 3);
        assert_eq!(queue.count().await.unwrap(), 6);
        // Penalties of 1s and 2s; the third failure aborts without waiting.
        assert!(start.elapsed() < Duration::from_millis(3_100));
        assert!(matches!(events.try_recv(), Ok(Event::Toast { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_payloads_are_dropped_unsent() {
        let transport = Arc::new(MockTransport::open());
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue("").await.unwrap();
        queue.enqueue("not json").await.unwrap();
        queue.enqueue("[1, 2]").await.unwrap();
        queue.enqueue(r#"{"type":"TRACK_STOPPED","n":1}"#).await.unwrap();

        let outcome = flusher(&transport, &queue).flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Completed {
                sent: 1,
                discarded: 3
            }
        );
        assert_eq!(transport.sent_count(), 1);
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_flush_is_a_no_op() {
        let transport = Arc::new(MockTransport::open());
        let queue = queued(3).await;
        let flusher = flusher(&transport, &queue);

        let (first, second) = tokio::join!(flusher.flush(), flusher.flush());
        assert!(matches!(first, FlushOutcome::Completed { sent: 3, .. }));
        assert_eq!(second, FlushOutcome::AlreadyRunning);
        assert!(!flusher.is_running());

        assert_eq!(flusher.flush().await, FlushOutcome::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_sends_nothing() {
        let transport = Arc::new(MockTransport::closed());
        let queue = queued(2).await;

        let outcome = flusher(&transport, &queue).flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Interrupted {
                sent: 0,
                remaining: 2
            }
        );
        assert_eq!(queue.count().await.unwrap(), 2);
    }

    #[test]
    fn pacing_ramps_every_five_messages() {
        let config = FlushConfig::default();
        let delays: Vec<_> = (0..11).map(|index| config.delay_after(index)).collect();
        assert!(delays[..5].iter().all(|d| *d == Duration::from_millis(100)));
        assert!(delays[5] > delays[4]);
        assert!(delays[10] > delays[9]);
    }
}
