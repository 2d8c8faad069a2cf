//! Batching of listener likes into a single notification.
//!
//! Likes arrive in bursts when a drop lands. Rather than one notification
//! per like, likes for the same title are counted and flushed as "3 people
//! liked Strobe" when the batch is full, when the timer runs out, or when a
//! like for another title arrives.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::task::JoinHandle;

use crate::{
    config::LikeBatchConfig,
    events::{Event, Notifier},
};

#[derive(Clone)]
pub struct LikeBatcher {
    shared: Arc<Shared>,
}

struct Shared {
    config: LikeBatchConfig,
    notifier: Notifier,
    batch: Mutex<Batch>,
}

#[derive(Debug, Default)]
struct Batch {
    count: u32,
    title: Option<String>,
    timer: Option<JoinHandle<()>>,
}

impl Batch {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Resets the batch and returns what it held.
    fn take(&mut self) -> Option<(u32, String)> {
        self.cancel_timer();
        let count = std::mem::take(&mut self.count);
        self.title.take().filter(|_| count > 0).map(|title| (count, title))
    }
}

/// Text of a flushed batch.
#[must_use]
pub fn message(count: u32, title: &str) -> String {
    if count == 1 {
        format!("Someone liked {title}")
    } else {
        format!("{count} people liked {title}")
    }
}

impl LikeBatcher {
    #[must_use]
    pub fn new(config: LikeBatchConfig, notifier: Notifier) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                notifier,
                batch: Mutex::new(Batch::default()),
            }),
        }
    }

    fn batch(&self) -> MutexGuard<'_, Batch> {
        self.shared
            .batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts a like for `title`.
    pub fn push(&self, title: &str) {
        let mut batch = self.batch();

        if batch.title.as_deref().is_some_and(|current| current != title) {
            self.emit(batch.take());
        }

        batch.count += 1;
        if batch.title.is_none() {
            batch.title = Some(title.to_owned());
        }

        if batch.count >= self.shared.config.threshold {
            self.emit(batch.take());
        } else if batch.timer.is_none() {
            batch.timer = Some(self.schedule_flush());
        }
    }

    /// Flushes the pending batch, if any.
    pub fn flush(&self) {
        let taken = self.batch().take();
        self.emit(taken);
    }

    /// Drops the pending batch without notifying.
    pub fn clear(&self) {
        if let Some((count, title)) = self.batch().take() {
            trace!("dropping {count} unflushed likes for {title}");
        }
    }

    #[must_use]
    pub fn pending(&self) -> u32 {
        self.batch().count
    }

    fn emit(&self, taken: Option<(u32, String)>) {
        if let Some((count, title)) = taken {
            let message = message(count, &title);
            debug!("{message}");
            self.shared.notifier.emit(Event::Likes {
                count,
                title,
                message,
            });
        }
    }

    fn schedule_flush(&self) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let delay = self.shared.config.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                let batcher = LikeBatcher { shared };
                // This task is the timer; do not abort it from within.
                let taken = {
                    let mut batch = batcher.batch();
                    batch.timer = None;
                    batch.take()
                };
                batcher.emit(taken);
            }
        })
    }
}

impl fmt::Debug for LikeBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LikeBatcher")
            .field("config", &self.shared.config)
            .field("batch", &*self.batch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::sleep};

    use super::*;

    fn batcher() -> (LikeBatcher, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LikeBatcher::new(LikeBatchConfig::default(), Notifier::new(tx)),
            rx,
        )
    }

    fn likes(event: Event) -> (u32, String) {
        match event {
            Event::Likes { count, message, .. } => (count, message),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_like_flushes_after_delay() {
        let (batcher, mut events) = batcher();
        batcher.push("Strobe");

        sleep(Duration::from_millis(2_900)).await;
        assert!(events.try_recv().is_err());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(
            likes(events.try_recv().unwrap()),
            (1, "Someone liked Strobe".to_owned())
        );
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_flushes_immediately() {
        let (batcher, mut events) = batcher();
        for _ in 0..5 {
            batcher.push("Strobe");
        }

        assert_eq!(
            likes(events.try_recv().unwrap()),
            (5, "5 people liked Strobe".to_owned())
        );

        // The cancelled timer does not fire an empty batch.
        sleep(Duration::from_secs(10)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn title_change_flushes_previous_batch() {
        let (batcher, mut events) = batcher();
        batcher.push("Strobe");
        batcher.push("Strobe");
        batcher.push("Opus");

        assert_eq!(likes(events.try_recv().unwrap()).0, 2);
        assert_eq!(batcher.pending(), 1);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(
            likes(events.try_recv().unwrap()),
            (1, "Someone liked Opus".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_batch_silently() {
        let (batcher, mut events) = batcher();
        batcher.push("Strobe");
        batcher.clear();

        sleep(Duration::from_secs(10)).await;
        assert!(events.try_recv().is_err());
    }
}
