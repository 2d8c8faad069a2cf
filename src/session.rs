//! The connection manager: lifecycle of a live set.
//!
//! A set moves through these states:
//!
//! ```text
//! offline ──go_live──▶ connecting ──SESSION_REGISTERED──▶ live
//!    ▲                  │    ▲                             │
//!    │                  │    └──────connection lost────────┘
//!    │                  ▼
//!    └──end_set──── error (reconnects exhausted) ──go_live──▶ connecting
//! ```
//!
//! `end_set` and `SESSION_EXPIRED` return to `offline` from any state.
//!
//! Going live allocates a fresh [`LiveSet`] that owns the dedup state of the
//! set, so nothing carries over from the previous one. Tearing down flips
//! live mode off first, so that sends racing the teardown are dropped
//! instead of queued, then resolves every pending delivery and cancels
//! every timer before the transport is closed.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::{Broadcast, BroadcastGuard},
    config::Config,
    error::{Error, Result},
    events::{Event, Notifier},
    flusher::{FlushOutcome, Flusher},
    likes::LikeBatcher,
    plays::{PlayDeduplicator, PlayStore},
    protocol::{
        messages::{
            Ack, LikeReceived, ListenerCount, Nack, PollEnded, PollStarted, PollUpdate,
            ReactionReceived, SessionExpired, SessionRegistered, SessionValid, TempoFeedback,
        },
        Outbound, SessionId,
    },
    queue::{QueueStore, QueueWriter},
    reliability::{Delivery, Tracker},
    router::{RouteContext, Router, SessionHandlers},
    sender::Sender,
    state::{ConnectionStatus, PollSnapshot, SessionState, SharedState},
    track::Track,
    transport::Transport,
    util,
};

/// State owned by one live set and dropped with it.
struct LiveSet {
    session_id: SessionId,
    broadcast: BroadcastGuard,
    plays: PlayDeduplicator,

    /// Track to broadcast once the relay confirms the set.
    deferred: Option<Track>,

    /// Whether the relay has confirmed this set at least once.
    registered: bool,

    /// Cancelled when the set ends.
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    state: Arc<SharedState>,
    transport: Arc<dyn Transport>,
    plays: Arc<dyn PlayStore>,
    tracker: Tracker,
    sender: Sender,
    flusher: Flusher,
    router: Router,
    likes: LikeBatcher,
    notifier: Notifier,
    live: Mutex<Option<LiveSet>>,
}

/// How a set ends.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Teardown {
    /// Back to `offline` with everything cleared.
    Offline,

    /// To `error`, keeping the message for the UI.
    Error,
}

impl Manager {
    #[must_use]
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        queue: Arc<dyn QueueStore>,
        plays: Arc<dyn PlayStore>,
        notifier: Notifier,
    ) -> Self {
        let state = Arc::new(SharedState::new());
        let writer = QueueWriter::new(Arc::clone(&queue));
        let tracker = Tracker::new(
            config.reliability.clone(),
            Arc::clone(&transport),
            writer.clone(),
            notifier.clone(),
        );
        let sender = Sender::new(
            Arc::clone(&transport),
            tracker.clone(),
            writer,
            Arc::clone(&state),
            notifier.clone(),
        );
        let flusher = Flusher::new(
            Arc::clone(&transport),
            queue,
            config.flush.clone(),
            notifier.clone(),
        );
        let likes = LikeBatcher::new(config.likes, notifier.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                state,
                transport,
                plays,
                tracker,
                sender,
                flusher,
                router: Router::new(),
                likes,
                notifier,
                live: Mutex::new(None),
            }),
        }
    }

    fn live(&self) -> MutexGuard<'_, Option<LiveSet>> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Changes the status and tells the UI if it changed.
    fn transition(&self, status: ConnectionStatus) {
        let previous = self.inner.state.set_status(status);
        if previous != status {
            info!("{previous} -> {status}");
            self.inner.notifier.emit(Event::StatusChanged(status));
        }
    }

    /// Starts a new set.
    ///
    /// `current` is the track already on the deck. With `include_current`
    /// it is broadcast and recorded once the relay confirms the set.
    /// Otherwise it is remembered as seen, so it is neither broadcast nor
    /// recorded in this set.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a set is already connecting or live.
    pub async fn go_live(&self, current: Option<Track>, include_current: bool) -> Result<SessionId> {
        let status = self.inner.state.status();
        if !matches!(status, ConnectionStatus::Offline | ConnectionStatus::Error) {
            return Err(Error::failed_precondition(format!(
                "cannot go live while {status}"
            )));
        }

        // Stale entries of a set that ended in error.
        self.inner.tracker.clear_all();

        let session_id = SessionId::generate();
        let now = util::now_millis();
        let local_session_id = match self
            .inner
            .plays
            .create_session(&self.inner.config.dj_name, now)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("plays of this set will not be recorded: {e}");
                None
            }
        };

        let mut set = LiveSet {
            session_id: session_id.clone(),
            broadcast: BroadcastGuard::new(),
            plays: PlayDeduplicator::new(self.inner.config.dedup),
            deferred: None,
            registered: false,
            shutdown: CancellationToken::new(),
        };
        if let Some(track) = current {
            if include_current {
                set.deferred = Some(track);
            } else {
                debug!("{track}: already playing, not broadcasting");
                set.broadcast.seed(track.key());
                set.plays.mark_seen(&track, now);
            }
        }

        {
            let mut live = self.live();
            if live.is_some() {
                return Err(Error::failed_precondition("another set started meanwhile"));
            }
            *live = Some(set);
        }

        self.inner.state.begin(session_id.clone());
        self.inner.state.set_local_session_id(local_session_id);
        self.inner
            .notifier
            .emit(Event::StatusChanged(ConnectionStatus::Connecting));
        self.inner.router.set_context(RouteContext {
            session_id: session_id.clone(),
            handlers: Box::new(LiveHandlers {
                manager: Arc::downgrade(&self.inner),
            }),
        });
        info!("going live as {session_id}");

        if self.inner.transport.is_open() {
            self.on_transport_open();
        }

        Ok(session_id)
    }

    /// Ends the set: tells the relay if connected, then tears down.
    pub async fn end_set(&self) {
        let Some(session_id) = self.inner.state.session_id() else {
            debug!("no set to end");
            return;
        };

        if self.inner.transport.is_open() {
            let delivery = self
                .inner
                .sender
                .send(Outbound::EndSession { session_id }, true);
            let timeout = self.inner.config.reliability.ack_timeout;
            if !matches!(tokio::time::timeout(timeout, delivery).await, Ok(true)) {
                debug!("end of set not acknowledged");
            }
        }

        self.inner.likes.flush();
        self.teardown(Teardown::Offline);
    }

    fn teardown(&self, how: Teardown) {
        let set = self.live().take();

        self.inner.state.set_live_mode(false);
        let abandoned = self.inner.tracker.clear_all();
        self.inner.likes.clear();
        self.inner.router.clear_context();
        self.inner.transport.close();

        match how {
            Teardown::Offline => {
                self.inner.state.reset();
                self.inner
                    .notifier
                    .emit(Event::StatusChanged(ConnectionStatus::Offline));
            }
            Teardown::Error => {
                self.inner.notifier.emit(Event::StatusChanged(ConnectionStatus::Error));
            }
        }

        if let Some(set) = set {
            set.shutdown.cancel();
            info!(
                "set {} ended ({abandoned} messages unacknowledged)",
                set.session_id
            );
        }
    }

    /// Token cancelled when the current set ends.
    #[must_use]
    pub fn shutdown_token(&self) -> Option<CancellationToken> {
        self.live().as_ref().map(|set| set.shutdown.clone())
    }

    /// Registers the set with the relay, or re-attaches to it after a
    /// reconnect.
    pub fn on_transport_open(&self) {
        let message = {
            let live = self.live();
            let Some(set) = live.as_ref() else {
                debug!("connected without a live set");
                return;
            };

            let session_id = set.session_id.clone();
            if set.registered {
                Outbound::ValidateSession { session_id }
            } else {
                Outbound::RegisterSession {
                    session_id,
                    dj_name: self.inner.config.dj_name.clone(),
                    client_id: self.inner.config.client_id.to_string(),
                }
            }
        };

        debug!("connected, sending {}", message.kind());
        drop(self.inner.sender.send(message, false));
    }

    /// The connection dropped and a reconnect is underway. Live mode stays
    /// on, so sends are queued meanwhile.
    pub fn on_transport_closed(&self) {
        if self.live().is_none() {
            return;
        }
        self.transition(ConnectionStatus::Connecting);
    }

    /// Gives up on the set after the last reconnect attempt failed.
    pub fn on_reconnect_exhausted(&self, error: &str) {
        if self.live().is_none() {
            return;
        }

        warn!("could not reconnect: {error}");
        self.inner.state.set_error(error);
        self.teardown(Teardown::Error);
    }

    /// The relay confirmed the set.
    fn confirm_live(&self, cloud_session_id: Option<SessionId>) {
        let deferred = {
            let mut live = self.live();
            let Some(set) = live.as_mut() else {
                return;
            };
            set.registered = true;
            set.deferred.take()
        };

        if let Some(session_id) = cloud_session_id {
            self.inner.state.set_cloud_session_id(session_id);
        }
        self.transition(ConnectionStatus::Live);

        // Queued messages go first, then the track that was waiting.
        let manager = self.clone();
        tokio::spawn(async move {
            manager.flush_queue().await;
            if let Some(track) = deferred {
                drop(manager.broadcast_track(&track));
                if let Err(e) = manager.record_play(&track).await {
                    warn!("{track}: play not recorded: {e}");
                }
            }
        });
    }

    fn expire(&self, reason: Option<String>) {
        warn!(
            "relay ended the set: {}",
            reason.as_deref().unwrap_or("session expired")
        );
        self.teardown(Teardown::Offline);
        self.inner.notifier.emit(Event::SessionExpired { reason });
    }

    /// Broadcasts `track` as now playing, unless it is the track that was
    /// broadcast last.
    pub fn broadcast_track(&self, track: &Track) -> Broadcast {
        let track_key = track.key();
        let session_id = {
            let mut live = self.live();
            let Some(set) = live.as_mut() else {
                debug!("{track}: not live, not broadcasting");
                return Broadcast {
                    broadcasted: false,
                    track_key,
                    delivery: Delivery::resolved(false),
                };
            };

            if !set.broadcast.admit(&track_key) {
                return Broadcast {
                    broadcasted: false,
                    track_key,
                    delivery: Delivery::resolved(false),
                };
            }
            set.session_id.clone()
        };

        info!("now playing: {track}");
        self.inner.state.reset_live_likes();
        let delivery = self.inner.sender.send(
            Outbound::BroadcastTrack {
                session_id,
                track: track.clone(),
            },
            true,
        );

        Broadcast {
            broadcasted: true,
            track_key,
            delivery,
        }
    }

    /// Broadcasts `track` even if it was the last one broadcast.
    pub fn force_rebroadcast(&self, track: &Track) -> Broadcast {
        if let Some(set) = self.live().as_mut() {
            set.broadcast.force();
        }
        self.broadcast_track(track)
    }

    /// Whether `track` was broadcast or already playing earlier in the
    /// current set.
    #[must_use]
    pub fn has_played(&self, track: &Track) -> bool {
        self.live()
            .as_ref()
            .is_some_and(|set| set.broadcast.has_played(&track.key()))
    }

    /// Records a play of `track` in local history if the play guard
    /// admits it. Returns the id of the recorded play.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the play store fails.
    pub async fn record_play(&self, track: &Track) -> Result<Option<u64>> {
        let now = util::now_millis();
        {
            let mut live = self.live();
            let Some(set) = live.as_mut() else {
                return Ok(None);
            };
            if !set.plays.record(track, now).is_accepted() {
                return Ok(None);
            }
        }

        let Some(local_session_id) = self.inner.state.snapshot().local_session_id else {
            debug!("{track}: no local set to record into");
            return Ok(None);
        };

        let id = self
            .inner
            .plays
            .create_play(local_session_id, track, now)
            .await?;
        self.inner.state.set_current_play_id(Some(id));
        debug!("{track}: recorded as play #{id}");
        Ok(Some(id))
    }

    /// Sends a message of the current set.
    fn send_in_set<F>(&self, reliable: bool, build: F) -> Delivery
    where
        F: FnOnce(SessionId) -> Outbound,
    {
        match self.inner.state.session_id() {
            Some(session_id) => self.inner.sender.send(build(session_id), reliable),
            None => Delivery::resolved(false),
        }
    }

    /// Sends analysis results for the track on air.
    pub fn update_metadata(&self, track: &Track) -> Delivery {
        self.send_in_set(false, |session_id| Outbound::MetadataUpdated {
            session_id,
            track: track.clone(),
        })
    }

    pub fn track_stopped(&self) -> Delivery {
        self.send_in_set(false, |session_id| Outbound::TrackStopped { session_id })
    }

    pub fn start_poll(
        &self,
        question: impl Into<String>,
        options: Vec<String>,
        duration: Option<Duration>,
    ) -> Delivery {
        let question = question.into();
        self.send_in_set(true, |session_id| Outbound::StartPoll {
            session_id,
            question,
            options,
            duration_seconds: duration.map(seconds),
        })
    }

    pub fn end_poll(&self, poll_id: u64) -> Delivery {
        self.inner.state.end_poll(poll_id);
        self.send_in_set(true, |session_id| Outbound::EndPoll {
            session_id,
            poll_id,
        })
    }

    pub fn cancel_poll(&self, poll_id: u64) -> Delivery {
        self.inner.state.end_poll(poll_id);
        self.send_in_set(true, |session_id| Outbound::CancelPoll {
            session_id,
            poll_id,
        })
    }

    pub fn send_announcement(&self, message: impl Into<String>, duration: Option<Duration>) -> Delivery {
        let message = message.into();
        self.inner.state.set_announcement(Some(message.clone()));
        self.send_in_set(true, |session_id| Outbound::SendAnnouncement {
            session_id,
            message,
            duration_seconds: duration.map(seconds),
        })
    }

    pub fn cancel_announcement(&self) -> Delivery {
        self.inner.state.set_announcement(None);
        self.send_in_set(true, |session_id| Outbound::CancelAnnouncement { session_id })
    }

    /// Dispatches an inbound text frame. See [`Router::dispatch`].
    pub fn dispatch(&self, text: &str) -> bool {
        self.inner.router.dispatch(text)
    }

    /// Sends what was queued while offline.
    pub async fn flush_queue(&self) -> FlushOutcome {
        self.inner.flusher.flush().await
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.inner.state.snapshot()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.status()
    }

    /// Number of reliable messages awaiting acknowledgment.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.tracker.pending_count()
    }
}

fn seconds(duration: Duration) -> u32 {
    u32::try_from(duration.as_secs()).unwrap_or(u32::MAX)
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("state", &self.inner.state)
            .field("tracker", &self.inner.tracker)
            .field("router", &self.inner.router)
            .finish_non_exhaustive()
    }
}

/// Routes inbound messages of a live set into the manager.
struct LiveHandlers {
    manager: Weak<Inner>,
}

impl LiveHandlers {
    fn manager(&self) -> Result<Manager> {
        self.manager
            .upgrade()
            .map(|inner| Manager { inner })
            .ok_or_else(|| Error::cancelled("connection manager is gone"))
    }
}

impl SessionHandlers for LiveHandlers {
    fn ack(&self, message: Ack) -> Result<()> {
        self.manager()?.inner.tracker.ack(&message.message_id);
        Ok(())
    }

    fn nack(&self, message: Nack) -> Result<()> {
        self.manager()?
            .inner
            .tracker
            .nack(&message.message_id, message.error.as_deref());
        Ok(())
    }

    fn session_registered(&self, message: SessionRegistered) -> Result<()> {
        self.manager()?.confirm_live(Some(message.session_id));
        Ok(())
    }

    fn session_valid(&self, message: SessionValid) -> Result<()> {
        trace!("{} is still valid", message.session_id);
        self.manager()?.confirm_live(None);
        Ok(())
    }

    fn session_expired(&self, message: SessionExpired) -> Result<()> {
        self.manager()?.expire(message.reason);
        Ok(())
    }

    fn like_received(&self, message: LikeReceived) -> Result<()> {
        let manager = self.manager()?;
        manager.inner.state.add_live_like();
        manager.inner.likes.push(&message.payload.track.title);
        Ok(())
    }

    fn listener_count(&self, message: ListenerCount) -> Result<()> {
        let manager = self.manager()?;
        manager.inner.state.set_listener_count(message.count);
        manager
            .inner
            .notifier
            .emit(Event::ListenerCount(message.count));
        Ok(())
    }

    fn tempo_feedback(&self, message: TempoFeedback) -> Result<()> {
        let manager = self.manager()?;
        manager.inner.state.set_tempo(message);
        manager.inner.notifier.emit(Event::TempoFeedback(message));
        Ok(())
    }

    fn poll_started(&self, message: PollStarted) -> Result<()> {
        let manager = self.manager()?;
        let poll = PollSnapshot::from(message);
        manager.inner.state.set_poll(Some(poll.clone()));
        manager.inner.notifier.emit(Event::Poll(poll));
        Ok(())
    }

    fn poll_update(&self, message: PollUpdate) -> Result<()> {
        let manager = self.manager()?;
        match manager
            .inner
            .state
            .update_poll_votes(message.poll_id, message.votes, message.total_votes)
        {
            Some(poll) => manager.inner.notifier.emit(Event::Poll(poll)),
            None => debug!("tally for unknown poll {}", message.poll_id),
        }
        Ok(())
    }

    fn poll_ended(&self, message: PollEnded) -> Result<()> {
        let manager = self.manager()?;
        manager.inner.state.end_poll(message.poll_id);
        manager.inner.notifier.emit(Event::PollEnded {
            poll_id: message.poll_id,
            winner: message.winner,
        });
        Ok(())
    }

    fn reaction_received(&self, message: ReactionReceived) -> Result<()> {
        self.manager()?
            .inner
            .notifier
            .emit(Event::Reaction(message.reaction));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::{sync::mpsc, time::sleep};

    use super::*;
    use crate::{
        error::ErrorKind,
        plays::testing::MemoryPlays,
        queue::testing::MemoryQueue,
        transport::{testing::MockTransport, TransportState},
    };

    struct Fixture {
        manager: Manager,
        transport: Arc<MockTransport>,
        queue: Arc<MemoryQueue>,
        plays: Arc<MemoryPlays>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::closed());
        let queue = Arc::new(MemoryQueue::new());
        let plays = Arc::new(MemoryPlays::new());
        let (tx, events) = mpsc::unbounded_channel();
        let config = Config::new("wss://relay.invalid/ws".parse().unwrap(), "DJ Test");
        let manager = Manager::new(
            config,
            transport.clone(),
            queue.clone(),
            plays.clone(),
            Notifier::new(tx),
        );
        Fixture {
            manager,
            transport,
            queue,
            plays,
            events,
        }
    }

    fn sent_of_type(transport: &MockTransport, kind: &str) -> Vec<Value> {
        transport
            .sent_values()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    fn ack_all(fixture: &Fixture) {
        for frame in fixture.transport.sent_values() {
            if let Some(id) = frame["messageId"].as_str() {
                fixture
                    .manager
                    .dispatch(&json!({ "type": "ACK", "messageId": id }).to_string());
            }
        }
    }

    /// Goes live and completes registration over an open transport.
    async fn live(fixture: &Fixture, current: Option<Track>, include_current: bool) -> SessionId {
        let session_id = fixture
            .manager
            .go_live(current, include_current)
            .await
            .unwrap();
        fixture.transport.set_state(TransportState::Open);
        fixture.manager.on_transport_open();
        assert!(fixture.manager.dispatch(
            &json!({ "type": "SESSION_REGISTERED", "sessionId": session_id.as_str() }).to_string()
        ));
        // Let the post-registration flush run.
        sleep(Duration::from_millis(10)).await;
        session_id
    }

    #[tokio::test(start_paused = true)]
    async fn go_live_registers_and_becomes_live() {
        let mut fixture = fixture();
        let session_id = live(&fixture, None, false).await;

        let registrations = sent_of_type(&fixture.transport, "REGISTER_SESSION");
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0]["sessionId"], session_id.as_str());
        assert_eq!(registrations[0]["djName"], "DJ Test");

        let snapshot = fixture.manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Live);
        assert_eq!(snapshot.cloud_session_id, Some(session_id));
        assert_eq!(snapshot.local_session_id, Some(1));

        assert_eq!(
            fixture.events.try_recv().unwrap(),
            Event::StatusChanged(ConnectionStatus::Connecting)
        );
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            Event::StatusChanged(ConnectionStatus::Live)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cannot_go_live_twice() {
        let fixture = fixture();
        fixture.manager.go_live(None, false).await.unwrap();

        let err = fixture.manager.go_live(None, false).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    }

    #[tokio::test(start_paused = true)]
    async fn same_track_is_broadcast_once() {
        let fixture = fixture();
        live(&fixture, None, false).await;
        let track = Track::new("Bonobo", "Kerala");
        assert!(!fixture.manager.has_played(&track));

        let first = fixture.manager.broadcast_track(&track);
        assert!(first.broadcasted);
        assert!(fixture.manager.has_played(&track));
        for _ in 0..3 {
            let again = fixture.manager.broadcast_track(&track);
            assert!(!again.broadcasted);
            assert_eq!(again.track_key, first.track_key);
        }
        assert_eq!(sent_of_type(&fixture.transport, "BROADCAST_TRACK").len(), 1);

        ack_all(&fixture);
        assert!(first.delivery.await);

        let forced = fixture.manager.force_rebroadcast(&track);
        assert!(forced.broadcasted);
        assert_eq!(sent_of_type(&fixture.transport, "BROADCAST_TRACK").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn included_current_track_is_broadcast_after_registration() {
        let fixture = fixture();
        let track = Track::new("Four Tet", "Baby");
        live(&fixture, Some(track.clone()), true).await;

        let broadcasts = sent_of_type(&fixture.transport, "BROADCAST_TRACK");
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0]["track"]["title"], "Baby");
        assert_eq!(fixture.plays.plays().len(), 1);
        assert_eq!(fixture.manager.snapshot().current_play_id, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn declined_current_track_is_never_broadcast_or_recorded() {
        let fixture = fixture();
        let track = Track::new("Four Tet", "Baby");
        live(&fixture, Some(track.clone()), false).await;

        assert!(fixture.manager.has_played(&track));
        assert!(!fixture.manager.broadcast_track(&track).broadcasted);
        assert_eq!(fixture.manager.record_play(&track).await.unwrap(), None);
        assert!(sent_of_type(&fixture.transport, "BROADCAST_TRACK").is_empty());
        assert!(fixture.plays.plays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_play_is_recorded_once() {
        let fixture = fixture();
        live(&fixture, None, false).await;
        let track = Track::new("Caribou", "Sun");

        assert_eq!(fixture.manager.record_play(&track).await.unwrap(), Some(1));
        assert_eq!(fixture.manager.record_play(&track).await.unwrap(), None);
        assert_eq!(fixture.plays.plays().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_queue_during_reconnect_and_flush_after() {
        let fixture = fixture();
        live(&fixture, None, false).await;

        fixture.transport.set_state(TransportState::Closed);
        fixture.manager.on_transport_closed();
        assert_eq!(fixture.manager.status(), ConnectionStatus::Connecting);

        let broadcast = fixture
            .manager
            .broadcast_track(&Track::new("Jon Hopkins", "Emerald Rush"));
        assert!(broadcast.broadcasted);
        assert!(!broadcast.delivery.await);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(fixture.queue.count().await.unwrap(), 1);

        fixture.transport.set_state(TransportState::Open);
        fixture.manager.on_transport_open();
        assert_eq!(sent_of_type(&fixture.transport, "VALIDATE_SESSION").len(), 1);

        fixture
            .manager
            .dispatch(r#"{"type":"SESSION_VALID","sessionId":"set_x"}"#);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(fixture.manager.status(), ConnectionStatus::Live);
        assert_eq!(fixture.queue.count().await.unwrap(), 0);
        assert_eq!(sent_of_type(&fixture.transport, "BROADCAST_TRACK").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn end_set_drains_everything() {
        let mut fixture = fixture();
        live(&fixture, None, false).await;

        let broadcast = fixture
            .manager
            .broadcast_track(&Track::new("Floating Points", "Ratio"));
        let poll = fixture
            .manager
            .start_poll("Next?", vec!["House".to_owned(), "Disco".to_owned()], None);
        assert_eq!(fixture.manager.pending_count(), 2);

        fixture.manager.end_set().await;

        assert_eq!(fixture.manager.pending_count(), 0);
        assert!(!broadcast.delivery.await);
        assert!(!poll.await);
        assert_eq!(fixture.manager.snapshot(), SessionState::default());
        assert!(!fixture.transport.is_open());
        assert_eq!(sent_of_type(&fixture.transport, "END_SESSION").len(), 1);

        let sent = fixture.transport.sent_count();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(fixture.transport.sent_count(), sent);
        assert_eq!(fixture.queue.count().await.unwrap(), 0);

        while let Ok(event) = fixture.events.try_recv() {
            assert!(!matches!(event, Event::Toast { .. }), "{event:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_moves_to_error_and_stops_queueing() {
        let fixture = fixture();
        live(&fixture, None, false).await;
        let token = fixture.manager.shutdown_token().unwrap();

        fixture.transport.set_state(TransportState::Closed);
        fixture.manager.on_transport_closed();
        fixture.manager.on_reconnect_exhausted("relay unreachable");

        let snapshot = fixture.manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Error);
        assert_eq!(snapshot.last_error.as_deref(), Some("relay unreachable"));
        assert!(!snapshot.live_mode);
        assert!(token.is_cancelled());

        fixture.manager.track_stopped().await;
        sleep(Duration::from_millis(1)).await;
        assert_eq!(fixture.queue.count().await.unwrap(), 0);

        // A new set may start from error.
        fixture.manager.go_live(None, false).await.unwrap();
        assert_eq!(fixture.manager.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_ends_the_set() {
        let mut fixture = fixture();
        live(&fixture, None, false).await;
        while fixture.events.try_recv().is_ok() {}

        assert!(fixture
            .manager
            .dispatch(r#"{"type":"SESSION_EXPIRED","reason":"idle"}"#));

        assert_eq!(fixture.manager.status(), ConnectionStatus::Offline);
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            Event::StatusChanged(ConnectionStatus::Offline)
        );
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            Event::SessionExpired {
                reason: Some("idle".to_owned())
            }
        );
        assert!(!fixture.manager.dispatch(r#"{"type":"LISTENER_COUNT","count":3}"#));
    }

    #[tokio::test(start_paused = true)]
    async fn likes_count_until_the_next_track() {
        let fixture = fixture();
        live(&fixture, None, false).await;
        fixture.manager.broadcast_track(&Track::new("A", "One"));

        let like = json!({ "type": "LIKE_RECEIVED", "payload": { "track": { "title": "One" } } });
        for _ in 0..3 {
            assert!(fixture.manager.dispatch(&like.to_string()));
        }
        assert_eq!(fixture.manager.snapshot().live_likes, 3);

        fixture.manager.broadcast_track(&Track::new("B", "Two"));
        assert_eq!(fixture.manager.snapshot().live_likes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_lifecycle_updates_state() {
        let fixture = fixture();
        live(&fixture, None, false).await;

        fixture.manager.dispatch(
            &json!({ "type": "POLL_STARTED", "pollId": 9, "question": "Next?", "options": ["A", "B"] })
                .to_string(),
        );
        fixture.manager.dispatch(
            &json!({ "type": "POLL_UPDATE", "pollId": 9, "votes": [3, 1], "totalVotes": 4 })
                .to_string(),
        );

        let poll = fixture.manager.snapshot().poll.unwrap();
        assert_eq!(poll.votes, [3, 1]);
        assert_eq!(poll.total_votes, 4);

        fixture.manager.dispatch(
            &json!({ "type": "POLL_ENDED", "pollId": 9, "winner": "A" }).to_string(),
        );
        assert!(fixture.manager.snapshot().poll.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_or_queued_offline() {
        let fixture = fixture();
        assert!(!fixture.manager.broadcast_track(&Track::new("A", "B")).broadcasted);
        assert!(!fixture.manager.send_announcement("Hi", None).await);
        sleep(Duration::from_millis(1)).await;

        assert_eq!(fixture.transport.sent_count(), 0);
        assert_eq!(fixture.queue.count().await.unwrap(), 0);
    }
}
