//! Per-session delivery endpoint and its transport-mode state machine.

use crate::context::NodeContext;
use crate::error::CourierError;
use crate::keys;
use crate::queue::{EventQueue, MaxWait, MemoryQueueStorage, QueueStorage, StoreQueueStorage};
use crate::session::Session;
use crate::subscription::Subscription;
use courier_rs_config::QueueBackend;
use courier_rs_protocol::{ClientAdapter, Event, Mode, fields, kinds};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FIELD_MODE: &str = "mode";

/// How a [`Subscriber::fetch_events`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A refresh directive was sent; the client should reconnect.
    Refreshed,
    /// The connection is finished and the session stopped or went inactive.
    Closed,
}

/// Counts one open client connection for as long as it lives.
struct Connection<'a>(&'a AtomicUsize);

impl<'a> Connection<'a> {
    fn open(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Delivery endpoint bound to exactly one [`Session`].
pub struct Subscriber {
    session: Weak<Session>,
    session_id: String,
    active: AtomicBool,
    connections: AtomicUsize,
    mode: RwLock<Mode>,
    last_alive: Mutex<Instant>,
    queue: EventQueue,
    context: Arc<NodeContext>,
}

impl Subscriber {
    pub(crate) fn new(
        session: Weak<Session>,
        session_id: &str,
        mode: Mode,
        context: Arc<NodeContext>,
    ) -> Self {
        let queue_config = &context.config.queue;
        let storage: Arc<dyn QueueStorage> = match queue_config.backend {
            QueueBackend::Store => Arc::new(StoreQueueStorage::new(
                Arc::clone(&context.store),
                keys::queue(session_id),
            )),
            QueueBackend::Memory => Arc::new(MemoryQueueStorage::default()),
        };
        let queue = EventQueue::new(
            session_id,
            queue_config.size,
            queue_config.poll_interval(),
            storage,
            CancellationToken::new(),
        );
        Self {
            session,
            session_id: session_id.to_string(),
            active: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            mode: RwLock::new(mode),
            last_alive: Mutex::new(Instant::now()),
            queue,
            context,
        }
    }

    /// Read the persisted mode for a session, defaulting to stream.
    pub(crate) async fn restore_mode(
        context: &NodeContext,
        session_id: &str,
    ) -> Result<Mode, CourierError> {
        let stored = context
            .store
            .hget(&keys::subscriber(session_id), FIELD_MODE)
            .await?;
        Ok(match stored.map(|value| value.parse::<Mode>()) {
            Some(Ok(mode)) => mode,
            Some(Err(err)) => {
                warn!(
                    "ignoring stored mode (session_id={}, err={})",
                    session_id, err
                );
                Mode::default()
            }
            None => Mode::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Begin accepting events.
    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// True while a [`Subscriber::fetch_events`] call is serving a client.
    pub fn is_connected(&self) -> bool {
        self.connections.load(Ordering::SeqCst) > 0
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<(), CourierError> {
        *self.mode.write() = mode;
        self.context
            .store
            .hset(&keys::subscriber(&self.session_id), FIELD_MODE, mode.as_str())
            .await?;
        Ok(())
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Deactivate, interrupt pending waits, and purge state of temporary sessions.
    pub(crate) async fn stop(&self, temporary: bool) {
        self.active.store(false, Ordering::SeqCst);
        self.queue.cancel_token().cancel();
        if !temporary {
            return;
        }
        if let Err(err) = self.queue.clear().await {
            warn!(
                "failed to clear queue (session_id={}, err={})",
                self.session_id, err
            );
        }
        if let Err(err) = self
            .context
            .store
            .delete(&keys::subscriber(&self.session_id))
            .await
        {
            warn!(
                "failed to delete subscriber record (session_id={}, err={})",
                self.session_id, err
            );
        }
        if let Err(err) = self.remove_subscriptions().await {
            warn!(
                "failed to remove subscriptions (session_id={}, err={})",
                self.session_id, err
            );
        }
    }

    /// Register interest in a comma-separated subject list.
    ///
    /// Re-subscribing with the same list replaces the stored registration.
    pub async fn add_subscription(
        &self,
        subject: &str,
        label: Option<&str>,
    ) -> Result<Subscription, CourierError> {
        let subscription = Subscription::create(subject, label)?;
        let store = &self.context.store;
        let is_new = store
            .hset(
                &keys::subscriptions(&self.session_id),
                subscription.id(),
                &subscription.to_json()?,
            )
            .await?;
        if is_new {
            let now = keys::now_millis();
            for one in subscription.subjects() {
                store
                    .hset(&keys::subject(one), &self.session_id, subscription.id())
                    .await?;
                store
                    .zadd(&keys::subject_index(one), &self.session_id, now)
                    .await?;
            }
        }
        info!(
            "subscription added (session_id={}, sid={}, label={})",
            self.session_id,
            subscription.id(),
            subscription.label().unwrap_or("")
        );
        Ok(subscription)
    }

    /// Drop one subscription and its subject index entries.
    pub async fn remove_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, CourierError> {
        let key = keys::subscriptions(&self.session_id);
        let Some(raw) = self.context.store.hget(&key, subscription_id).await? else {
            warn!(
                "no subscription found (session_id={}, sid={})",
                self.session_id, subscription_id
            );
            return Ok(None);
        };
        self.context.store.hdel(&key, subscription_id).await?;
        let subscription = Subscription::from_json(&raw)?;
        self.unindex(&subscription).await?;
        info!(
            "subscription removed (session_id={}, sid={})",
            self.session_id,
            subscription.id()
        );
        Ok(Some(subscription))
    }

    /// Drop every subscription of this session.
    pub async fn remove_subscriptions(&self) -> Result<(), CourierError> {
        let key = keys::subscriptions(&self.session_id);
        for (sid, raw) in self.context.store.hgetall(&key).await? {
            match Subscription::from_json(&raw) {
                Ok(subscription) => self.unindex(&subscription).await?,
                Err(err) => warn!(
                    "skipping undecodable subscription (session_id={}, sid={}, err={})",
                    self.session_id, sid, err
                ),
            }
        }
        self.context.store.delete(&key).await?;
        Ok(())
    }

    /// Current subscriptions ordered by id.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, CourierError> {
        let raw = self
            .context
            .store
            .hgetall(&keys::subscriptions(&self.session_id))
            .await?;
        let mut subscriptions = raw
            .values()
            .map(|value| Subscription::from_json(value))
            .collect::<Result<Vec<_>, _>>()?;
        subscriptions.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(subscriptions)
    }

    async fn unindex(&self, subscription: &Subscription) -> Result<(), CourierError> {
        for one in subscription.subjects() {
            self.context
                .store
                .hdel(&keys::subject(one), &self.session_id)
                .await?;
            self.context
                .store
                .zrem(&keys::subject_index(one), &self.session_id)
                .await?;
        }
        Ok(())
    }

    /// Find the subscription registered for the event's subject.
    pub async fn match_event(&self, event: &Event) -> Result<Option<Subscription>, CourierError> {
        let Some(subject) = event.subject() else {
            return Ok(None);
        };
        let store = &self.context.store;
        let Some(sid) = store
            .hget(&keys::subject(subject), &self.session_id)
            .await?
        else {
            return Ok(None);
        };
        let Some(raw) = store
            .hget(&keys::subscriptions(&self.session_id), &sid)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(Subscription::from_json(&raw)?))
    }

    /// Max silence tolerated before the connection is treated as gone.
    pub fn refresh_timeout(&self) -> Duration {
        match self.mode() {
            Mode::Poll => self.context.config.poll.refresh_timeout(),
            Mode::Stream | Mode::Pull => self.context.config.pull.refresh_timeout(),
        }
    }

    /// Random reconnect hint within the configured window for the current mode.
    pub fn refresh_wait_millis(&self) -> u64 {
        let refresh = match self.mode() {
            Mode::Poll => &self.context.config.poll,
            Mode::Stream | Mode::Pull => &self.context.config.pull,
        };
        rand::rng().random_range(refresh.wait_min_millis..=refresh.wait_max_millis)
    }

    /// URL a refreshing client should call next.
    pub fn refresh_url(&self, request_path: &str) -> String {
        format!(
            "{request_path}?{}={}&{}={}",
            fields::ID,
            self.session_id,
            fields::EVENT,
            kinds::REFRESH
        )
    }

    /// Wait up to `grace` for a connected client to take every queued event.
    ///
    /// Returns true once the queue is empty, the subscriber has stopped, or
    /// no client is connected to take anything.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let poll = self.context.config.queue.poll_interval();
        loop {
            if !self.is_active() || !self.is_connected() {
                return true;
            }
            match self.queue.size().await {
                Ok(0) => return true,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        "failed to read queue size (session_id={}, err={})",
                        self.session_id, err
                    );
                    return false;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    fn mark_alive(&self) {
        *self.last_alive.lock() = Instant::now();
    }

    /// Queue an event for this subscriber. Returns whether it was queued.
    ///
    /// Inactive subscribers ignore events. A subscriber that has been silent
    /// past its refresh timeout, or whose queue stays full for the write
    /// timeout, gets its session stopped.
    pub async fn on_event(&self, event: Event) -> Result<bool, CourierError> {
        if !self.is_active() {
            return Ok(false);
        }
        let Some(session) = self.session.upgrade() else {
            return Ok(false);
        };
        if session.is_expired() && event.is_online_only() {
            debug!(
                "dropping online-only event for expired session (session_id={})",
                self.session_id
            );
            return Ok(false);
        }

        let silent = self.last_alive.lock().elapsed();
        let timeout = self.refresh_timeout();
        if silent > timeout {
            warn!(
                "subscriber not alive, leaving (session_id={}, silent_ms={}, timeout_ms={})",
                self.session_id,
                silent.as_millis(),
                timeout.as_millis()
            );
            session.stop().await;
            return Ok(false);
        }

        let wait = MaxWait::For(self.context.config.queue.write_timeout());
        match self.queue.enqueue(&event, wait).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!("queue full, bailing out (session_id={})", self.session_id);
                session.stop().await;
                Ok(false)
            }
            Err(CourierError::Cancelled) => {
                session.stop().await;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Deliver queued events to a client connection.
    ///
    /// Stream mode loops until the session stops; pull and poll deliver one
    /// batch and end with a refresh directive.
    pub async fn fetch_events(
        &self,
        adapter: &mut dyn ClientAdapter,
        response: &Event,
        refresh_url: &str,
    ) -> FetchOutcome {
        let Some(session) = self.session.upgrade() else {
            return FetchOutcome::Closed;
        };
        let _connection = Connection::open(&self.connections);
        let mode = self.mode();
        let read_timeout = match mode {
            Mode::Poll => Duration::ZERO,
            Mode::Stream | Mode::Pull => self.context.config.queue.read_timeout(),
        };

        let opened = match adapter.start().await {
            Ok(()) => adapter.push(response).await,
            Err(err) => Err(err),
        };
        if let Err(err) = opened {
            warn!(
                "failed to open client response (session_id={}, err={})",
                self.session_id, err
            );
            session.stop().await;
            return FetchOutcome::Closed;
        }
        if mode.is_refreshing() && response.event_type().ends_with(kinds::LISTEN_ACK) {
            return self.send_refresh(&session, adapter, refresh_url).await;
        }

        let mut seq: u64 = 1;
        let mut first = true;
        while self.is_active() {
            self.mark_alive();
            match session.kick().await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        "session record purged elsewhere, closing (session_id={})",
                        self.session_id
                    );
                    session.stop().await;
                    break;
                }
                Err(err) => warn!(
                    "failed to renew lease (session_id={}, err={})",
                    self.session_id, err
                ),
            }

            if mode == Mode::Stream && first {
                if let Err(err) = self.queue.enqueue(&Event::heartbeat(), MaxWait::NONE).await {
                    debug!(
                        "warm-up heartbeat not queued (session_id={}, err={})",
                        self.session_id, err
                    );
                }
            }
            first = false;

            let events = match self.queue.dequeue_all(MaxWait::For(read_timeout)).await {
                Ok(Some(events)) => events,
                Ok(None) => vec![Event::heartbeat()],
                Err(CourierError::Cancelled) => {
                    debug!("fetch interrupted (session_id={})", self.session_id);
                    session.stop().await;
                    break;
                }
                Err(err) => {
                    warn!(
                        "queue read failed (session_id={}, err={})",
                        self.session_id, err
                    );
                    vec![Event::heartbeat()]
                }
            };

            for mut event in events {
                if event.is_abort() {
                    warn!("aborting subscriber (session_id={})", self.session_id);
                    session.stop().await;
                }
                event.set_field(fields::SEQ, seq.to_string());
                seq += 1;
                if let Err(err) = adapter.push(&event).await {
                    warn!(
                        "push failed, stopping session (session_id={}, err={})",
                        self.session_id, err
                    );
                    session.stop().await;
                    return FetchOutcome::Closed;
                }
            }

            if mode.is_refreshing() {
                return self.send_refresh(&session, adapter, refresh_url).await;
            }
        }

        if let Err(err) = adapter.stop().await {
            debug!(
                "client close failed (session_id={}, err={})",
                self.session_id, err
            );
        }
        FetchOutcome::Closed
    }

    async fn send_refresh(
        &self,
        session: &Session,
        adapter: &mut dyn ClientAdapter,
        refresh_url: &str,
    ) -> FetchOutcome {
        let refresh = Event::new(kinds::REFRESH)
            .with_field(fields::WAIT, self.refresh_wait_millis().to_string())
            .with_field(fields::URL, refresh_url);
        let sent = match adapter.push(&refresh).await {
            Ok(()) => adapter.stop().await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(()) => FetchOutcome::Refreshed,
            Err(err) => {
                warn!(
                    "refresh failed, stopping session (session_id={}, err={})",
                    self.session_id, err
                );
                session.stop().await;
                FetchOutcome::Closed
            }
        }
    }
}
