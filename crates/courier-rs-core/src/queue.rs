//! Bounded per-session event queue.
//!
//! Waits are polling loops (check, sleep one poll interval, re-check) so the
//! same code works over a shared store without native blocking pops. Every
//! sleep races the owning connection's cancellation token.

use crate::error::CourierError;
use async_trait::async_trait;
use courier_rs_protocol::Event;
use courier_rs_store::SharedStore;
use log::warn;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long a queue operation may wait for room or for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxWait {
    /// Wait until the condition holds or the queue is cancelled.
    Indefinitely,
    /// Give up after the duration; `Duration::ZERO` checks exactly once.
    For(Duration),
}

impl MaxWait {
    pub const NONE: MaxWait = MaxWait::For(Duration::ZERO);

    fn deadline(self) -> Option<Instant> {
        match self {
            MaxWait::Indefinitely => None,
            MaxWait::For(wait) => Some(Instant::now() + wait),
        }
    }
}

#[async_trait]
/// Persistence behind an [`EventQueue`]. Each call must be atomic.
pub trait QueueStorage: Send + Sync {
    /// Append unless `capacity` events are already queued.
    async fn push(&self, event: &Event, capacity: usize) -> Result<bool, CourierError>;

    async fn pop(&self) -> Result<Option<Event>, CourierError>;

    async fn len(&self) -> Result<usize, CourierError>;

    async fn clear(&self) -> Result<(), CourierError>;
}

/// Process-local ring buffer; only visible to this node.
#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    events: Mutex<VecDeque<Event>>,
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn push(&self, event: &Event, capacity: usize) -> Result<bool, CourierError> {
        let mut events = self.events.lock();
        if events.len() >= capacity {
            return Ok(false);
        }
        events.push_back(event.clone());
        Ok(true)
    }

    async fn pop(&self) -> Result<Option<Event>, CourierError> {
        Ok(self.events.lock().pop_front())
    }

    async fn len(&self) -> Result<usize, CourierError> {
        Ok(self.events.lock().len())
    }

    async fn clear(&self) -> Result<(), CourierError> {
        self.events.lock().clear();
        Ok(())
    }
}

/// Shared-store list of JSON-encoded events, visible to every node.
pub struct StoreQueueStorage {
    store: Arc<dyn SharedStore>,
    key: String,
}

impl StoreQueueStorage {
    pub fn new(store: Arc<dyn SharedStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl QueueStorage for StoreQueueStorage {
    async fn push(&self, event: &Event, capacity: usize) -> Result<bool, CourierError> {
        let encoded = serde_json::to_string(event)?;
        Ok(self
            .store
            .rpush_bounded(&self.key, &encoded, capacity)
            .await?)
    }

    async fn pop(&self) -> Result<Option<Event>, CourierError> {
        while let Some(raw) = self.store.lpop(&self.key).await? {
            match serde_json::from_str::<Event>(&raw) {
                Ok(event) => return Ok(Some(event)),
                Err(err) => warn!("dropping undecodable queued event (key={}, err={})", self.key, err),
            }
        }
        Ok(None)
    }

    async fn len(&self) -> Result<usize, CourierError> {
        Ok(self.store.llen(&self.key).await?)
    }

    async fn clear(&self) -> Result<(), CourierError> {
        self.store.delete(&self.key).await?;
        Ok(())
    }
}

/// FIFO of events for one session, never holding more than `capacity`.
pub struct EventQueue {
    id: String,
    capacity: usize,
    poll_interval: Duration,
    storage: Arc<dyn QueueStorage>,
    cancel: CancellationToken,
}

impl EventQueue {
    pub fn new(
        id: impl Into<String>,
        capacity: usize,
        poll_interval: Duration,
        storage: Arc<dyn QueueStorage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            capacity,
            poll_interval,
            storage,
            cancel,
        }
    }

    /// Queue backed by a private ring buffer with its own cancellation token.
    pub fn in_memory(id: impl Into<String>, capacity: usize, poll_interval: Duration) -> Self {
        Self::new(
            id,
            capacity,
            poll_interval,
            Arc::new(MemoryQueueStorage::default()),
            CancellationToken::new(),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Token whose cancellation interrupts every pending wait.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Append an event, waiting up to `wait` for room.
    ///
    /// Returns `Ok(false)` when the queue is still full after the wait.
    pub async fn enqueue(&self, event: &Event, wait: MaxWait) -> Result<bool, CourierError> {
        let deadline = wait.deadline();
        loop {
            if self.storage.push(event, self.capacity).await? {
                return Ok(true);
            }
            if !self.pause(deadline).await? {
                return Ok(false);
            }
        }
    }

    /// Remove the oldest event, waiting up to `wait` for one to arrive.
    pub async fn dequeue(&self, wait: MaxWait) -> Result<Option<Event>, CourierError> {
        let deadline = wait.deadline();
        loop {
            if let Some(event) = self.storage.pop().await? {
                return Ok(Some(event));
            }
            if !self.pause(deadline).await? {
                return Ok(None);
            }
        }
    }

    /// Drain every queued event in FIFO order, waiting up to `wait` for the first.
    pub async fn dequeue_all(&self, wait: MaxWait) -> Result<Option<Vec<Event>>, CourierError> {
        let deadline = wait.deadline();
        loop {
            let drained = self.drain().await?;
            if !drained.is_empty() {
                return Ok(Some(drained));
            }
            if !self.pause(deadline).await? {
                return Ok(None);
            }
        }
    }

    pub async fn size(&self) -> Result<usize, CourierError> {
        self.storage.len().await
    }

    pub async fn clear(&self) -> Result<(), CourierError> {
        self.storage.clear().await
    }

    /// Pop up to one capacity's worth; a failure after the first pop keeps what was taken.
    async fn drain(&self) -> Result<Vec<Event>, CourierError> {
        let mut drained = Vec::new();
        while drained.len() < self.capacity {
            match self.storage.pop().await {
                Ok(Some(event)) => drained.push(event),
                Ok(None) => break,
                Err(err) if drained.is_empty() => return Err(err),
                Err(err) => {
                    warn!("partial drain (queue_id={}, err={})", self.id, err);
                    break;
                }
            }
        }
        Ok(drained)
    }

    /// Sleep one poll interval; `Ok(false)` once the deadline has passed.
    async fn pause(&self, deadline: Option<Instant>) -> Result<bool, CourierError> {
        let nap = match deadline {
            None => self.poll_interval,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                self.poll_interval.min(deadline - now)
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CourierError::Cancelled),
            _ = tokio::time::sleep(nap) => Ok(true),
        }
    }
}
