//! Client sessions and their shared-store mirror.

use crate::context::NodeContext;
use crate::error::CourierError;
use crate::keys;
use crate::subscriber::Subscriber;
use courier_rs_protocol::{Mode, WireFormat};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

const FIELD_ID: &str = "id";
const FIELD_ADDRESS: &str = "address";
const FIELD_USER_AGENT: &str = "user_agent";
const FIELD_FORMAT: &str = "format";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_TEMPORARY: &str = "temporary";
const FIELD_TTL: &str = "ttl";
const FIELD_AGED_AT: &str = "aged_at";

const UNKNOWN: &str = "unknown";

/// One logical client, owning exactly one [`Subscriber`].
///
/// Every mutation is mirrored to the session record so any node can rebuild
/// the session from the store.
pub struct Session {
    id: String,
    created_at: i64,
    lease_millis: i64,
    address: RwLock<String>,
    user_agent: RwLock<String>,
    format: RwLock<WireFormat>,
    temporary: AtomicBool,
    ttl_millis: AtomicI64,
    stopped: AtomicBool,
    subscriber: Subscriber,
    context: Arc<NodeContext>,
}

/// Last persisted aging state of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AgingState {
    pub(crate) ttl_millis: i64,
    pub(crate) aged_at: Option<i64>,
}

impl Session {
    /// Create a session, or reattach to the stored one with the same id, and persist it.
    pub(crate) async fn create(
        context: &Arc<NodeContext>,
        id: &str,
    ) -> Result<Arc<Self>, CourierError> {
        let record = context.store.hgetall(&keys::session(id)).await?;
        let session = Self::build(context, id, &record).await?;
        // A join always starts a fresh lease, even when reattaching.
        session
            .ttl_millis
            .store(session.lease_millis, Ordering::SeqCst);
        session.save_status().await?;
        context
            .store
            .zadd(keys::ALL_SESSIONS, id, session.created_at)
            .await?;
        debug!(
            "session created (session_id={}, reattached={})",
            id,
            !record.is_empty()
        );
        Ok(session)
    }

    /// Rebuild a session from its record without writing anything back.
    pub(crate) async fn load(
        context: &Arc<NodeContext>,
        id: &str,
    ) -> Result<Option<Arc<Self>>, CourierError> {
        let record = context.store.hgetall(&keys::session(id)).await?;
        if record.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::build(context, id, &record).await?))
    }

    async fn build(
        context: &Arc<NodeContext>,
        id: &str,
        record: &HashMap<String, String>,
    ) -> Result<Arc<Self>, CourierError> {
        let lease_millis = context.config.session.lease().as_millis() as i64;
        let mode = Subscriber::restore_mode(context, id).await?;
        let field = |name: &str| record.get(name).map(String::as_str);

        let format = match field(FIELD_FORMAT).map(str::parse::<WireFormat>) {
            Some(Ok(format)) => format,
            Some(Err(err)) => {
                warn!("ignoring stored format (session_id={}, err={})", id, err);
                WireFormat::default()
            }
            None => WireFormat::default(),
        };
        let created_at = field(FIELD_CREATED_AT)
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(keys::now_millis);
        let ttl = field(FIELD_TTL)
            .and_then(|value| value.parse().ok())
            .unwrap_or(lease_millis);
        let temporary = field(FIELD_TEMPORARY).is_none_or(|value| value != "false");

        Ok(Arc::new_cyclic(|weak| Self {
            id: id.to_string(),
            created_at,
            lease_millis,
            address: RwLock::new(field(FIELD_ADDRESS).unwrap_or(UNKNOWN).to_string()),
            user_agent: RwLock::new(field(FIELD_USER_AGENT).unwrap_or(UNKNOWN).to_string()),
            format: RwLock::new(format),
            temporary: AtomicBool::new(temporary),
            ttl_millis: AtomicI64::new(ttl),
            stopped: AtomicBool::new(false),
            subscriber: Subscriber::new(weak.clone(), id, mode, Arc::clone(context)),
            context: Arc::clone(context),
        }))
    }

    async fn save_status(&self) -> Result<(), CourierError> {
        let now = keys::now_millis();
        let fields = [
            (FIELD_ID, self.id.clone()),
            (FIELD_ADDRESS, self.address()),
            (FIELD_USER_AGENT, self.user_agent()),
            (FIELD_FORMAT, self.format().to_string()),
            (FIELD_CREATED_AT, self.created_at.to_string()),
            (FIELD_TEMPORARY, self.is_temporary().to_string()),
            (FIELD_TTL, self.ttl_millis().to_string()),
            (FIELD_AGED_AT, now.to_string()),
        ];
        for (name, value) in fields {
            self.mirror(name, &value).await?;
        }
        Ok(())
    }

    async fn mirror(&self, field: &str, value: &str) -> Result<(), CourierError> {
        self.context
            .store
            .hset(&keys::session(&self.id), field, value)
            .await?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time in milliseconds since the epoch.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.read().clone()
    }

    pub fn format(&self) -> WireFormat {
        *self.format.read()
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary.load(Ordering::SeqCst)
    }

    /// Remaining lease in milliseconds.
    pub fn ttl_millis(&self) -> i64 {
        self.ttl_millis.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.ttl_millis() <= 0
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub async fn set_address(&self, address: &str) -> Result<(), CourierError> {
        *self.address.write() = address.to_string();
        self.mirror(FIELD_ADDRESS, address).await
    }

    /// Store the user agent lowercased; empty values become `"unknown"`.
    pub async fn set_user_agent(&self, user_agent: Option<&str>) -> Result<(), CourierError> {
        let agent = match user_agent.map(str::trim) {
            Some(agent) if !agent.is_empty() => agent.to_lowercase(),
            _ => UNKNOWN.to_string(),
        };
        *self.user_agent.write() = agent.clone();
        self.mirror(FIELD_USER_AGENT, &agent).await
    }

    pub async fn set_format(&self, format: WireFormat) -> Result<(), CourierError> {
        *self.format.write() = format;
        self.mirror(FIELD_FORMAT, format.as_str()).await
    }

    pub async fn set_temporary(&self, temporary: bool) -> Result<(), CourierError> {
        self.temporary.store(temporary, Ordering::SeqCst);
        self.mirror(FIELD_TEMPORARY, &temporary.to_string()).await
    }

    /// Pick the delivery mode for a listen request and persist it.
    pub async fn negotiate_mode(&self, requested: Option<Mode>) -> Result<Mode, CourierError> {
        let mode = if self.context.config.listen.forces_pull(&self.user_agent()) {
            Mode::Pull
        } else {
            requested.unwrap_or_default()
        };
        self.subscriber.set_mode(mode).await?;
        Ok(mode)
    }

    /// Decrease the lease by `elapsed`.
    pub async fn age(&self, elapsed: Duration) -> Result<(), CourierError> {
        self.age_at(elapsed.as_millis() as i64, keys::now_millis())
            .await
    }

    pub(crate) async fn age_at(&self, delta_millis: i64, now: i64) -> Result<(), CourierError> {
        let delta = delta_millis.max(0);
        let decrease = |ttl: i64| ttl.saturating_sub(delta).max(0);
        let ttl = match self
            .ttl_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ttl| Some(decrease(ttl)))
        {
            Ok(previous) | Err(previous) => decrease(previous),
        };
        debug!(
            "session aged (session_id={}, delta_ms={}, ttl_ms={})",
            self.id, delta, ttl
        );
        self.mirror(FIELD_TTL, &ttl.to_string()).await?;
        self.mirror(FIELD_AGED_AT, &now.to_string()).await
    }

    /// Restore the full lease. Returns `false` when the record was purged elsewhere.
    pub async fn kick(&self) -> Result<bool, CourierError> {
        if !self.context.store.exists(&keys::session(&self.id)).await? {
            return Ok(false);
        }
        self.ttl_millis.store(self.lease_millis, Ordering::SeqCst);
        self.mirror(FIELD_TTL, &self.lease_millis.to_string())
            .await?;
        self.mirror(FIELD_AGED_AT, &keys::now_millis().to_string())
            .await?;
        Ok(true)
    }

    /// Reload lease state from the record; `None` when the record is gone.
    pub(crate) async fn refresh_from_store(&self) -> Result<Option<AgingState>, CourierError> {
        let record = self
            .context
            .store
            .hgetall(&keys::session(&self.id))
            .await?;
        if !record.contains_key(FIELD_ID) {
            return Ok(None);
        }
        let ttl_millis = record
            .get(FIELD_TTL)
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| self.ttl_millis());
        self.ttl_millis.store(ttl_millis, Ordering::SeqCst);
        Ok(Some(AgingState {
            ttl_millis,
            aged_at: record
                .get(FIELD_AGED_AT)
                .and_then(|value| value.parse().ok()),
        }))
    }

    /// True when this exact instance is in the local table.
    pub fn is_registered(&self) -> bool {
        self.context.registry.upgrade().is_some_and(|registry| {
            registry
                .read()
                .get(&self.id)
                .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), self))
        })
    }

    /// End the session. Only the first call has effects; returns whether it ran.
    ///
    /// Temporary sessions are purged from the store; durable ones keep their
    /// record with a zero lease so a later join can reattach.
    pub async fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.ttl_millis.store(0, Ordering::SeqCst);
        let temporary = self.is_temporary();
        if let Err(err) = self.purge(temporary).await {
            warn!(
                "failed to update stopped session record (session_id={}, err={})",
                self.id, err
            );
        }
        self.subscriber.stop(temporary).await;

        if let Some(registry) = self.context.registry.upgrade() {
            let mut sessions = registry.write();
            let owned = sessions
                .get(&self.id)
                .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), self));
            if owned {
                sessions.remove(&self.id);
                info!(
                    "session removed (session_id={}, address={})",
                    self.id,
                    self.address()
                );
            }
        }
        debug!(
            "session stopped (session_id={}, temporary={})",
            self.id, temporary
        );
        true
    }

    async fn purge(&self, temporary: bool) -> Result<(), CourierError> {
        let key = keys::session(&self.id);
        if temporary {
            self.context.store.delete(&key).await?;
            self.context
                .store
                .zrem(keys::ALL_SESSIONS, &self.id)
                .await?;
        } else if self.context.store.exists(&key).await? {
            self.mirror(FIELD_TTL, "0").await?;
        }
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session [id={}, address={}, format={}, mode={}, ttl_ms={}, created_at={}, temporary={}]",
            self.id,
            self.address(),
            self.format(),
            self.subscriber.mode(),
            self.ttl_millis(),
            self.created_at,
            self.is_temporary()
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
