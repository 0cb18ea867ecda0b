//! Lease aging with a cross-node advisory lock.
//!
//! Before aging a session a node writes `node@millis` into the record's
//! aging field with a set-if-absent. A lock younger than the stale window
//! means another node is aging that session and it is skipped; an older one
//! is taken over. The lease is decremented by wall-clock time since the
//! record's `aged_at`, so sequential visits by several nodes in one interval
//! never count the same time twice. A session aged less than half a tick ago
//! is left alone until a later pass.

use crate::error::CourierError;
use crate::keys;
use crate::manager::SessionVisit;
use crate::session::Session;
use async_trait::async_trait;
use courier_rs_store::SharedStore;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct AgingVisit {
    store: Arc<dyn SharedStore>,
    node_id: String,
    now_millis: i64,
    tick_millis: i64,
    stale_millis: i64,
}

impl AgingVisit {
    pub(crate) fn new(
        store: Arc<dyn SharedStore>,
        node_id: &str,
        now_millis: i64,
        tick: Duration,
        stale: Duration,
    ) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            now_millis,
            tick_millis: tick.as_millis() as i64,
            stale_millis: stale.as_millis() as i64,
        }
    }

    fn stamp(&self) -> String {
        format!("{}@{}", self.node_id, self.now_millis)
    }

    /// Take the aging lock for a session record.
    async fn acquire(&self, key: &str) -> Result<bool, CourierError> {
        let stamp = self.stamp();
        if self
            .store
            .hset_nx(key, keys::AGING_LOCK_FIELD, &stamp)
            .await?
        {
            return Ok(true);
        }
        let holder = self.store.hget(key, keys::AGING_LOCK_FIELD).await?;
        if let Some(locked_at) = holder.as_deref().and_then(lock_time)
            && self.now_millis - locked_at < self.stale_millis
        {
            debug!(
                "aging lock held elsewhere (key={}, holder={})",
                key,
                holder.as_deref().unwrap_or("")
            );
            return Ok(false);
        }
        warn!(
            "taking over stale aging lock (key={}, holder={})",
            key,
            holder.as_deref().unwrap_or("")
        );
        self.store
            .hset(key, keys::AGING_LOCK_FIELD, &stamp)
            .await?;
        let current = self.store.hget(key, keys::AGING_LOCK_FIELD).await?;
        Ok(current.as_deref() == Some(stamp.as_str()))
    }

    async fn release(&self, key: &str) {
        let stamp = self.stamp();
        match self.store.hget(key, keys::AGING_LOCK_FIELD).await {
            Ok(Some(holder)) if holder == stamp => {
                if let Err(err) = self.store.hdel(key, keys::AGING_LOCK_FIELD).await {
                    warn!("failed to release aging lock (key={}, err={})", key, err);
                }
            }
            Ok(_) => {}
            Err(err) => warn!("failed to read aging lock (key={}, err={})", key, err),
        }
    }

    async fn age(&self, session: &Arc<Session>) -> Result<(), CourierError> {
        let Some(state) = session.refresh_from_store().await? else {
            session.stop().await;
            return Ok(());
        };
        let registered = session.is_registered();
        if state.ttl_millis <= 0 && !registered {
            return Ok(());
        }
        let delta = match state.aged_at {
            Some(aged_at) => self.now_millis - aged_at,
            None => self.tick_millis,
        };
        // Another node aged it this interval; the next pass picks up the gap.
        if state.ttl_millis > 0 && delta < self.tick_millis / 2 {
            debug!(
                "session aged recently, skipping (session_id={}, delta_ms={})",
                session.id(),
                delta
            );
            return Ok(());
        }
        session.age_at(delta, self.now_millis).await?;
        if session.is_expired() {
            if registered {
                info!("session expired (session_id={})", session.id());
            }
            session.stop().await;
        }
        Ok(())
    }
}

/// Parse the timestamp out of a `node@millis` lock value.
fn lock_time(value: &str) -> Option<i64> {
    value.rsplit_once('@')?.1.parse().ok()
}

#[async_trait]
impl SessionVisit for AgingVisit {
    fn name(&self) -> &'static str {
        "aging"
    }

    async fn visit(&self, session: &Arc<Session>) -> Result<(), CourierError> {
        let key = keys::session(session.id());
        if !self.store.exists(&key).await? {
            debug!(
                "session record gone, stopping (session_id={})",
                session.id()
            );
            session.stop().await;
            return Ok(());
        }
        if !self.acquire(&key).await? {
            return Ok(());
        }
        let result = self.age(session).await;
        self.release(&key).await;
        result
    }
}
