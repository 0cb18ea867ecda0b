//! Event routing to one, some, or all sessions.

use crate::error::CourierError;
use crate::keys;
use crate::manager::{SessionManager, SessionVisit, VisitReport};
use crate::session::Session;
use async_trait::async_trait;
use courier_rs_protocol::{Event, fields};
use courier_rs_store::ScoredMember;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Routes events to subscribers through the [`SessionManager`].
pub struct Dispatcher {
    manager: Arc<SessionManager>,
    running: AtomicBool,
}

struct BroadcastVisit {
    event: Event,
}

#[async_trait]
impl SessionVisit for BroadcastVisit {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    // Aborts only reach the connections this node serves.
    fn local_only(&self) -> bool {
        self.event.is_abort()
    }

    async fn visit(&self, session: &Arc<Session>) -> Result<(), CourierError> {
        session.subscriber().on_event(self.event.clone()).await?;
        Ok(())
    }
}

impl Dispatcher {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            running: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("dispatcher started (node_id={})", self.manager.node_id());
        }
    }

    /// Abort every locally served client.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let report = self.broadcast(&Event::abort()).await;
        info!(
            "dispatcher stopped (node_id={}, aborted={})",
            self.manager.node_id(),
            report.local
        );
    }

    /// Deliver a copy of `event` to every known session.
    pub async fn broadcast(&self, event: &Event) -> VisitReport {
        let visit = BroadcastVisit {
            event: event.clone(),
        };
        self.manager.apply(&visit).await
    }

    /// Deliver `event` to every session subscribed to its subject.
    ///
    /// Each copy is stamped with the recipient's subscription id and label.
    /// Returns the number of sessions that queued it.
    pub async fn multicast(&self, event: &Event) -> Result<usize, CourierError> {
        let Some(subject) = event.subject() else {
            warn!(
                "multicast without subject dropped (event={})",
                event.event_type()
            );
            return Ok(0);
        };
        let store = self.manager.store();
        let index = keys::subject_index(subject);
        let page_size = self.manager.config().cluster.page_size;
        let mut cursor: Option<ScoredMember> = None;
        let mut delivered = 0;
        loop {
            let page = store.zrange_after(&index, cursor.as_ref(), page_size).await?;
            for entry in &page {
                match self.deliver_matching(event, &entry.member).await {
                    Ok(true) => delivered += 1,
                    Ok(false) => {}
                    Err(err) => warn!(
                        "multicast delivery failed (subject={}, session_id={}, err={})",
                        subject, entry.member, err
                    ),
                }
            }
            match page.last() {
                Some(last) if page.len() == page_size => cursor = Some(last.clone()),
                _ => break,
            }
        }
        debug!(
            "multicast done (subject={}, delivered={})",
            subject, delivered
        );
        Ok(delivered)
    }

    async fn deliver_matching(&self, event: &Event, session_id: &str) -> Result<bool, CourierError> {
        let Some(session) = self.manager.get_session(false, session_id).await? else {
            self.prune_subject(event, session_id).await?;
            return Ok(false);
        };
        let subscriber = session.subscriber();
        let Some(subscription) = subscriber.match_event(event).await? else {
            return Ok(false);
        };
        let mut personal = event.clone();
        personal.set_field(fields::SUBSCRIPTION_ID, subscription.id());
        if let Some(label) = subscription.label() {
            personal.set_field(fields::SUBSCRIPTION_LABEL, label);
        }
        subscriber.on_event(personal).await
    }

    async fn prune_subject(&self, event: &Event, session_id: &str) -> Result<(), CourierError> {
        let Some(subject) = event.subject() else {
            return Ok(());
        };
        debug!(
            "pruning stale subject entry (subject={}, session_id={})",
            subject, session_id
        );
        let store = self.manager.store();
        store.hdel(&keys::subject(subject), session_id).await?;
        store.zrem(&keys::subject_index(subject), session_id).await?;
        Ok(())
    }

    /// Deliver `event` to one session.
    ///
    /// Returns `false` when the session is unknown or did not queue the event.
    pub async fn unicast(&self, event: &Event, session_id: &str) -> Result<bool, CourierError> {
        let Some(session) = self.manager.get_session(false, session_id).await? else {
            warn!(
                "unicast target not found, dropping (session_id={}, event={})",
                session_id,
                event.event_type()
            );
            return Ok(false);
        };
        session.subscriber().on_event(event.clone()).await
    }
}
