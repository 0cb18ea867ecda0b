//! Session registry, cluster-wide iteration, and the aging timer.

use crate::aging::AgingVisit;
use crate::context::{NodeContext, Registry};
use crate::error::CourierError;
use crate::ids;
use crate::keys;
use crate::session::Session;
use async_trait::async_trait;
use courier_rs_config::{ConfigError, CourierConfig};
use courier_rs_protocol::{Event, fields};
use courier_rs_store::{ScoredMember, SharedStore};
use futures_util::future::join_all;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[async_trait]
/// Operation applied to each session by [`SessionManager::apply`].
pub trait SessionVisit: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// When true, only sessions in the local table are visited.
    fn local_only(&self) -> bool {
        false
    }

    async fn visit(&self, session: &Arc<Session>) -> Result<(), CourierError>;
}

/// Counts from one [`SessionManager::apply`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisitReport {
    /// Local sessions visited successfully.
    pub local: usize,
    /// Sessions rebuilt from the store and visited successfully.
    pub remote: usize,
    /// Visits that returned an error.
    pub failed: usize,
}

struct AgingTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns this node's sessions and sees other nodes' sessions through the store.
pub struct SessionManager {
    context: Arc<NodeContext>,
    registry: Arc<Registry>,
    timer: Mutex<Option<AgingTimer>>,
}

impl SessionManager {
    /// Build a manager over `store`, rejecting configs that fail validation.
    pub fn new(
        config: CourierConfig,
        store: Arc<dyn SharedStore>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let registry: Arc<Registry> = Arc::new(RwLock::new(HashMap::new()));
        let node_id = config
            .cluster
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", ids::node_suffix()));
        let context = Arc::new(NodeContext {
            config: Arc::new(config),
            store,
            node_id,
            registry: Arc::downgrade(&registry),
        });
        info!(
            "session manager created (node_id={}, queue_backend={:?})",
            context.node_id, context.config.queue.backend
        );
        Ok(Arc::new(Self {
            context,
            registry,
            timer: Mutex::new(None),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.context.node_id
    }

    pub fn config(&self) -> &CourierConfig {
        &self.context.config
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.context.store
    }

    /// Start the aging timer, replacing any running one.
    pub fn start(self: &Arc<Self>) {
        let interval = self.context.config.cluster.aging_interval();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_aging(Arc::downgrade(self), interval, cancel.clone()));
        if let Some(previous) = self.timer.lock().replace(AgingTimer { cancel, handle }) {
            previous.cancel.cancel();
        }
        info!(
            "session manager started (node_id={}, interval_ms={})",
            self.node_id(),
            interval.as_millis()
        );
    }

    /// Cancel the aging timer and stop every local session.
    ///
    /// Connected clients get up to one read timeout to take what is still
    /// queued for them, so an abort queued by the dispatcher reaches them.
    pub async fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel.cancel();
            timer.handle.abort();
        }
        let sessions = self.sessions();
        let grace = self.context.config.queue.read_timeout();
        let drained = join_all(
            sessions
                .iter()
                .map(|session| session.subscriber().wait_drained(grace)),
        )
        .await;
        let pending = drained.iter().filter(|drained| !**drained).count();
        if pending > 0 {
            debug!(
                "closing sessions with undelivered events (node_id={}, sessions={})",
                self.node_id(),
                pending
            );
        }
        let stopped = join_all(sessions.iter().map(|session| session.stop())).await;
        self.registry.write().clear();
        info!(
            "session manager stopped (node_id={}, sessions={})",
            self.node_id(),
            stopped.len()
        );
    }

    /// Visit every local session, then every other session in the store.
    ///
    /// A failing visit is logged and skipped. Store failures during remote
    /// discovery end the remote phase for this pass.
    pub async fn apply(&self, visit: &dyn SessionVisit) -> VisitReport {
        let mut report = VisitReport::default();
        let local = self.sessions();
        let local_ids: HashSet<&str> = local.iter().map(|session| session.id()).collect();
        for session in &local {
            match visit.visit(session).await {
                Ok(()) => report.local += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        "visit failed (visit={}, session_id={}, err={})",
                        visit.name(),
                        session.id(),
                        err
                    );
                }
            }
        }
        if visit.local_only() {
            return report;
        }

        let page_size = self.context.config.cluster.page_size;
        let mut cursor: Option<ScoredMember> = None;
        loop {
            let page = match self
                .context
                .store
                .zrange_after(keys::ALL_SESSIONS, cursor.as_ref(), page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        "remote discovery unavailable (visit={}, err={})",
                        visit.name(),
                        err
                    );
                    break;
                }
            };
            for entry in &page {
                let id = entry.member.as_str();
                if local_ids.contains(id) || self.has_session(id) {
                    continue;
                }
                match self.reconstruct(id).await {
                    Ok(Some(session)) => match visit.visit(&session).await {
                        Ok(()) => report.remote += 1,
                        Err(err) => {
                            report.failed += 1;
                            warn!(
                                "visit failed (visit={}, session_id={}, err={})",
                                visit.name(),
                                id,
                                err
                            );
                        }
                    },
                    Ok(None) => self.prune_index(id).await,
                    Err(err) => {
                        report.failed += 1;
                        warn!("failed to rebuild session (session_id={}, err={})", id, err);
                    }
                }
            }
            match page.last() {
                Some(last) if page.len() == page_size => cursor = Some(last.clone()),
                _ => break,
            }
        }
        debug!(
            "apply finished (visit={}, local={}, remote={}, failed={})",
            visit.name(),
            report.local,
            report.remote,
            report.failed
        );
        report
    }

    async fn reconstruct(&self, id: &str) -> Result<Option<Arc<Session>>, CourierError> {
        let session = Session::load(&self.context, id).await?;
        if let Some(session) = &session {
            session.subscriber().start();
        }
        Ok(session)
    }

    async fn prune_index(&self, id: &str) {
        debug!("pruning stale session index entry (session_id={})", id);
        if let Err(err) = self.context.store.zrem(keys::ALL_SESSIONS, id).await {
            warn!("failed to prune session index (session_id={}, err={})", id, err);
        }
    }

    /// Create a session for a join request.
    ///
    /// Without a client id a fresh temporary session is created; with one,
    /// the stored session of that id is reattached and marked durable.
    pub async fn create_session(&self, event: &Event) -> Result<Arc<Session>, CourierError> {
        match event.field(fields::ID).filter(|id| !id.is_empty()) {
            Some(id) => {
                let session = Session::create(&self.context, id).await?;
                session.set_temporary(false).await?;
                Ok(session)
            }
            None => {
                let id = ids::generate(&self.context.config.session, |candidate| {
                    self.has_session(candidate)
                });
                Session::create(&self.context, &id).await
            }
        }
    }

    /// Find a session locally, or rebuild it from the store.
    pub async fn get_session(
        &self,
        can_register: bool,
        id: &str,
    ) -> Result<Option<Arc<Session>>, CourierError> {
        if let Some(session) = self.registry.read().get(id).cloned() {
            return Ok(Some(session));
        }
        let Some(session) = self.reconstruct(id).await? else {
            return Ok(None);
        };
        if !can_register {
            return Ok(Some(session));
        }
        let registered = {
            let mut sessions = self.registry.write();
            Arc::clone(
                sessions
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::clone(&session)),
            )
        };
        if Arc::ptr_eq(&registered, &session) {
            info!(
                "session added (session_id={}, address={})",
                id,
                session.address()
            );
        }
        Ok(Some(registered))
    }

    pub fn add_session(&self, session: Arc<Session>) {
        info!(
            "session added (session_id={}, address={})",
            session.id(),
            session.address()
        );
        self.registry
            .write()
            .insert(session.id().to_string(), session);
    }

    /// Remove a session from the local table. Removing an absent id is a no-op.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.registry.write().remove(id);
        if let Some(session) = &removed {
            info!(
                "session removed (session_id={}, address={})",
                id,
                session.address()
            );
        }
        removed
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.registry.read().contains_key(id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Snapshot of local sessions, ordered by id.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.registry.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Human-readable dump of local sessions.
    pub fn status(&self) -> String {
        let sessions = self.sessions();
        let mut out = format!(
            "SessionManager[{}]: {} sessions\n",
            self.node_id(),
            sessions.len()
        );
        for session in sessions {
            let _ = writeln!(out, "{session}");
        }
        out
    }

    /// Run one aging pass over all known sessions.
    pub async fn age_pass(&self, tick: Duration) -> VisitReport {
        self.age_pass_at(keys::now_millis(), tick).await
    }

    /// Run one aging pass as of `now_millis`.
    pub async fn age_pass_at(&self, now_millis: i64, tick: Duration) -> VisitReport {
        let cluster = &self.context.config.cluster;
        let visit = AgingVisit::new(
            Arc::clone(&self.context.store),
            &self.context.node_id,
            now_millis,
            tick,
            cluster.aging_lock_stale(),
        );
        self.apply(&visit).await
    }
}

async fn run_aging(manager: Weak<SessionManager>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_run = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                let now = Instant::now();
                let tick = now - last_run;
                last_run = now;
                debug!("aging tick (node_id={})", manager.node_id());
                manager.age_pass(tick).await;
            }
        }
    }
}
