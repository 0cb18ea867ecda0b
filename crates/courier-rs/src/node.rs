use courier_rs_config::{ConfigError, CourierConfig};
use courier_rs_core::{Dispatcher, SessionManager};
use courier_rs_store::{MemoryStore, SharedStore};
use log::info;
use std::path::Path;
use std::sync::Arc;

/// One courier node: a session manager and its dispatcher over a shared store.
///
/// Nodes that should cooperate must be given the same store.
pub struct Node {
    manager: Arc<SessionManager>,
    dispatcher: Dispatcher,
}

impl Node {
    /// Wire a node over `store`; fails when `config` does not validate.
    pub fn new(config: CourierConfig, store: Arc<dyn SharedStore>) -> Result<Self, ConfigError> {
        let manager = SessionManager::new(config, store)?;
        let dispatcher = Dispatcher::new(Arc::clone(&manager));
        Ok(Self {
            manager,
            dispatcher,
        })
    }

    /// Single-node setup backed by a private [`MemoryStore`].
    pub fn in_memory(config: CourierConfig) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// Build a node from a JSON5 config file.
    pub fn from_config_path(
        path: impl AsRef<Path>,
        store: Arc<dyn SharedStore>,
    ) -> Result<Self, ConfigError> {
        let config = CourierConfig::load_from_path(path)?;
        Self::new(config, store)
    }

    pub fn node_id(&self) -> &str {
        self.manager.node_id()
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Start the aging timer and accept dispatches. Requires a tokio runtime.
    pub fn start(&self) {
        self.manager.start();
        self.dispatcher.start();
        info!("node started (node_id={})", self.node_id());
    }

    /// Abort local clients, let them drain, then stop every local session.
    pub async fn stop(&self) {
        self.dispatcher.stop().await;
        self.manager.stop().await;
        info!("node stopped (node_id={})", self.node_id());
    }
}
