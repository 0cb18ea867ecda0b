//! Node-wide handles shared by sessions and subscribers.

use crate::session::Session;
use courier_rs_config::CourierConfig;
use courier_rs_store::SharedStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Local session table keyed by session id.
pub(crate) type Registry = RwLock<HashMap<String, Arc<Session>>>;

pub(crate) struct NodeContext {
    pub(crate) config: Arc<CourierConfig>,
    pub(crate) store: Arc<dyn SharedStore>,
    pub(crate) node_id: String,
    /// Weak so sessions never keep the table alive.
    pub(crate) registry: Weak<Registry>,
}
