//! Configuration schema for courier nodes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root config for a courier node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default = "RefreshConfig::pull_defaults")]
    pub pull: RefreshConfig,
    #[serde(default = "RefreshConfig::poll_defaults")]
    pub poll: RefreshConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            schema: None,
            session: SessionConfig::default(),
            queue: QueueConfig::default(),
            listen: ListenConfig::default(),
            pull: RefreshConfig::pull_defaults(),
            poll: RefreshConfig::poll_defaults(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl CourierConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> CourierConfigBuilder {
        CourierConfigBuilder::new()
    }
}

/// Builder for assembling a `CourierConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct CourierConfigBuilder {
    config: CourierConfig,
}

impl CourierConfigBuilder {
    /// Create a new builder seeded with default config values.
    pub fn new() -> Self {
        Self {
            config: CourierConfig::default(),
        }
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    pub fn listen(mut self, listen: ListenConfig) -> Self {
        self.config.listen = listen;
        self
    }

    pub fn pull(mut self, pull: RefreshConfig) -> Self {
        self.config.pull = pull;
        self
    }

    pub fn poll(mut self, poll: RefreshConfig) -> Self {
        self.config.poll = poll;
        self
    }

    pub fn cluster(mut self, cluster: ClusterConfig) -> Self {
        self.config.cluster = cluster;
        self
    }

    /// Set the node identifier used in aging locks.
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.config.cluster.node_id = Some(node_id.into());
        self
    }

    /// Finalize the builder into a config.
    pub fn build(self) -> CourierConfig {
        self.config
    }
}

/// Session lease and identifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lease length restored on every keep-alive.
    #[serde(default = "default_timeout_mins")]
    pub timeout_mins: u64,
    /// Length of generated random-string ids.
    #[serde(default = "default_id_size")]
    pub id_size: usize,
    #[serde(default)]
    pub id_generation: IdGeneration,
}

impl SessionConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.timeout_mins.saturating_mul(60))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_mins: default_timeout_mins(),
            id_size: default_id_size(),
            id_generation: IdGeneration::default(),
        }
    }
}

fn default_timeout_mins() -> u64 {
    5
}

fn default_id_size() -> usize {
    10
}

/// Strategy for server-assigned session ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdGeneration {
    /// Pronounceable alternating consonant/vowel string.
    #[default]
    Randomstring,
    /// Random v4 UUID.
    Uuid,
}

/// Per-subscriber queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Capacity of each subscriber queue.
    #[serde(default = "default_queue_size")]
    pub size: usize,
    /// How long a stream drain waits for the first event.
    #[serde(default = "default_read_timeout_millis")]
    pub read_timeout_millis: u64,
    /// How long `on_event` waits for room before disconnecting the subscriber.
    #[serde(default = "default_write_timeout_millis")]
    pub write_timeout_millis: u64,
    /// Interval between re-checks while waiting on a full or empty queue.
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default)]
    pub backend: QueueBackend,
}

impl QueueConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_millis)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            size: default_queue_size(),
            read_timeout_millis: default_read_timeout_millis(),
            write_timeout_millis: default_write_timeout_millis(),
            poll_interval_millis: default_poll_interval_millis(),
            backend: QueueBackend::default(),
        }
    }
}

fn default_queue_size() -> usize {
    24
}

fn default_read_timeout_millis() -> u64 {
    20_000
}

fn default_write_timeout_millis() -> u64 {
    20
}

fn default_poll_interval_millis() -> u64 {
    200
}

/// Where queued events live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Shared-store list, visible to every node.
    #[default]
    Store,
    /// Process-local ring buffer, single-node only.
    Memory,
}

/// Rules forcing pull mode for clients that cannot hold a stream open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default)]
    pub force_pull_all: bool,
    /// Lowercase user-agent fragments that force pull mode.
    #[serde(default = "default_force_pull_agents")]
    pub force_pull_agents: Vec<String>,
}

impl ListenConfig {
    /// True when a client with this user agent must use pull mode.
    pub fn forces_pull(&self, user_agent: &str) -> bool {
        if self.force_pull_all {
            return true;
        }
        let agent = user_agent.to_lowercase();
        self.force_pull_agents
            .iter()
            .any(|fragment| !fragment.is_empty() && agent.contains(&fragment.to_lowercase()))
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            force_pull_all: false,
            force_pull_agents: default_force_pull_agents(),
        }
    }
}

fn default_force_pull_agents() -> Vec<String> {
    vec!["safari".to_string()]
}

/// Liveness and refresh-hint settings for one of the refreshing modes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Max silence before a subscriber is treated as disconnected.
    pub refresh_timeout_millis: u64,
    pub wait_min_millis: u64,
    pub wait_max_millis: u64,
}

impl RefreshConfig {
    pub fn pull_defaults() -> Self {
        Self {
            refresh_timeout_millis: 45_000,
            wait_min_millis: 2_000,
            wait_max_millis: 6_000,
        }
    }

    pub fn poll_defaults() -> Self {
        Self {
            refresh_timeout_millis: 60_000,
            wait_min_millis: 6_000,
            wait_max_millis: 10_000,
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_millis)
    }
}

/// Cluster coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identifier written into aging locks; generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_aging_interval_millis")]
    pub aging_interval_millis: u64,
    /// Age after which another node's aging lock is considered abandoned.
    #[serde(default)]
    pub aging_lock_stale_millis: Option<u64>,
    /// Ids fetched per store round-trip when paging session indexes.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl ClusterConfig {
    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_millis)
    }

    /// Stale window for aging locks, defaulting to the aging interval.
    pub fn aging_lock_stale(&self) -> Duration {
        Duration::from_millis(
            self.aging_lock_stale_millis
                .unwrap_or(self.aging_interval_millis),
        )
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            aging_interval_millis: default_aging_interval_millis(),
            aging_lock_stale_millis: None,
            page_size: default_page_size(),
        }
    }
}

fn default_aging_interval_millis() -> u64 {
    60_000
}

fn default_page_size() -> usize {
    100
}
