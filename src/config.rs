//! Node configuration.
//!
//! The node reads a single JSON document describing itself, its listeners and
//! every member of the cluster:
//!
//! ```json
//! {
//!   "local_key": "a",
//!   "manager_bind": "127.0.0.1:7000",
//!   "worker_bind": "127.0.0.1:7001",
//!   "queue_dir": "/tmp/stream-cluster/a",
//!   "peers": [
//!     { "key": "a", "manager": "127.0.0.1:7000", "worker": "127.0.0.1:7001" },
//!     { "key": "b", "manager": "127.0.0.1:7100", "worker": "127.0.0.1:7101" }
//!   ]
//! }
//! ```
//!
//! The entry whose key equals `local_key` describes this node and is never
//! dialed; every other entry gets a manager + worker connection.

use crate::fabric::types::{ConnectionDescriptor, RetryPolicy};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tuning for the routing and affinity caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// How long a stage's capable-peer list stays valid.
    pub availability_ttl_ms: u64,
    /// Delay between `CAN_GET_STAGE` polls while no peer is capable.
    pub poll_interval_ms: u64,
    /// Give up polling (and fail the routing attempt) after this long.
    pub poll_ceiling_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            availability_ttl_ms: 10_000,
            poll_interval_ms: 1_000,
            poll_ceiling_ms: 60_000,
        }
    }
}

impl RoutingConfig {
    pub fn availability_ttl(&self) -> Duration {
        Duration::from_millis(self.availability_ttl_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_ceiling(&self) -> Duration {
        Duration::from_millis(self.poll_ceiling_ms)
    }
}

fn default_memory_limit() -> usize {
    1000
}

fn default_concurrency() -> usize {
    16
}

fn default_ask_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_ledger_retention_ms() -> u64 {
    600_000
}

/// Everything a node needs to join the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Key of this node inside `peers`.
    pub local_key: String,
    /// Address the manager (control-plane) listener binds to.
    pub manager_bind: String,
    /// Address the worker (data-plane) listener binds to.
    pub worker_bind: String,
    /// Directory holding backpressure queue segments.
    pub queue_dir: PathBuf,
    /// Entries kept in memory per queue before spilling to disk.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
    /// Ceiling of simultaneously running handlers per connection.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-ask timeout for broadcast asks; `None` waits forever.
    #[serde(default = "default_ask_timeout_ms")]
    pub ask_timeout_ms: Option<u64>,
    /// How long END records and idle sticky bindings are kept before the
    /// periodic sweep forgets them.
    #[serde(default = "default_ledger_retention_ms")]
    pub ledger_retention_ms: u64,
    /// Retry tuning used when binding the listeners.
    #[serde(default)]
    pub listen_retry: RetryPolicy,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Every cluster member, this node included.
    pub peers: Vec<ConnectionDescriptor>,
}

impl ClusterConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ClusterConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_key.is_empty() {
            anyhow::bail!("local_key must not be empty");
        }
        if self.memory_limit == 0 {
            anyhow::bail!("memory_limit must be at least 1");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.key.as_str()) {
                anyhow::bail!("duplicate peer key `{}`", peer.key);
            }
        }

        Ok(())
    }

    pub fn ask_timeout(&self) -> Option<Duration> {
        self.ask_timeout_ms.map(Duration::from_millis)
    }

    pub fn ledger_retention(&self) -> Duration {
        Duration::from_millis(self.ledger_retention_ms)
    }

    /// Descriptors of every member except this node.
    pub fn remote_peers(&self) -> impl Iterator<Item = &ConnectionDescriptor> {
        self.peers
            .iter()
            .filter(move |peer| peer.key != self.local_key)
    }

    /// Keys of every cluster member, the local node first.
    pub fn member_keys(&self) -> Vec<String> {
        let mut keys = vec![self.local_key.clone()];
        keys.extend(self.remote_peers().map(|peer| peer.key.clone()));
        keys
    }
}
