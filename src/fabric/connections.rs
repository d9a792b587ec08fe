use super::client::{ManagerChannel, PeerConnection, WorkerChannel};
use super::types::{ConnectionDescriptor, ConnectionState};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// A peer whose manager and worker channels are both up.
#[derive(Clone)]
pub struct LiveConnection {
    pub key: String,
    pub manager: ManagerChannel,
    pub worker: WorkerChannel,
}

/// The aggregate connection set of a node.
///
/// Holds one `PeerConnection` per remote key and republishes the list of live
/// peers whenever any channel changes state.
pub struct Fabric {
    local_key: String,
    peers: DashMap<String, Arc<PeerConnection>>,
    live: watch::Sender<Arc<Vec<LiveConnection>>>,
}

impl Fabric {
    pub fn new(local_key: impl Into<String>) -> Arc<Self> {
        let (live, _) = watch::channel(Arc::new(Vec::new()));
        Arc::new(Self {
            local_key: local_key.into(),
            peers: DashMap::new(),
            live,
        })
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    /// Starts (or returns the existing) connection for `descriptor.key`.
    /// Connecting to the same key twice is a no-op.
    pub fn connect(self: &Arc<Self>, descriptor: ConnectionDescriptor) -> Arc<PeerConnection> {
        let (peer, created) = match self.peers.entry(descriptor.key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let peer = Arc::new(PeerConnection::connect(descriptor));
                entry.insert(peer.clone());
                (peer, true)
            }
        };

        if created {
            spawn_state_watcher(Arc::downgrade(self), &peer);
            self.recompute();
        }
        peer
    }

    pub fn peer(&self, key: &str) -> Option<Arc<PeerConnection>> {
        self.peers.get(key).map(|entry| entry.value().clone())
    }

    /// Keys of every dialed peer, connected or not, sorted.
    pub fn peer_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Current live set.
    pub fn connections(&self) -> Arc<Vec<LiveConnection>> {
        self.live.borrow().clone()
    }

    /// Receiver that observes every republished live set.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<LiveConnection>>> {
        self.live.subscribe()
    }

    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        let mut states: Vec<(String, ConnectionState)> = self
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    fn recompute(&self) {
        let mut live: Vec<LiveConnection> = self
            .peers
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Connected)
            .map(|entry| LiveConnection {
                key: entry.key().clone(),
                manager: entry.value().manager.clone(),
                worker: entry.value().worker.clone(),
            })
            .collect();
        live.sort_by(|a, b| a.key.cmp(&b.key));

        let changed = {
            let current = self.live.borrow();
            current.len() != live.len()
                || current.iter().zip(&live).any(|(a, b)| a.key != b.key)
        };
        if changed {
            tracing::info!(
                "Live connections: [{}]",
                live.iter().map(|c| c.key.as_str()).collect::<Vec<_>>().join(", ")
            );
            self.live.send_replace(Arc::new(live));
        }
    }
}

fn spawn_state_watcher(fabric: Weak<Fabric>, peer: &PeerConnection) {
    let mut manager = peer.manager.watch_state();
    let mut worker = peer.worker.watch_state();

    tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                r = manager.changed() => r,
                r = worker.changed() => r,
            };
            if result.is_err() {
                break;
            }
            match fabric.upgrade() {
                Some(fabric) => fabric.recompute(),
                None => break,
            }
        }
    });
}
