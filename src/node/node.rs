use super::handlers;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::fabric::protocol::{
    GroupQuery, Notice, NullAchieved, Question, StageQuery, UnitQuery, WorkerEnvelope,
};
use crate::fabric::server::drain_queue;
use crate::fabric::{Fabric, Listener, Responder, Role};
use crate::ids::unit_hash;
use crate::queue::SpillQueue;
use crate::routing::{ClusterLink, Router};
use crate::stage::{Outbox, StageRegistry, StageRuntime};
use crate::termination::{GroupStore, TerminationDetector};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// One member of the cluster.
pub struct Node {
    pub(crate) config: ClusterConfig,
    fabric: Arc<Fabric>,
    registry: Arc<StageRegistry>,
    groups: Arc<GroupStore>,
    router: Router,
    runtime: StageRuntime,
    detector: TerminationDetector,
    /// Units this node routes to itself skip the socket and land here.
    inbox: Arc<SpillQueue>,
    /// root group → completion signal of sessions submitted here
    pub(crate) sessions: DashMap<String, watch::Sender<bool>>,
    me: Weak<Node>,
}

impl Node {
    /// Builds a node without touching the network.
    pub fn new(config: ClusterConfig, registry: Arc<StageRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Node>| {
            let groups = GroupStore::new();
            let outbox: Weak<dyn Outbox> = me.clone();
            Self {
                fabric: Fabric::new(config.local_key.clone()),
                router: Router::new(config.routing.clone()),
                runtime: StageRuntime::new(registry.clone(), groups.clone(), outbox),
                detector: TerminationDetector::new(groups.clone()),
                inbox: Arc::new(SpillQueue::new(
                    config.queue_dir.join("inbox"),
                    config.memory_limit,
                )),
                sessions: DashMap::new(),
                groups,
                registry,
                config,
                me: me.clone(),
            }
        })
    }

    /// Builds a node, binds its listeners and dials every other member.
    pub async fn start(config: ClusterConfig, registry: Arc<StageRegistry>) -> Result<Arc<Self>> {
        let node = Self::new(config, registry);
        node.serve().await?;
        Ok(node)
    }

    async fn serve(self: &Arc<Self>) -> Result<()> {
        let manager = self.listener(Role::Manager, &self.config.manager_bind);
        let worker = self.listener(Role::Worker, &self.config.worker_bind);
        let manager_socket = manager.bind().await?;
        let worker_socket = worker.bind().await?;
        self.inbox.init_cache().await?;

        let me = Arc::downgrade(self);
        tokio::spawn(manager.accept_loop(manager_socket, handlers::manager_hooks(me.clone())));
        tokio::spawn(worker.accept_loop(worker_socket, handlers::worker_hooks(me.clone())));
        tokio::spawn(drain_queue(
            self.inbox.clone(),
            handlers::worker_hooks(me),
            self.config.concurrency,
            Responder::detached(),
        ));

        for descriptor in self.config.remote_peers() {
            self.fabric.connect(descriptor.clone());
        }
        tokio::spawn(sweep_loop(Arc::downgrade(self), self.config.ledger_retention()));

        tracing::info!(
            "Node {} up (manager {}, worker {}) with stages {:?}",
            self.config.local_key,
            self.config.manager_bind,
            self.config.worker_bind,
            self.registry.stage_names()
        );
        Ok(())
    }

    fn listener(&self, role: Role, bind: &str) -> Listener {
        Listener {
            role,
            bind: bind.to_string(),
            retry: self.config.listen_retry.clone(),
            queue_dir: self.config.queue_dir.clone(),
            memory_limit: self.config.memory_limit,
            concurrency: self.config.concurrency,
        }
    }

    pub fn local_key(&self) -> &str {
        &self.config.local_key
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        &self.groups
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Logs a one-line snapshot of connections and live work.
    pub fn log_stats(&self) {
        let live: Vec<String> = self.fabric.connections().iter().map(|c| c.key.clone()).collect();
        tracing::info!(
            "Node {}: live peers {:?}, open groups {}, sticky bindings {}, inbox backlog {}",
            self.config.local_key,
            live,
            self.groups.live_groups(),
            self.router.sticky().len(),
            self.inbox.len()
        );
    }

    /// Forgets END records and sticky bindings older than `retention`.
    pub fn sweep_ledgers(&self, retention: Duration) {
        let ended = self.detector.evict_ended(retention);
        let bindings = self.router.sticky().evict_idle(retention);
        if ended + bindings > 0 {
            tracing::debug!(
                "Node {} forgot {} ended group(s) and {} idle binding(s)",
                self.config.local_key,
                ended,
                bindings
            );
        }
    }

    /// Runs one inbound unit and, when it drained a group whose total is
    /// known, checks for termination in the background.
    pub(crate) async fn process(self: Arc<Self>, envelope: WorkerEnvelope) -> Result<()> {
        let processed = self.runtime.handle(envelope).await;

        let total_known = self
            .groups
            .get(&processed.group)
            .and_then(|state| state.total())
            .is_some();
        if processed.drained && total_known {
            let node = self.clone();
            let group = processed.group.clone();
            tokio::spawn(async move {
                if let Err(e) = node.detector.check(node.as_ref(), &group).await {
                    tracing::warn!("Termination check of {} failed: {}", group, e);
                }
            });
        }

        processed.outcome
    }

    /// Answers one control-plane question from local state.
    pub(crate) async fn answer(&self, question: Question, data: Value) -> Result<Value> {
        match question {
            Question::GetStageServer => {
                let query: StageQuery = serde_json::from_value(data)?;
                if self.registry.has_stage(&query.stage) {
                    Ok(json!(self.config.local_key))
                } else {
                    Ok(Value::Null)
                }
            }
            Question::CanGetStage => {
                let query: StageQuery = serde_json::from_value(data)?;
                Ok(json!(self.registry.has_stage(&query.stage)))
            }
            Question::GetSessionStageKeyServer => {
                let query: UnitQuery = serde_json::from_value(data)?;
                let unit = unit_hash(&query.session, &query.stage, query.key.as_deref());
                if self.groups.owns_unit(&unit) {
                    return Ok(json!(self.config.local_key));
                }
                Ok(self.router.sticky().peek(&unit).map(Value::String).unwrap_or(Value::Null))
            }
            Question::CountProcessed => {
                let query: GroupQuery = serde_json::from_value(data)?;
                Ok(json!(self.groups.processed(&query.group)))
            }
            Question::EndProcessing => {
                let query: GroupQuery = serde_json::from_value(data)?;
                let summary = self.detector.end_group(&query.group).await?;
                if let Some((_, done)) = self.sessions.remove(&query.group) {
                    tracing::info!(
                        "Session with root group {} finished after {} units here",
                        query.group,
                        summary.processed
                    );
                    done.send_replace(true);
                }
                Ok(serde_json::to_value(summary)?)
            }
        }
    }

    /// Handles a notice off the caller's task.
    pub(crate) fn spawn_notice(self: Arc<Self>, notice: Notice, data: Value) {
        tokio::spawn(async move {
            if let Err(e) = self.handle_notice(notice, data).await {
                tracing::warn!("Handling {} failed: {}", notice, e);
            }
        });
    }

    async fn handle_notice(&self, notice: Notice, data: Value) -> Result<()> {
        match notice {
            Notice::NullAchieved => {
                let payload: NullAchieved = serde_json::from_value(data)?;
                self.detector
                    .on_null_achieved(self, &payload.group, payload.total_sum)
                    .await
            }
        }
    }

    fn ask_remote(&self, peer: &str, question: Question, data: Value) -> BoxFuture<'static, Result<Value>> {
        let connection = self.fabric.peer(peer);
        let limit = match question {
            Question::EndProcessing => None,
            _ => self.config.ask_timeout(),
        };
        let peer = peer.to_string();
        async move {
            let connection = connection.ok_or_else(|| ClusterError::UnknownPeer(peer.clone()))?;
            let ask = connection.manager.ask(question, data);
            let Some(limit) = limit else {
                return ask.await;
            };
            match tokio::time::timeout(limit, ask).await {
                Ok(answer) => answer,
                Err(_) => {
                    tracing::warn!("{} to {} timed out, redialing", question, peer);
                    connection.reconnect();
                    Err(ClusterError::Timeout {
                        peer,
                        question: question.to_string(),
                    })
                }
            }
        }
        .boxed()
    }

    /// Routes one unit and ships it to its owner.
    pub(crate) async fn route(&self, envelope: WorkerEnvelope) -> Result<()> {
        let target = self
            .router
            .resolve(self, &envelope.session, &envelope.stage, envelope.key.as_deref())
            .await?;

        if target == self.config.local_key {
            let line = serde_json::to_string(&envelope)?;
            return self.inbox.push(line).await;
        }

        let Some(connection) = self.fabric.peer(&target) else {
            self.router.availability().invalidate(&envelope.stage);
            return Err(ClusterError::UnknownPeer(target));
        };
        let sent = connection.worker.send(&envelope);
        if let Err(e) = &sent
            && e.is_transport()
        {
            self.router.availability().invalidate(&envelope.stage);
            connection.reconnect();
        }
        sent
    }
}

/// Sweeps the node's ledgers every half retention until the node is dropped.
async fn sweep_loop(node: Weak<Node>, retention: Duration) {
    let mut ticker = tokio::time::interval((retention / 2).max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(node) = node.upgrade() else {
            return;
        };
        node.sweep_ledgers(retention);
    }
}

impl ClusterLink for Node {
    fn local_key(&self) -> &str {
        &self.config.local_key
    }

    fn member_keys(&self) -> Vec<String> {
        self.config.member_keys()
    }

    fn ask(&self, peer: &str, question: Question, data: Value) -> BoxFuture<'static, Result<Value>> {
        if peer == self.config.local_key {
            let node = self.me.upgrade();
            return async move {
                match node {
                    Some(node) => node.answer(question, data).await,
                    None => Err(ClusterError::ShuttingDown),
                }
            }
            .boxed();
        }
        self.ask_remote(peer, question, data)
    }

    fn notify(&self, peer: &str, notice: Notice, data: Value) -> Result<()> {
        if peer == self.config.local_key {
            let node = self.me.upgrade().ok_or(ClusterError::ShuttingDown)?;
            node.spawn_notice(notice, data);
            return Ok(());
        }
        let connection = self
            .fabric
            .peer(peer)
            .ok_or_else(|| ClusterError::UnknownPeer(peer.to_string()))?;
        connection.manager.notify(notice, data)
    }
}

impl Outbox for Node {
    fn deliver(&self, envelope: WorkerEnvelope) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.route(envelope))
    }
}
