use super::protocol::{Ack, ManagerReply, ManagerRequest, Notice, Question, WorkerEnvelope};
use super::retry::with_retry;
use super::types::{ConnectionDescriptor, ConnectionState, RetryPolicy, Role};
use super::write_line;
use crate::error::{ClusterError, Result};
use crate::framing::{FramingOptions, LineSplitter};

use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot, watch};

type InboundFn = Arc<dyn Fn(String) + Send + Sync>;
type ReplayFn = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Background task owning one outbound socket.
///
/// Outgoing lines arrive over an mpsc channel, so callers never block on the
/// socket. Every written line stays in `unacked` until the listener confirms
/// it with a cumulative `Ack`; whatever is still unconfirmed when a socket
/// dies is written again, in order, after the next successful connect.
struct ChannelTask {
    peer: String,
    role: Role,
    addr: String,
    policy: RetryPolicy,
    outbound: mpsc::UnboundedReceiver<String>,
    state: watch::Sender<ConnectionState>,
    kick: Arc<Notify>,
    on_line: Option<InboundFn>,
    replay: Option<ReplayFn>,
    unacked: VecDeque<String>,
}

impl ChannelTask {
    async fn run(mut self) {
        let label = format!("{} channel to {} ({})", self.role, self.peer, self.addr);
        let mut connected_before = false;

        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let addr = self.addr.clone();
            let connect = with_retry(&self.policy, &label, || {
                let addr = addr.clone();
                async move { TcpStream::connect(addr).await.map_err(ClusterError::from) }
            })
            .await;

            let stream = match connect {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("{} could not connect: {}", label, e);
                    self.state.send_replace(ConnectionState::Disconnected);
                    tokio::time::sleep(self.policy.sleep_timeout()).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            self.state.send_replace(ConnectionState::Connected);
            tracing::info!("{} connected", label);

            match self.pump(stream, connected_before).await {
                Ok(()) => {
                    tracing::debug!("{} closed by owner", label);
                    self.state.send_replace(ConnectionState::Disconnected);
                    return;
                }
                Err(e) => {
                    tracing::warn!("{} lost: {}", label, e);
                    self.state.send_replace(ConnectionState::Disconnected);
                }
            }

            connected_before = true;
            self.state.send_replace(ConnectionState::Retrying);
            tokio::time::sleep(self.policy.backoff(1)).await;
        }
    }

    /// Moves lines until the socket fails, a reconnect is requested, or every
    /// sender is gone (`Ok`).
    async fn pump(&mut self, stream: TcpStream, reconnected: bool) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        // Acks count lines per socket, so the buffer lines up with a fresh count.
        let mut acked: u64 = 0;

        if !self.unacked.is_empty() {
            tracing::debug!(
                "Resending {} unconfirmed line(s) to {}",
                self.unacked.len(),
                self.peer
            );
        }
        for line in &self.unacked {
            write_line(&mut writer, line).await?;
        }
        if reconnected && let Some(replay) = &self.replay {
            let waiting: Vec<String> = {
                let buffered: HashSet<&str> = self.unacked.iter().map(String::as_str).collect();
                replay()
                    .into_iter()
                    .filter(|line| !buffered.contains(line.as_str()))
                    .collect()
            };
            for line in waiting {
                self.unacked.push_back(line);
                if let Some(line) = self.unacked.back() {
                    write_line(&mut writer, line).await?;
                }
            }
        }

        let mut splitter = LineSplitter::new(FramingOptions::default().skip_empty(true));
        let mut buf = vec![0u8; 8192];

        loop {
            tokio::select! {
                outgoing = self.outbound.recv() => match outgoing {
                    Some(line) => {
                        self.unacked.push_back(line);
                        if let Some(line) = self.unacked.back() {
                            write_line(&mut writer, line).await?;
                        }
                    }
                    None => return Ok(()),
                },
                read = reader.read(&mut buf) => match read? {
                    0 => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed the connection",
                        )
                        .into());
                    }
                    n => {
                        for line in splitter.push(&buf[..n]) {
                            if let Ok(Ack { ack }) = serde_json::from_str::<Ack>(&line) {
                                self.confirm(&mut acked, ack);
                            } else if let Some(on_line) = &self.on_line {
                                on_line(line);
                            }
                        }
                    }
                },
                _ = self.kick.notified() => {
                    return Err(io::Error::other("reconnect requested").into());
                }
            }
        }
    }

    /// Forgets the lines the listener has confirmed on this socket.
    fn confirm(&mut self, acked: &mut u64, ack: u64) {
        while *acked < ack && self.unacked.pop_front().is_some() {
            *acked += 1;
        }
    }
}

struct ChannelParts {
    outbound: mpsc::UnboundedSender<String>,
    state: watch::Receiver<ConnectionState>,
    kick: Arc<Notify>,
}

fn spawn_channel(
    peer: &str,
    role: Role,
    addr: &str,
    policy: RetryPolicy,
    on_line: Option<InboundFn>,
    replay: Option<ReplayFn>,
) -> ChannelParts {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let kick = Arc::new(Notify::new());

    let task = ChannelTask {
        peer: peer.to_string(),
        role,
        addr: addr.to_string(),
        policy,
        outbound: outbound_rx,
        state: state_tx,
        kick: kick.clone(),
        on_line,
        replay,
        unacked: VecDeque::new(),
    };
    tokio::spawn(task.run());

    ChannelParts {
        outbound: outbound_tx,
        state: state_rx,
        kick,
    }
}

/// Drops the inflight entry when the asking future goes away, answered or not.
struct InflightGuard {
    inflight: Arc<DashMap<String, Inflight>>,
    id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.id);
    }
}

struct Inflight {
    line: String,
    reply: oneshot::Sender<Value>,
}

/// Data-plane channel: fire-and-forget work envelopes.
#[derive(Clone)]
pub struct WorkerChannel {
    peer: String,
    outbound: mpsc::UnboundedSender<String>,
    state: watch::Receiver<ConnectionState>,
    kick: Arc<Notify>,
}

impl WorkerChannel {
    pub fn connect(peer: &str, addr: &str, policy: RetryPolicy) -> Self {
        let parts = spawn_channel(peer, Role::Worker, addr, policy, None, None);
        Self {
            peer: peer.to_string(),
            outbound: parts.outbound,
            state: parts.state,
            kick: parts.kick,
        }
    }

    pub fn send(&self, envelope: &WorkerEnvelope) -> Result<()> {
        self.send_line(serde_json::to_string(envelope)?)
    }

    /// Queues a raw line. Never blocks; delivery resumes after reconnects.
    pub fn send_line(&self, line: String) -> Result<()> {
        self.outbound
            .send(line)
            .map_err(|_| ClusterError::ChannelClosed(self.peer.clone()))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Control-plane channel: correlated asks and one-way notices.
#[derive(Clone)]
pub struct ManagerChannel {
    peer: String,
    outbound: mpsc::UnboundedSender<String>,
    inflight: Arc<DashMap<String, Inflight>>,
    state: watch::Receiver<ConnectionState>,
    kick: Arc<Notify>,
}

impl ManagerChannel {
    pub fn connect(peer: &str, addr: &str, policy: RetryPolicy) -> Self {
        let inflight: Arc<DashMap<String, Inflight>> = Arc::new(DashMap::new());

        let on_line: InboundFn = {
            let inflight = inflight.clone();
            let peer = peer.to_string();
            Arc::new(move |line: String| match serde_json::from_str::<ManagerReply>(&line) {
                Ok(reply) => match inflight.remove(&reply.id) {
                    Some((_, entry)) => {
                        let _ = entry.reply.send(reply.answer);
                    }
                    None => tracing::trace!("Reply {} from {} has no waiter", reply.id, peer),
                },
                Err(e) => tracing::warn!("Malformed reply from {}: {}", peer, e),
            })
        };
        let replay: ReplayFn = {
            let inflight = inflight.clone();
            Arc::new(move || inflight.iter().map(|entry| entry.value().line.clone()).collect())
        };

        let parts = spawn_channel(peer, Role::Manager, addr, policy, Some(on_line), Some(replay));
        Self {
            peer: peer.to_string(),
            outbound: parts.outbound,
            inflight,
            state: parts.state,
            kick: parts.kick,
        }
    }

    /// Sends a question and waits for the reply with the same id.
    ///
    /// The ask is re-sent after every reconnect until it is answered or the
    /// returned future is dropped.
    pub async fn ask(&self, question: Question, data: Value) -> Result<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let line = serde_json::to_string(&ManagerRequest::ask(id.clone(), question, data))?;

        let (tx, rx) = oneshot::channel();
        self.inflight.insert(
            id.clone(),
            Inflight {
                line: line.clone(),
                reply: tx,
            },
        );
        let _guard = InflightGuard {
            inflight: self.inflight.clone(),
            id,
        };

        self.outbound
            .send(line)
            .map_err(|_| ClusterError::ChannelClosed(self.peer.clone()))?;
        rx.await
            .map_err(|_| ClusterError::ChannelClosed(self.peer.clone()))
    }

    pub fn notify(&self, notice: Notice, data: Value) -> Result<()> {
        let line = serde_json::to_string(&ManagerRequest::notify(notice, data))?;
        self.outbound
            .send(line)
            .map_err(|_| ClusterError::ChannelClosed(self.peer.clone()))
    }

    /// Number of asks still waiting for an answer.
    pub fn pending_asks(&self) -> usize {
        self.inflight.len()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// The manager + worker channel pair towards one remote node.
pub struct PeerConnection {
    descriptor: ConnectionDescriptor,
    pub manager: ManagerChannel,
    pub worker: WorkerChannel,
}

impl PeerConnection {
    pub fn connect(descriptor: ConnectionDescriptor) -> Self {
        let manager = ManagerChannel::connect(
            &descriptor.key,
            &descriptor.manager,
            descriptor.retry.clone(),
        );
        let worker =
            WorkerChannel::connect(&descriptor.key, &descriptor.worker, descriptor.retry.clone());
        tracing::debug!(
            "Dialing peer {} (manager {}, worker {})",
            descriptor.key,
            descriptor.manager,
            descriptor.worker
        );
        Self {
            descriptor,
            manager,
            worker,
        }
    }

    pub fn key(&self) -> &str {
        &self.descriptor.key
    }

    /// Combined state: connected only when both channels are.
    pub fn state(&self) -> ConnectionState {
        combine(self.manager.state(), self.worker.state())
    }

    /// Drops and re-dials both channels if they are currently connected.
    ///
    /// Requests made while a reconnect is already underway are absorbed: the
    /// kick is a single stored permit and disconnected channels ignore it.
    pub fn reconnect(&self) {
        if self.manager.state() == ConnectionState::Connected {
            self.manager.kick.notify_one();
        }
        if self.worker.state() == ConnectionState::Connected {
            self.worker.kick.notify_one();
        }
        tracing::info!("Reconnect requested for peer {}", self.key());
    }
}

fn combine(manager: ConnectionState, worker: ConnectionState) -> ConnectionState {
    use ConnectionState::*;
    match (manager, worker) {
        (Connected, Connected) => Connected,
        (Retrying, _) | (_, Retrying) => Retrying,
        (Connecting, _) | (_, Connecting) => Connecting,
        _ => Disconnected,
    }
}
