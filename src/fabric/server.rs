use super::protocol::Ack;
use super::retry::with_retry;
use super::types::{RetryPolicy, Role};
use super::write_line;
use crate::error::{ClusterError, Result};
use crate::framing::{FramingOptions, LineReader};
use crate::queue::SpillQueue;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};

pub type DataHook = Arc<dyn Fn(Value, Responder) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type DataErrorHook = Arc<dyn Fn(ClusterError) + Send + Sync>;

/// Callbacks a listener hands every parsed message to.
#[derive(Clone)]
pub struct ServerHooks {
    pub on_data: DataHook,
    pub on_data_error: DataErrorHook,
}

impl ServerHooks {
    pub fn new<F, Fut>(on_data: F) -> Self
    where
        F: Fn(Value, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            on_data: Arc::new(move |value, responder| Box::pin(on_data(value, responder))),
            on_data_error: Arc::new(|e| tracing::warn!("Dropped message: {}", e)),
        }
    }

    pub fn on_data_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClusterError) + Send + Sync + 'static,
    {
        self.on_data_error = Arc::new(hook);
        self
    }
}

/// Writes replies back on the socket a message arrived on.
#[derive(Clone)]
pub struct Responder {
    peer: String,
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl Responder {
    /// A responder with nowhere to write (local dispatch).
    pub fn detached() -> Self {
        Self {
            peer: "local".to_string(),
            tx: None,
        }
    }

    pub fn reply<T: Serialize>(&self, message: &T) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let line = serde_json::to_string(message)?;
        tx.send(line)
            .map_err(|_| ClusterError::ChannelClosed(self.peer.clone()))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// One of the two inbound listeners of a node.
///
/// Every accepted socket gets its own spill queue, so a slow handler pushes
/// backlog to disk instead of stalling the socket reader.
#[derive(Debug, Clone)]
pub struct Listener {
    pub role: Role,
    pub bind: String,
    pub retry: RetryPolicy,
    pub queue_dir: PathBuf,
    pub memory_limit: usize,
    pub concurrency: usize,
}

impl Listener {
    pub async fn bind(&self) -> Result<TcpListener> {
        let label = format!("{} listener on {}", self.role, self.bind);
        let bind = self.bind.clone();
        let listener = with_retry(&self.retry, &label, || {
            let bind = bind.clone();
            async move { TcpListener::bind(bind).await.map_err(ClusterError::from) }
        })
        .await?;
        tracing::info!("{} listener bound to {}", self.role, listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts sockets forever.
    pub async fn accept_loop(self, listener: TcpListener, hooks: ServerHooks) {
        let settings = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    let settings = settings.clone();
                    let hooks = hooks.clone();
                    tokio::spawn(async move {
                        let role = settings.role;
                        if let Err(e) = serve_socket(settings, stream, remote, hooks).await {
                            tracing::warn!("{} socket from {} ended: {}", role, remote, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("{} accept failed: {}", settings.role, e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_socket(
    settings: Arc<Listener>,
    stream: TcpStream,
    remote: SocketAddr,
    hooks: ServerHooks,
) -> Result<()> {
    tracing::debug!("{} socket accepted from {}", settings.role, remote);
    let (read, mut write) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut write, &line).await {
                tracing::debug!("Reply to {} failed: {}", remote, e);
                break;
            }
        }
    });
    let responder = Responder {
        peer: remote.to_string(),
        tx: Some(tx),
    };

    let queue = Arc::new(SpillQueue::new(
        settings
            .queue_dir
            .join(format!("{}-{}", settings.role, uuid::Uuid::new_v4())),
        settings.memory_limit,
    ));
    queue.init_cache().await?;
    let drain = tokio::spawn(drain_queue(
        queue.clone(),
        hooks,
        settings.concurrency,
        responder.clone(),
    ));

    let mut reader = LineReader::new(read, FramingOptions::default().skip_empty(true));
    let mut queued: u64 = 0;
    let result = loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = queue.push(line).await {
                    break Err(e);
                }
                queued += 1;
                let _ = responder.reply(&Ack { ack: queued });
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(ClusterError::from(e)),
        }
    };

    queue.close();
    let _ = drain.await;
    queue.remove_cache().await?;
    tracing::debug!("{} socket from {} closed", settings.role, remote);
    result
}

/// Pops queued lines and runs them through `hooks` with at most
/// `concurrency` handlers in flight. Returns once the queue is closed, drained
/// and every handler has finished.
pub(crate) async fn drain_queue(
    queue: Arc<SpillQueue>,
    hooks: ServerHooks,
    concurrency: usize,
    responder: Responder,
) {
    let concurrency = concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));

    loop {
        let line = match queue.pop_wait().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                (hooks.on_data_error)(e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let hooks = hooks.clone();
        let responder = responder.clone();
        tokio::spawn(async move {
            let _permit = permit;
            dispatch_line(&hooks, &line, responder).await;
        });
    }

    let _ = permits.acquire_many(concurrency as u32).await;
}

async fn dispatch_line(hooks: &ServerHooks, line: &str, responder: Responder) {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            (hooks.on_data_error)(ClusterError::Protocol(e));
            return;
        }
    };
    if let Err(e) = (hooks.on_data)(value, responder).await {
        (hooks.on_data_error)(e);
    }
}
