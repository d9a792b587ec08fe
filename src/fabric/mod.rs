//! Connection Fabric
//!
//! Keeps every node connected to every other node over two persistent TCP
//! channels per peer, and accepts the mirror-image connections on the local
//! listeners.
//!
//! ## Channels
//! - **Manager** (control plane): asks correlated by id, plus fire-and-forget notices.
//! - **Worker** (data plane): one-way stream of work envelopes.
//!
//! ## Resilience
//! Each channel is owned by a single background task. Connect and bind failures
//! retry with linear backoff (`attempt × scaling`), then sleep and start over;
//! a channel never enters a terminal failure state because peers may come back.
//! Listeners acknowledge every line they queue. Lines the listener has not
//! acknowledged yet, and asks still waiting for an answer, are sent again
//! after reconnecting (at-least-once delivery, so receivers may see duplicates).
//!
//! ## Submodules
//! - **`types`**: descriptors, retry policy, connection states.
//! - **`protocol`**: newline-delimited JSON envelopes for both channels.
//! - **`retry`**: the backoff loop shared by connect and bind.
//! - **`client`**: outbound manager/worker channels and the per-peer pair.
//! - **`connections`**: the aggregate connection set.
//! - **`server`**: listeners feeding sockets through framing and the spill queue.

pub mod client;
pub mod connections;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod types;

pub use client::{ManagerChannel, PeerConnection, WorkerChannel};
pub use connections::{Fabric, LiveConnection};
pub use server::{Listener, Responder, ServerHooks};
pub use types::{ConnectionDescriptor, ConnectionState, RetryPolicy, Role};

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writes one newline-terminated line.
pub(crate) async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    let mut framed = String::with_capacity(line.len() + 1);
    framed.push_str(line);
    framed.push('\n');
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await
}
