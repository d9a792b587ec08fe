//! Error types shared by every subsystem of the node.
//!
//! Transport failures and application failures travel on separate variants so
//! that a failing stage handler is reported without tearing down the healthy
//! socket that delivered its input.

use std::io;
use thiserror::Error;

/// Errors that can occur while moving data through the cluster.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Socket connect/bind/read/write or queue segment I/O failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A line could not be parsed as the expected JSON message.
    #[error("malformed message: {0}")]
    Protocol(#[from] serde_json::Error),

    /// No node in the cluster answered that it can run the stage.
    #[error("no peer can run stage `{stage}`")]
    NoCapablePeer { stage: String },

    /// The routing layer resolved a key that is not in the connection set.
    #[error("unknown peer `{0}`")]
    UnknownPeer(String),

    /// The stage name is not registered on this node.
    #[error("unknown stage `{0}`")]
    UnknownStage(String),

    /// A user stage handler failed while processing a unit of work.
    #[error("stage `{stage}` failed: {cause:#}")]
    Application { stage: String, cause: anyhow::Error },

    /// The background task owning a channel has stopped.
    #[error("channel to `{0}` closed")]
    ChannelClosed(String),

    /// A remote ask did not produce an answer in time.
    #[error("ask `{question}` to `{peer}` timed out")]
    Timeout { peer: String, question: String },

    /// The node was dropped while work still referenced it.
    #[error("node is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    /// Returns true for failures that should trigger a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClusterError::Transport(_) | ClusterError::ChannelClosed(_)
        )
    }
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
