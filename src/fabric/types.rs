use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Reconnect tuning for one peer (or for binding a listener).
///
/// Attempt `n` waits `n × scaling` before the next one. After
/// `max_retry_attempts` failures the loop sleeps `sleep_timeout` and starts a
/// fresh round, forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retry_attempts: u32,
    pub scaling_ms: u64,
    pub sleep_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            scaling_ms: 500,
            sleep_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retry_attempts: u32, scaling: Duration, sleep_timeout: Duration) -> Self {
        Self {
            max_retry_attempts,
            scaling_ms: scaling.as_millis() as u64,
            sleep_timeout_ms: sleep_timeout.as_millis() as u64,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.scaling_ms.saturating_mul(attempt as u64))
    }

    pub fn sleep_timeout(&self) -> Duration {
        Duration::from_millis(self.sleep_timeout_ms)
    }

    /// Upper bound of one full retry round before the sleep fallback.
    pub fn round_duration(&self) -> Duration {
        (1..self.max_retry_attempts).map(|n| self.backoff(n)).sum()
    }
}

/// Static description of a cluster member, loaded at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub key: String,
    /// `host:port` of the member's manager listener.
    pub manager: String,
    /// `host:port` of the member's worker listener.
    pub worker: String,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Lifecycle of a channel. There is no terminal state: a channel keeps
/// cycling through these until the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Retrying,
}

/// Which of the two listeners / channels a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Manager,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Manager => f.write_str("manager"),
            Role::Worker => f.write_str("worker"),
        }
    }
}
