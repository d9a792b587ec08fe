use crate::error::Result;

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

struct Binding {
    slot: Arc<OnceCell<String>>,
    last_used: Instant,
}

impl Default for Binding {
    fn default() -> Self {
        Self {
            slot: Arc::new(OnceCell::new()),
            last_used: Instant::now(),
        }
    }
}

/// Sticky `unit_hash → node key` bindings.
///
/// Concurrent lookups of an unresolved unit share one resolution. A failed
/// resolution leaves the slot empty so the next caller tries again. Bindings
/// left unused for a while can be evicted; the owner is then found again
/// through `GET_SESSION_STAGE_KEY_SERVER`.
#[derive(Default)]
pub struct StickyCache {
    bindings: DashMap<String, Binding>,
}

impl StickyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_resolve<F, Fut>(&self, unit: &str, resolve: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let slot = {
            let mut binding = self.bindings.entry(unit.to_string()).or_default();
            binding.last_used = Instant::now();
            binding.slot.clone()
        };
        let key = slot.get_or_try_init(resolve).await?;
        Ok(key.clone())
    }

    /// Resolved binding, if any. Never waits for an in-flight resolution.
    pub fn peek(&self, unit: &str) -> Option<String> {
        self.bindings
            .get(unit)
            .and_then(|binding| binding.slot.get().cloned())
    }

    pub fn forget(&self, unit: &str) {
        self.bindings.remove(unit);
    }

    /// Drops resolved bindings nobody has looked up for `idle`. Returns how
    /// many were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let before = self.bindings.len();
        self.bindings
            .retain(|_, binding| !(binding.slot.initialized() && binding.last_used.elapsed() >= idle));
        before.saturating_sub(self.bindings.len())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
