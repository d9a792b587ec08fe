use crate::fabric::protocol::GroupSummary;
use crate::stage::StageInstance;

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};

/// A live stage instance; on_data/on_finish calls on it never overlap.
pub type InstanceCell = Arc<Mutex<Box<dyn StageInstance>>>;

/// Memoized instance slot: concurrent first messages for a unit share one
/// construction.
pub type InstanceSlot = Arc<OnceCell<InstanceCell>>;

/// Per-node accounting for one group.
pub struct GroupState {
    group: String,
    total_sum: OnceLock<u64>,
    processed: AtomicU64,
    processes: AtomicU64,
    storage: DashMap<String, InstanceSlot>,
    used_groups_totals: DashMap<String, u64>,
}

impl GroupState {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            total_sum: OnceLock::new(),
            processed: AtomicU64::new(0),
            processes: AtomicU64::new(0),
            storage: DashMap::new(),
            used_groups_totals: DashMap::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Records the number of units sent into the group. The first value wins.
    pub fn set_total(&self, total: u64) -> u64 {
        let recorded = *self.total_sum.get_or_init(|| total);
        if recorded != total {
            tracing::warn!(
                "Group {} already has total {}, ignoring {}",
                self.group,
                recorded,
                total
            );
        }
        recorded
    }

    pub fn total(&self) -> Option<u64> {
        self.total_sum.get().copied()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u64 {
        self.processes.load(Ordering::SeqCst)
    }

    pub fn begin(&self) {
        self.processes.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one unit as processed. Returns true when nothing is left in flight.
    pub fn complete(&self) -> bool {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.processes.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn count_child(&self, child: &str) {
        *self.used_groups_totals.entry(child.to_string()).or_insert(0) += 1;
    }

    /// Takes back a count for a unit that never left this node.
    pub fn uncount_child(&self, child: &str) {
        self.used_groups_totals.remove_if_mut(child, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn children(&self) -> BTreeMap<String, u64> {
        self.used_groups_totals
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn instance_slot(&self, unit: &str) -> InstanceSlot {
        self.storage.entry(unit.to_string()).or_default().clone()
    }

    pub fn take_instance(&self, unit: &str) -> Option<InstanceSlot> {
        self.storage.remove(unit).map(|(_, slot)| slot)
    }

    pub fn drain_instances(&self) -> Vec<(String, InstanceSlot)> {
        let units: Vec<String> = self.storage.iter().map(|entry| entry.key().clone()).collect();
        units
            .into_iter()
            .filter_map(|unit| self.storage.remove(&unit))
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.storage.len()
    }
}

/// END record of a group: its summary once computed, and when END started.
struct Ended {
    summary: Arc<OnceCell<GroupSummary>>,
    since: Instant,
}

impl Default for Ended {
    fn default() -> Self {
        Self {
            summary: Arc::new(OnceCell::new()),
            since: Instant::now(),
        }
    }
}

/// Owner of every group's state on this node.
///
/// Groups are created by `open` and destroyed once by `close`. Ended groups
/// keep their summary so repeated or late protocol messages get the same
/// answer instead of resurrecting the group, until `evict_ended` drops
/// records past their retention.
#[derive(Default)]
pub struct GroupStore {
    live: DashMap<String, Arc<GroupState>>,
    finished: DashMap<String, Ended>,
    owned_units: DashMap<String, usize>,
}

impl GroupStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self, group: &str) -> Arc<GroupState> {
        self.live
            .entry(group.to_string())
            .or_insert_with(|| {
                tracing::trace!("Opened group {}", group);
                Arc::new(GroupState::new(group))
            })
            .clone()
    }

    pub fn get(&self, group: &str) -> Option<Arc<GroupState>> {
        self.live.get(group).map(|entry| entry.value().clone())
    }

    pub fn close(&self, group: &str) -> Option<Arc<GroupState>> {
        self.live.remove(group).map(|(_, state)| state)
    }

    /// True once the group's END has started on this node.
    pub fn is_finished(&self, group: &str) -> bool {
        self.finished.contains_key(group)
    }

    pub fn summary(&self, group: &str) -> Option<GroupSummary> {
        self.finished
            .get(group)
            .and_then(|ended| ended.summary.get().cloned())
    }

    pub(crate) fn finish_slot(&self, group: &str) -> Arc<OnceCell<GroupSummary>> {
        self.finished
            .entry(group.to_string())
            .or_default()
            .summary
            .clone()
    }

    /// Forgets completed END records older than `retention` and returns their
    /// groups. Records whose END is still running are kept.
    pub fn evict_ended(&self, retention: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.finished.retain(|group, ended| {
            let expired = ended.summary.initialized() && ended.since.elapsed() >= retention;
            if expired {
                evicted.push(group.clone());
            }
            !expired
        });
        evicted
    }

    pub fn ended_groups(&self) -> usize {
        self.finished.len()
    }

    /// Units processed here for `group`, live or already ended.
    pub fn processed(&self, group: &str) -> u64 {
        match self.get(group) {
            Some(state) => state.processed(),
            None => self.summary(group).map(|s| s.processed).unwrap_or(0),
        }
    }

    pub fn claim_unit(&self, unit: &str) {
        *self.owned_units.entry(unit.to_string()).or_insert(0) += 1;
    }

    pub fn release_unit(&self, unit: &str) {
        self.owned_units.remove_if_mut(unit, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    /// True while this node holds a live instance for the unit.
    pub fn owns_unit(&self, unit: &str) -> bool {
        self.owned_units.contains_key(unit)
    }

    pub fn live_groups(&self) -> usize {
        self.live.len()
    }
}
