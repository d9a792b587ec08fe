use super::state::GroupStore;
use crate::error::{ClusterError, Result};
use crate::fabric::protocol::{GroupQuery, GroupSummary, NullAchieved, Notice, Question};
use crate::routing::{ClusterLink, gather, notify_all};

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const RECHECK_INITIAL: Duration = Duration::from_millis(200);
const RECHECK_MAX: Duration = Duration::from_secs(5);

pub struct TerminationDetector {
    groups: Arc<GroupStore>,
    /// Groups this node has already driven to END.
    finishing: DashMap<String, Arc<OnceCell<()>>>,
    /// Groups with a recheck loop waiting on unanswered counts.
    rechecking: Arc<DashSet<String>>,
    recheck_initial: Duration,
    recheck_max: Duration,
}

/// Frees the group's recheck claim when the loop holding it ends.
struct RecheckClaim {
    rechecking: Arc<DashSet<String>>,
    group: String,
}

impl Drop for RecheckClaim {
    fn drop(&mut self) {
        self.rechecking.remove(&self.group);
    }
}

impl TerminationDetector {
    pub fn new(groups: Arc<GroupStore>) -> Self {
        Self {
            groups,
            finishing: DashMap::new(),
            rechecking: Arc::new(DashSet::new()),
            recheck_initial: RECHECK_INITIAL,
            recheck_max: RECHECK_MAX,
        }
    }

    /// Delay before re-counting a group some member did not answer for,
    /// doubling up to `max`.
    pub fn with_recheck(mut self, initial: Duration, max: Duration) -> Self {
        self.recheck_initial = initial;
        self.recheck_max = max.max(initial);
        self
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        &self.groups
    }

    /// Records the group's total and checks whether it is already complete.
    pub async fn on_null_achieved(&self, link: &dyn ClusterLink, group: &str, total: u64) -> Result<()> {
        if self.groups.is_finished(group) {
            tracing::trace!("NULL_ACHIEVED for ended group {}", group);
            return Ok(());
        }
        let state = self.groups.open(group);
        let total = state.set_total(total);
        tracing::debug!("Group {} expects {} units", group, total);

        self.check(link, group).await?;
        Ok(())
    }

    /// Compares the cluster-wide processed count with the known total and ends
    /// the group when they meet. Returns whether the group was ended.
    ///
    /// While the sum falls short and some member did not answer, the count is
    /// repeated with backoff until every member answers or the group ends
    /// elsewhere. Only one such loop runs per group.
    pub async fn check(&self, link: &dyn ClusterLink, group: &str) -> Result<bool> {
        let mut claim: Option<RecheckClaim> = None;
        let mut delay = self.recheck_initial;

        loop {
            if self.groups.is_finished(group) {
                return Ok(false);
            }
            let Some(total) = self.groups.get(group).and_then(|state| state.total()) else {
                return Ok(false);
            };

            let (processed, unanswered) = self.count(link, group).await?;
            tracing::debug!("Group {} processed {}/{}", group, processed, total);
            // Duplicate deliveries can push the count past the total.
            if processed >= total {
                self.finish(link, group).await?;
                return Ok(true);
            }
            if unanswered == 0 {
                return Ok(false);
            }

            if claim.is_none() {
                if !self.rechecking.insert(group.to_string()) {
                    return Ok(false);
                }
                claim = Some(RecheckClaim {
                    rechecking: self.rechecking.clone(),
                    group: group.to_string(),
                });
            }
            tracing::warn!(
                "{} member(s) did not report counts for group {}, rechecking in {:?}",
                unanswered,
                group,
                delay
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.recheck_max);
        }
    }

    /// Cluster-wide processed sum and the number of members that gave no count.
    async fn count(&self, link: &dyn ClusterLink, group: &str) -> Result<(u64, usize)> {
        let query = serde_json::to_value(GroupQuery {
            group: group.to_string(),
        })?;
        let mut processed = 0;
        let mut unanswered = 0;
        for (_, answer) in gather(link, Question::CountProcessed, query).await {
            match answer.as_ref().and_then(Value::as_u64) {
                Some(count) => processed += count,
                None => unanswered += 1,
            }
        }
        Ok((processed, unanswered))
    }

    /// Ends `group` on every member and cascades to its children. Runs at most
    /// once per group on this node.
    pub async fn finish(&self, link: &dyn ClusterLink, group: &str) -> Result<()> {
        let slot = self.finishing.entry(group.to_string()).or_default().clone();
        slot.get_or_try_init(|| async {
            let query = serde_json::to_value(GroupQuery {
                group: group.to_string(),
            })?;

            let mut children: BTreeMap<String, u64> = BTreeMap::new();
            for (peer, answer) in gather(link, Question::EndProcessing, query).await {
                let Some(answer) = answer else {
                    tracing::warn!("{} did not confirm END of group {}", peer, group);
                    continue;
                };
                match serde_json::from_value::<GroupSummary>(answer) {
                    Ok(summary) => {
                        for (child, count) in summary.children {
                            *children.entry(child).or_insert(0) += count;
                        }
                    }
                    Err(e) => tracing::warn!("Bad END summary from {}: {}", peer, e),
                }
            }

            tracing::info!("Group {} ended, {} child groups follow", group, children.len());
            for (child, total_sum) in children {
                let notice = serde_json::to_value(NullAchieved {
                    group: child,
                    total_sum,
                })?;
                notify_all(link, Notice::NullAchieved, notice);
            }
            Ok::<(), ClusterError>(())
        })
        .await?;
        Ok(())
    }

    /// Local END handler: finishes every instance of the group held here,
    /// discards the group's state and returns its summary. Repeated calls
    /// return the first summary.
    pub async fn end_group(&self, group: &str) -> Result<GroupSummary> {
        let slot = self.groups.finish_slot(group);
        let summary = slot
            .get_or_try_init(|| async {
                let Some(state) = self.groups.close(group) else {
                    return Ok::<GroupSummary, ClusterError>(GroupSummary::default());
                };

                for (unit, instance) in state.drain_instances() {
                    self.groups.release_unit(&unit);
                    let Some(instance) = instance.get() else {
                        continue;
                    };
                    let mut instance = instance.lock().await;
                    if let Err(e) = instance.on_finish().await {
                        tracing::error!("on_finish failed in group {}: {:#}", group, e);
                    }
                }

                Ok(GroupSummary {
                    processed: state.processed(),
                    children: state.children(),
                })
            })
            .await?;
        Ok(summary.clone())
    }

    /// Drops the END records of groups that ended more than `retention` ago,
    /// along with this node's finisher slots for them. Returns how many
    /// groups were forgotten.
    pub fn evict_ended(&self, retention: Duration) -> usize {
        let evicted = self.groups.evict_ended(retention);
        for group in &evicted {
            self.finishing.remove(group);
        }
        self.finishing
            .retain(|group, slot| !(slot.initialized() && !self.groups.is_finished(group)));
        if !evicted.is_empty() {
            tracing::debug!("Forgot {} ended group(s)", evicted.len());
        }
        evicted.len()
    }

    /// Finisher slots still held, completed or not.
    pub fn finishing_len(&self) -> usize {
        self.finishing.len()
    }
}
