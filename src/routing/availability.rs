use super::broadcast::gather;
use super::link::ClusterLink;
use crate::config::RoutingConfig;
use crate::error::{ClusterError, Result};
use crate::fabric::protocol::{Question, StageQuery};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

type Slot = Arc<Mutex<Option<(Vec<String>, Instant)>>>;

/// Per-stage list of nodes that answered `CAN_GET_STAGE` with `true`.
///
/// Lists expire after the configured TTL. While nobody is capable the stage is
/// re-polled every `poll_interval` until `poll_ceiling` has passed. Concurrent
/// lookups for one stage share a single poll.
pub struct AvailabilityCache {
    config: RoutingConfig,
    entries: DashMap<String, Slot>,
}

impl AvailabilityCache {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Capable node keys for `stage`, never empty.
    pub async fn capable(&self, link: &dyn ClusterLink, stage: &str) -> Result<Vec<String>> {
        let slot = self.entries.entry(stage.to_string()).or_default().clone();
        let mut cached = slot.lock().await;

        if let Some((keys, fetched_at)) = cached.as_ref()
            && fetched_at.elapsed() < self.config.availability_ttl()
        {
            return Ok(keys.clone());
        }

        let deadline = Instant::now() + self.config.poll_ceiling();
        loop {
            let keys = poll(link, stage).await?;
            if !keys.is_empty() {
                tracing::debug!("Stage {} available on [{}]", stage, keys.join(", "));
                *cached = Some((keys.clone(), Instant::now()));
                return Ok(keys);
            }

            if Instant::now() + self.config.poll_interval() > deadline {
                *cached = None;
                tracing::warn!(
                    "No node can run stage {} after {:?}",
                    stage,
                    self.config.poll_ceiling()
                );
                return Err(ClusterError::NoCapablePeer {
                    stage: stage.to_string(),
                });
            }
            tracing::debug!("No node can run stage {} yet, polling again", stage);
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    pub fn invalidate(&self, stage: &str) {
        self.entries.remove(stage);
    }
}

async fn poll(link: &dyn ClusterLink, stage: &str) -> Result<Vec<String>> {
    let query = serde_json::to_value(StageQuery {
        stage: stage.to_string(),
    })?;
    let mut keys: Vec<String> = gather(link, Question::CanGetStage, query)
        .await
        .into_iter()
        .filter(|(_, answer)| answer.as_ref().and_then(|a| a.as_bool()) == Some(true))
        .map(|(key, _)| key)
        .collect();
    keys.sort();
    Ok(keys)
}
