use crate::error::{ClusterError, Result};
use crate::fabric::protocol::WorkerEnvelope;
use crate::ids::group_hash;
use crate::termination::GroupState;

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Where outgoing units go: routing plus local or remote delivery.
pub trait Outbox: Send + Sync {
    fn deliver(&self, envelope: WorkerEnvelope) -> BoxFuture<'_, Result<()>>;
}

/// The `send` capability of an instance.
///
/// Every send lands in the child group `hash(current group, target stage)` and
/// is counted against the current group so the child's total is known when the
/// current group ends.
#[derive(Clone)]
pub struct StageSender {
    session: String,
    group: String,
    state: Arc<GroupState>,
    outbox: Weak<dyn Outbox>,
}

impl StageSender {
    pub fn new(session: &str, state: Arc<GroupState>, outbox: Weak<dyn Outbox>) -> Self {
        Self {
            session: session.to_string(),
            group: state.group().to_string(),
            state,
            outbox,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub async fn send(&self, stage: &str, key: Option<&str>, data: Value) -> Result<()> {
        self.dispatch(stage, key, Some(data)).await
    }

    /// Ends `key` on `stage`: the instance holding it finishes and is dropped.
    pub async fn end_key(&self, stage: &str, key: &str) -> Result<()> {
        self.dispatch(stage, Some(key), None).await
    }

    async fn dispatch(&self, stage: &str, key: Option<&str>, data: Option<Value>) -> Result<()> {
        let outbox = self.outbox.upgrade().ok_or(ClusterError::ShuttingDown)?;
        let next_group = group_hash(&self.group, stage);
        self.state.count_child(&next_group);

        let delivered = outbox
            .deliver(WorkerEnvelope {
                session: self.session.clone(),
                group: next_group.clone(),
                stage: stage.to_string(),
                key: key.map(str::to_string),
                data,
            })
            .await;
        if delivered.is_err() {
            self.state.uncount_child(&next_group);
        }
        delivered
    }
}
