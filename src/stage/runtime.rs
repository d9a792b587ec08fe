use super::registry::StageRegistry;
use super::sender::{Outbox, StageSender};
use super::types::{Stage, StageInstance};
use crate::error::{ClusterError, Result};
use crate::fabric::protocol::WorkerEnvelope;
use crate::ids::unit_hash;
use crate::termination::{GroupState, GroupStore};

use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

/// Result of handling one envelope.
#[derive(Debug)]
pub struct Processed {
    pub group: String,
    /// True when this envelope was the last one in flight for its group here.
    pub drained: bool,
    pub outcome: Result<()>,
}

/// Runs incoming envelopes through their stage instances.
pub struct StageRuntime {
    registry: Arc<StageRegistry>,
    groups: Arc<GroupStore>,
    outbox: Weak<dyn Outbox>,
}

impl StageRuntime {
    pub fn new(registry: Arc<StageRegistry>, groups: Arc<GroupStore>, outbox: Weak<dyn Outbox>) -> Self {
        Self {
            registry,
            groups,
            outbox,
        }
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// Handles one envelope and accounts for it on its group.
    ///
    /// A failing handler still counts as processed: the unit was consumed and
    /// termination must not wait for it.
    pub async fn handle(&self, envelope: WorkerEnvelope) -> Processed {
        let group = envelope.group.clone();

        if self.groups.is_finished(&group) {
            tracing::warn!(
                "Dropping unit for stage {} of already ended group {}",
                envelope.stage,
                group
            );
            return Processed {
                group,
                drained: false,
                outcome: Ok(()),
            };
        }

        let state = self.groups.open(&group);
        state.begin();
        let outcome = self.run(&state, envelope).await;
        let drained = state.complete();

        Processed {
            group,
            drained,
            outcome,
        }
    }

    async fn run(&self, state: &Arc<GroupState>, envelope: WorkerEnvelope) -> Result<()> {
        let stage = self
            .registry
            .get(&envelope.stage)
            .ok_or_else(|| ClusterError::UnknownStage(envelope.stage.clone()))?;

        let WorkerEnvelope {
            session,
            stage: stage_name,
            key,
            data,
            ..
        } = envelope;

        match (key, data) {
            (Some(key), Some(data)) => {
                let unit = unit_hash(&session, &stage_name, Some(&key));
                let slot = state.instance_slot(&unit);
                let instance = slot
                    .get_or_try_init(|| async {
                        let sender = StageSender::new(&session, state.clone(), self.outbox.clone());
                        let instance = stage
                            .instantiate(Some(key.clone()), sender)
                            .await
                            .map_err(|cause| application(&stage_name, cause))?;
                        self.groups.claim_unit(&unit);
                        tracing::debug!("Created instance of {} for key {}", stage_name, key);
                        Ok::<_, ClusterError>(Arc::new(Mutex::new(instance)))
                    })
                    .await?
                    .clone();

                let mut instance = instance.lock().await;
                let result = instance.on_data(data).await;
                result.map_err(|cause| application(&stage_name, cause))
            }
            (Some(key), None) => {
                let unit = unit_hash(&session, &stage_name, Some(&key));
                let Some(slot) = state.take_instance(&unit) else {
                    tracing::debug!("End of key {} on {} with no live instance", key, stage_name);
                    return Ok(());
                };
                self.groups.release_unit(&unit);
                match slot.get() {
                    Some(instance) => {
                        tracing::debug!("Finishing instance of {} for key {}", stage_name, key);
                        let mut instance = instance.lock().await;
                        let result = instance.on_finish().await;
                        result.map_err(|cause| application(&stage_name, cause))
                    }
                    None => Ok(()),
                }
            }
            (None, Some(data)) => {
                let sender = StageSender::new(&session, state.clone(), self.outbox.clone());
                let mut instance = instantiate(stage.as_ref(), &stage_name, sender).await?;
                let result = instance.on_data(data).await;
                result.map_err(|cause| application(&stage_name, cause))
            }
            (None, None) => {
                tracing::debug!("Ignoring keyless end-of-key for {}", stage_name);
                Ok(())
            }
        }
    }
}

async fn instantiate(
    stage: &dyn Stage,
    stage_name: &str,
    sender: StageSender,
) -> Result<Box<dyn StageInstance>> {
    stage
        .instantiate(None, sender)
        .await
        .map_err(|cause| application(stage_name, cause))
}

fn application(stage: &str, cause: anyhow::Error) -> ClusterError {
    ClusterError::Application {
        stage: stage.to_string(),
        cause,
    }
}
