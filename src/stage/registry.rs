//! Stage Registry
//!
//! Maps stage names to stage implementations. Nodes answer `CAN_GET_STAGE`
//! and `GET_STAGE_SERVER` from this map, so registering a stage is what makes
//! a node eligible to run it.

use super::sender::StageSender;
use super::types::{Handler, Stage, StageInstance};

use anyhow::Result;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Type-erased stage factory built from a closure.
pub type StageFn = Arc<
    dyn Fn(Option<String>, StageSender) -> BoxFuture<'static, Result<Box<dyn StageInstance>>>
        + Send
        + Sync,
>;

struct FnStage(StageFn);

impl Stage for FnStage {
    fn instantiate(
        &self,
        key: Option<String>,
        send: StageSender,
    ) -> BoxFuture<'static, Result<Box<dyn StageInstance>>> {
        (self.0)(key, send)
    }
}

#[derive(Default)]
pub struct StageRegistry {
    stages: DashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a closure `(key, send) -> Handler` under `name`.
    pub fn register<F, Fut>(&self, name: &str, factory: F)
    where
        F: Fn(Option<String>, StageSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Handler>> + Send + 'static,
    {
        let stage_fn: StageFn = Arc::new(move |key, send| {
            let handler = factory(key, send);
            Box::pin(async move {
                let handler = handler.await?;
                Ok::<Box<dyn StageInstance>, anyhow::Error>(Box::new(handler))
            })
        });
        self.register_stage(name, FnStage(stage_fn));
    }

    pub fn register_stage<S: Stage + 'static>(&self, name: &str, stage: S) {
        self.stages.insert(name.to_string(), Arc::new(stage));
        tracing::info!("Registered stage: {}", name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).map(|entry| entry.value().clone())
    }

    pub fn has_stage(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Registered stage names, sorted.
    pub fn stage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}
