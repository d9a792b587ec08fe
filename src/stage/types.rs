use super::sender::StageSender;

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;

/// One instantiation of a stage for a `(session, stage, key)` unit.
pub trait StageInstance: Send {
    fn on_data(&mut self, data: Value) -> BoxFuture<'_, Result<()>>;

    /// Runs once when the key ends or the instance's group ends.
    fn on_finish(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// A named, cluster-addressable unit of processing logic.
pub trait Stage: Send + Sync {
    /// Builds an instance. Construction may suspend (e.g. to load resources).
    fn instantiate(
        &self,
        key: Option<String>,
        send: StageSender,
    ) -> BoxFuture<'static, Result<Box<dyn StageInstance>>>;
}

type DataFn = Box<dyn FnMut(Value) -> BoxFuture<'static, Result<()>> + Send>;
type FinishFn = Box<dyn FnMut() -> BoxFuture<'static, Result<()>> + Send>;

/// Closure-backed instance: an `on_data` callback and an optional `on_finish`.
///
/// State shared between the two callbacks goes in an `Arc` captured by both.
pub struct Handler {
    on_data: DataFn,
    on_finish: Option<FinishFn>,
}

impl Handler {
    pub fn new<F, Fut>(mut on_data: F) -> Self
    where
        F: FnMut(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            on_data: Box::new(move |data| Box::pin(on_data(data))),
            on_finish: None,
        }
    }

    pub fn with_finish<F, Fut>(mut self, mut on_finish: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_finish = Some(Box::new(move || Box::pin(on_finish())));
        self
    }
}

impl StageInstance for Handler {
    fn on_data(&mut self, data: Value) -> BoxFuture<'_, Result<()>> {
        (self.on_data)(data)
    }

    fn on_finish(&mut self) -> BoxFuture<'_, Result<()>> {
        match self.on_finish.as_mut() {
            Some(on_finish) => on_finish(),
            None => Box::pin(async { Ok(()) }),
        }
    }
}
