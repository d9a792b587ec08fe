use crate::error::Result;
use crate::fabric::protocol::{Notice, Question};

use futures::future::BoxFuture;
use serde_json::Value;

/// Control-plane access to every member of the cluster.
pub trait ClusterLink: Send + Sync {
    fn local_key(&self) -> &str;

    /// Every member, the local node included.
    fn member_keys(&self) -> Vec<String>;

    fn ask(&self, peer: &str, question: Question, data: Value) -> BoxFuture<'static, Result<Value>>;

    fn notify(&self, peer: &str, notice: Notice, data: Value) -> Result<()>;
}
