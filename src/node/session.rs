use super::node::Node;
use crate::error::{ClusterError, Result};
use crate::fabric::protocol::{Notice, NullAchieved, Question, StageQuery, WorkerEnvelope};
use crate::framing::{FramingOptions, LineReader};
use crate::ids::{SessionId, group_hash};
use crate::routing::{notify_all, race};

use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::watch;

/// A submitted session.
///
/// Completes once the root group has been ended on this node, which happens
/// after every descendant group has been announced.
#[derive(Debug)]
pub struct SessionHandle {
    pub session: SessionId,
    /// Root group, `group_hash(session, stage)`.
    pub group: String,
    /// Units sent into the root group, end-of-key sentinel included.
    pub units: u64,
    done: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Waits until the session's root group has ended.
    pub async fn finished(&mut self) -> Result<()> {
        self.done
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| ClusterError::ShuttingDown)
    }
}

impl Node {
    /// Streams `input` line by line into `stage` as a new session.
    ///
    /// With a `key` every line goes to the same keyed instance and an
    /// end-of-key sentinel follows the last one. Fails with
    /// `NoCapablePeer` when no member registers `stage`.
    pub async fn run_stream<R>(&self, stage: &str, key: Option<&str>, input: R) -> Result<SessionHandle>
    where
        R: AsyncRead + Unpin + Send,
    {
        let query = serde_json::to_value(StageQuery {
            stage: stage.to_string(),
        })?;
        if race(self, Question::GetStageServer, query).await.is_none() {
            return Err(ClusterError::NoCapablePeer {
                stage: stage.to_string(),
            });
        }

        let session = SessionId::new();
        let group = group_hash(&session.0, stage);
        let (done_tx, done) = watch::channel(false);
        self.sessions.insert(group.clone(), done_tx);
        tracing::info!("Session {} started on stage {} (root group {})", session, stage, group);

        let units = match self.feed(&session, &group, stage, key, input).await {
            Ok(units) => units,
            Err(e) => {
                self.sessions.remove(&group);
                return Err(e);
            }
        };

        tracing::info!("Session {} sent {} units", session, units);
        let total = serde_json::to_value(NullAchieved {
            group: group.clone(),
            total_sum: units,
        })?;
        notify_all(self, Notice::NullAchieved, total);

        Ok(SessionHandle {
            session,
            group,
            units,
            done,
        })
    }

    async fn feed<R>(
        &self,
        session: &SessionId,
        group: &str,
        stage: &str,
        key: Option<&str>,
        input: R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let envelope = |data: Option<Value>| WorkerEnvelope {
            session: session.0.clone(),
            group: group.to_string(),
            stage: stage.to_string(),
            key: key.map(str::to_string),
            data,
        };

        let mut reader = LineReader::new(input, FramingOptions::default());
        let mut units = 0;
        while let Some(line) = reader.next_line().await? {
            self.route(envelope(Some(Value::String(line)))).await?;
            units += 1;
        }
        if key.is_some() {
            self.route(envelope(None)).await?;
            units += 1;
        }
        Ok(units)
    }
}
