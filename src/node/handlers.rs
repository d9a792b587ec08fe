use super::node::Node;
use crate::error::{ClusterError, Result};
use crate::fabric::protocol::{ManagerReply, ManagerRequest, Question, WorkerEnvelope};
use crate::fabric::{Responder, ServerHooks};

use serde_json::Value;
use std::sync::{Arc, Weak};

/// Hooks of the worker listener and of the local inbox.
pub(crate) fn worker_hooks(node: Weak<Node>) -> ServerHooks {
    ServerHooks::new(move |value: Value, _responder: Responder| {
        on_worker_message(node.upgrade(), value)
    })
    .on_data_error(|e| match e {
        ClusterError::Application { .. } => tracing::error!("{}", e),
        e => tracing::warn!("Worker message dropped: {}", e),
    })
}

/// Hooks of the manager listener.
pub(crate) fn manager_hooks(node: Weak<Node>) -> ServerHooks {
    ServerHooks::new(move |value: Value, responder: Responder| {
        on_manager_message(node.upgrade(), value, responder)
    })
    .on_data_error(|e| tracing::warn!("Manager message dropped: {}", e))
}

async fn on_worker_message(node: Option<Arc<Node>>, value: Value) -> Result<()> {
    let node = node.ok_or(ClusterError::ShuttingDown)?;
    let envelope: WorkerEnvelope = serde_json::from_value(value)?;
    node.process(envelope).await
}

async fn on_manager_message(node: Option<Arc<Node>>, value: Value, responder: Responder) -> Result<()> {
    let node = node.ok_or(ClusterError::ShuttingDown)?;
    let request: ManagerRequest = serde_json::from_value(value)?;

    match request {
        ManagerRequest {
            id: Some(id),
            question: Some(question),
            data,
            ..
        } => {
            // Ending a group may wait on stage code; keep the socket moving.
            if question == Question::EndProcessing {
                tokio::spawn(async move {
                    if let Err(e) = reply(&node, &responder, id, question, data).await {
                        tracing::warn!("{} for {} failed: {}", question, responder.peer(), e);
                    }
                });
                return Ok(());
            }
            reply(&node, &responder, id, question, data).await
        }
        ManagerRequest {
            notice: Some(notice),
            data,
            ..
        } => {
            node.spawn_notice(notice, data);
            Ok(())
        }
        _ => Err(ClusterError::Protocol(<serde_json::Error as serde::de::Error>::custom(
            "manager message carries neither a question nor a notice",
        ))),
    }
}

/// Answers `question` and writes the reply. A failed answer still replies
/// `null` so the asker is not left waiting.
async fn reply(node: &Node, responder: &Responder, id: String, question: Question, data: Value) -> Result<()> {
    match node.answer(question, data).await {
        Ok(answer) => responder.reply(&ManagerReply { id, answer }),
        Err(e) => {
            responder.reply(&ManagerReply {
                id,
                answer: Value::Null,
            })?;
            Err(e)
        }
    }
}
