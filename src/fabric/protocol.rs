//! Wire Protocol Definitions
//!
//! Every socket carries newline-delimited JSON. Worker sockets carry
//! `WorkerEnvelope`s; manager sockets carry `ManagerRequest`s one way and
//! `ManagerReply`s back. Listeners also answer every queued line with a
//! cumulative `Ack`, on both roles, so senders know what they may forget.
//!
//! `END_PROCESSING` is an ask, not a notice: the caller waits for the
//! member's `GroupSummary` before it cascades `NULL_ACHIEVED` to the
//! child groups that summary names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// One unit of work travelling between stages.
///
/// A missing `data` field is the end-of-key sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub session: String,
    pub group: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WorkerEnvelope {
    pub fn is_end_of_key(&self) -> bool {
        self.data.is_none()
    }
}

/// Cumulative receipt: the first `ack` lines read from this socket have
/// been queued by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ack {
    pub ack: u64,
}

/// Asks expect exactly one reply carrying the request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Question {
    GetStageServer,
    GetSessionStageKeyServer,
    CountProcessed,
    CanGetStage,
    EndProcessing,
}

impl Question {
    pub fn as_str(&self) -> &'static str {
        match self {
            Question::GetStageServer => "GET_STAGE_SERVER",
            Question::GetSessionStageKeyServer => "GET_SESSION_STAGE_KEY_SERVER",
            Question::CountProcessed => "COUNT_PROCESSED",
            Question::CanGetStage => "CAN_GET_STAGE",
            Question::EndProcessing => "END_PROCESSING",
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fire-and-forget control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notice {
    NullAchieved,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::NullAchieved => f.write_str("NULL_ACHIEVED"),
        }
    }
}

/// Control-plane request: an ask when `id` is present, a notice otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<Notice>,
    #[serde(default)]
    pub data: Value,
}

impl ManagerRequest {
    pub fn ask(id: String, question: Question, data: Value) -> Self {
        Self {
            id: Some(id),
            question: Some(question),
            notice: None,
            data,
        }
    }

    pub fn notify(notice: Notice, data: Value) -> Self {
        Self {
            id: None,
            question: None,
            notice: Some(notice),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerReply {
    pub id: String,
    #[serde(default)]
    pub answer: Value,
}

// --- Payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageQuery {
    pub stage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitQuery {
    pub session: String,
    pub stage: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupQuery {
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullAchieved {
    pub group: String,
    #[serde(rename = "totalSum")]
    pub total_sum: u64,
}

/// What one node reports when a group ends there: how many units of the group
/// it processed and how many units it sent into each child group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub processed: u64,
    #[serde(default)]
    pub children: BTreeMap<String, u64>,
}
