use crate::{
    AgentBudget, AgentEvent, AgentRole, AgentTask, AgentTemplate, CoordinatorMetrics, Deployment,
    Fleet, ManagedSearch, Notification, SearchJob, StatusSummary, WorkerStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Whole-fleet snapshots for large clusters run to hundreds of KiB. Matches the
/// websocket layer's own default frame limit.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    WorkerHeartbeat(WorkerStatus),
    Fleet(Fleet),
    Status(StatusSummary),
    Searches(Vec<ManagedSearch>),
    SearchJobs(Vec<SearchJob>),
    Deployments(Vec<Deployment>),
    AgentTasks(Vec<AgentTask>),
    AgentEvent(AgentEvent),
    AgentBudgets(Vec<AgentBudget>),
    AgentRoles(Vec<AgentRole>),
    AgentTemplates(Vec<AgentTemplate>),
    Notification(Notification),
    CoordinatorMetrics(CoordinatorMetrics),
}

impl WireMsg {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::WorkerHeartbeat(_) => MessageKind::WorkerHeartbeat,
            Self::Fleet(_) => MessageKind::Fleet,
            Self::Status(_) => MessageKind::Status,
            Self::Searches(_) => MessageKind::Searches,
            Self::SearchJobs(_) => MessageKind::SearchJobs,
            Self::Deployments(_) => MessageKind::Deployments,
            Self::AgentTasks(_) => MessageKind::AgentTasks,
            Self::AgentEvent(_) => MessageKind::AgentEvent,
            Self::AgentBudgets(_) => MessageKind::AgentBudgets,
            Self::AgentRoles(_) => MessageKind::AgentRoles,
            Self::AgentTemplates(_) => MessageKind::AgentTemplates,
            Self::Notification(_) => MessageKind::Notification,
            Self::CoordinatorMetrics(_) => MessageKind::CoordinatorMetrics,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    WorkerHeartbeat,
    Fleet,
    Status,
    Searches,
    SearchJobs,
    Deployments,
    AgentTasks,
    AgentEvent,
    AgentBudgets,
    AgentRoles,
    AgentTemplates,
    Notification,
    CoordinatorMetrics,
}

/// How a message of a given kind folds into the canonical snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    Replace,
    Upsert,
    Append,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        Self::WorkerHeartbeat,
        Self::Fleet,
        Self::Status,
        Self::Searches,
        Self::SearchJobs,
        Self::Deployments,
        Self::AgentTasks,
        Self::AgentEvent,
        Self::AgentBudgets,
        Self::AgentRoles,
        Self::AgentTemplates,
        Self::Notification,
        Self::CoordinatorMetrics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkerHeartbeat => "worker_heartbeat",
            Self::Fleet => "fleet",
            Self::Status => "status",
            Self::Searches => "searches",
            Self::SearchJobs => "search_jobs",
            Self::Deployments => "deployments",
            Self::AgentTasks => "agent_tasks",
            Self::AgentEvent => "agent_event",
            Self::AgentBudgets => "agent_budgets",
            Self::AgentRoles => "agent_roles",
            Self::AgentTemplates => "agent_templates",
            Self::Notification => "notification",
            Self::CoordinatorMetrics => "coordinator_metrics",
        }
    }

    pub fn merge_policy(self) -> MergePolicy {
        match self {
            Self::WorkerHeartbeat => MergePolicy::Upsert,
            Self::AgentEvent | Self::Notification => MergePolicy::Append,
            _ => MergePolicy::Replace,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == input)
            .ok_or_else(|| format!("Unknown message kind: {input}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame has no type discriminator")]
    MissingKind,
    #[error("unrecognized message type: {0}")]
    UnknownKind(String),
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_message(msg: &WireMsg, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(msg).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_message(raw: &str, max_frame_bytes: usize) -> Result<WireMsg, FrameError> {
    let raw = raw.trim_end_matches(['\n', '\r']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    decode_value(value)
}

/// Decodes an already parsed frame, checking the discriminator before the payload so
/// unknown kinds can be told apart from malformed ones.
pub fn decode_value(value: Value) -> Result<WireMsg, FrameError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingKind)?;
    if MessageKind::from_str(kind).is_err() {
        return Err(FrameError::UnknownKind(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|err| FrameError::Decode(err.to_string()))
}
