pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HardwareMetrics {
    #[serde(default)]
    pub cpu_usage_percent: f64,
    #[serde(default)]
    pub memory_used_gb: f64,
    #[serde(default)]
    pub memory_total_gb: f64,
    #[serde(default)]
    pub memory_usage_percent: f64,
    #[serde(default)]
    pub disk_used_gb: f64,
    #[serde(default)]
    pub disk_total_gb: f64,
    #[serde(default)]
    pub disk_usage_percent: f64,
    #[serde(default)]
    pub load_avg_1m: f64,
    #[serde(default)]
    pub load_avg_5m: f64,
    #[serde(default)]
    pub load_avg_15m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerStatus {
    pub worker_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub search_type: String,
    #[serde(default)]
    pub search_params: Value,
    #[serde(default)]
    pub tested: u64,
    #[serde(default)]
    pub found: u64,
    #[serde(default, deserialize_with = "deserialize_nullable_string")]
    pub current: String,
    #[serde(default)]
    pub checkpoint: Option<Value>,
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default)]
    pub last_heartbeat_secs_ago: u64,
    #[serde(default)]
    pub metrics: Option<HardwareMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Fleet {
    #[serde(default)]
    pub workers: Vec<WorkerStatus>,
    #[serde(default)]
    pub total_workers: u64,
    #[serde(default)]
    pub total_cores: u64,
    #[serde(default)]
    pub total_tested: u64,
    #[serde(default)]
    pub total_found: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<ServerInfo>>,
}

impl Fleet {
    pub fn worker(&self, worker_id: &str) -> Option<&WorkerStatus> {
        self.workers.iter().find(|worker| worker.worker_id == worker_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Service,
    #[default]
    Compute,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Compute => "compute",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub hostname: String,
    #[serde(default)]
    pub role: ServerRole,
    #[serde(default)]
    pub metrics: Option<HardwareMetrics>,
    #[serde(default)]
    pub worker_ids: Vec<String>,
    #[serde(default)]
    pub cores: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorMetrics {
    #[serde(default)]
    pub hostname: String,
    pub metrics: HardwareMetrics,
}

/// Form-specific progress marker of the active search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Checkpoint {
    Factorial {
        start: u64,
        end: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    Primorial {
        start: u64,
        end: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    Kbn {
        min_n: u64,
        max_n: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    Twin {
        min_n: u64,
        max_n: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    SophieGermain {
        min_n: u64,
        max_n: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    CullenWoodall {
        min_n: u64,
        max_n: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    CarolKynea {
        min_n: u64,
        max_n: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    Wagstaff {
        min_n: u64,
        max_n: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    GenFermat {
        min_n: u64,
        max_n: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    Repunit {
        min_n: u64,
        max_n: u64,
        #[serde(default)]
        last_n: Option<u64>,
    },
    Palindromic {
        min_digits: u64,
        max_digits: u64,
        #[serde(default)]
        digit_count: Option<u64>,
    },
    NearRepdigit {
        min_digits: u64,
        max_digits: u64,
        #[serde(default)]
        digit_count: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusSummary {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub search_type: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub total_primes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Running,
    Paused,
    #[default]
    Pending,
    Completed,
    Cancelled,
    Failed,
    #[serde(other)]
    Unknown,
}

impl SearchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Pending)
    }
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "pending" | "queued" => Ok(Self::Pending),
            "completed" | "done" => Ok(Self::Completed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Unknown search status: {other}")),
        }
    }
}

/// Subprocess-managed search, lives only as long as the coordinator process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedSearch {
    pub id: u64,
    #[serde(default)]
    pub search_type: String,
    #[serde(default)]
    pub status: SearchStatus,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tested: u64,
    #[serde(default)]
    pub found: u64,
    #[serde(default)]
    pub params: Value,
}

/// Persisted search split into work blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchJob {
    pub id: i64,
    #[serde(default)]
    pub search_type: String,
    #[serde(default)]
    pub status: SearchStatus,
    #[serde(default)]
    pub range_start: u64,
    #[serde(default)]
    pub range_end: u64,
    #[serde(default)]
    pub block_size: u64,
    #[serde(default)]
    pub total_tested: u64,
    #[serde(default)]
    pub total_found: u64,
    #[serde(default)]
    pub blocks_total: u64,
    #[serde(default)]
    pub blocks_completed: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Deploying,
    Running,
    Paused,
    Failed,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl DeploymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: u64,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub search_type: String,
    #[serde(default)]
    pub search_params: Value,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentTaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl AgentTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for AgentTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentTaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "in-progress" | "inprogress" | "running" => Ok(Self::InProgress),
            "completed" | "done" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("Unknown agent task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl AgentPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for AgentPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTask {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: AgentTaskStatus,
    #[serde(default)]
    pub priority: AgentPriority,
    #[serde(default)]
    pub permission_level: u8,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub parent_task_id: Option<i64>,
    #[serde(default)]
    pub agent_model: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    pub id: i64,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentBudget {
    pub id: i64,
    #[serde(default)]
    pub period: BudgetPeriod,
    #[serde(default)]
    pub budget_usd: f64,
    #[serde(default)]
    pub spent_usd: f64,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRole {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permission_level: u8,
    #[serde(default)]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: u64,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workers report `current: null` while idle between candidates.
fn deserialize_nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_status_tolerates_partial_payload() {
        let worker: WorkerStatus = serde_json::from_str(
            r#"{
                "worker_id": "w-1",
                "hostname": "node-a",
                "cores": 8,
                "current": null,
                "tested": 42
            }"#,
        )
        .expect("parse worker");
        assert_eq!(worker.worker_id, "w-1");
        assert_eq!(worker.current, "");
        assert_eq!(worker.tested, 42);
        assert!(worker.metrics.is_none());
        assert_eq!(worker.search_params, Value::Null);
    }

    #[test]
    fn checkpoint_dispatches_on_form_tag() {
        let factorial: Checkpoint =
            serde_json::from_str(r#"{"type":"factorial","start":1000,"end":2000,"last_n":1500}"#)
                .expect("parse factorial");
        assert_eq!(
            factorial,
            Checkpoint::Factorial {
                start: 1000,
                end: 2000,
                last_n: Some(1500)
            }
        );

        let palindromic: Checkpoint = serde_json::from_str(
            r#"{"type":"palindromic","min_digits":11,"max_digits":21,"digit_count":15}"#,
        )
        .expect("parse palindromic");
        assert!(matches!(palindromic, Checkpoint::Palindromic { .. }));

        let other: Checkpoint =
            serde_json::from_str(r#"{"type":"fibonacci"}"#).expect("parse unknown form");
        assert_eq!(other, Checkpoint::Unknown);
    }

    #[test]
    fn status_enums_accept_unknown_values() {
        let search: ManagedSearch =
            serde_json::from_str(r#"{"id":3,"status":"exploded"}"#).expect("parse search");
        assert_eq!(search.status, SearchStatus::Unknown);

        let task: AgentTask =
            serde_json::from_str(r#"{"id":9,"status":"in_progress","priority":"urgent"}"#)
                .expect("parse task");
        assert_eq!(task.status, AgentTaskStatus::InProgress);
        assert_eq!(task.priority, AgentPriority::Urgent);
    }

    #[test]
    fn status_from_str_normalizes_aliases() {
        assert_eq!("Canceled".parse::<SearchStatus>(), Ok(SearchStatus::Cancelled));
        assert_eq!(
            "in-progress".parse::<AgentTaskStatus>(),
            Ok(AgentTaskStatus::InProgress)
        );
        assert!("sideways".parse::<SearchStatus>().is_err());
    }
}
