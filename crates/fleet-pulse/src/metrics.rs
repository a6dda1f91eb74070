//! Values derived from the raw snapshot. Nothing here is stored back into it.

use fleet_core::{
    AgentBudget, AgentTask, AgentTaskStatus, Checkpoint, CoordinatorMetrics, Fleet,
    HardwareMetrics, ManagedSearch, SearchJob, SearchStatus, ServerInfo, ServerRole,
    WorkerStatus,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    time::Duration,
};
use tokio::time::Instant;

pub const HEALTHY_BELOW_SECS: u64 = 30;
pub const STALE_BELOW_SECS: u64 = 60;
pub const STALL_THRESHOLD: Duration = Duration::from_secs(120);

const SYNTHETIC_COORDINATOR_HOSTNAME: &str = "coordinator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerHealth {
    Healthy,
    Stale,
    Offline,
}

impl WorkerHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Stale => "stale",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn worker_health(heartbeat_age_secs: u64) -> WorkerHealth {
    if heartbeat_age_secs < HEALTHY_BELOW_SECS {
        WorkerHealth::Healthy
    } else if heartbeat_age_secs < STALE_BELOW_SECS {
        WorkerHealth::Stale
    } else {
        WorkerHealth::Offline
    }
}

/// Reported age advanced by the local time since the report arrived, so a silent
/// backend still ages its workers.
pub fn effective_heartbeat_age(reported_secs: u64, elapsed_since_seen: Duration) -> u64 {
    reported_secs.saturating_add(elapsed_since_seen.as_secs())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStatus {
    Online,
    Degraded,
    Offline,
}

impl HostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn host_status(role: ServerRole, has_metrics: bool, workers: &[WorkerHealth]) -> HostStatus {
    match role {
        ServerRole::Service if has_metrics => HostStatus::Online,
        ServerRole::Service => HostStatus::Degraded,
        ServerRole::Compute => {
            let healthy = workers
                .iter()
                .filter(|health| **health == WorkerHealth::Healthy)
                .count();
            if healthy == 0 {
                HostStatus::Offline
            } else if healthy == workers.len() {
                HostStatus::Online
            } else {
                HostStatus::Degraded
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostNode {
    pub hostname: String,
    pub role: ServerRole,
    pub cores: u64,
    pub worker_ids: Vec<String>,
    pub metrics: Option<HardwareMetrics>,
    pub is_coordinator: bool,
    pub status: HostStatus,
}

/// Physical hosts with their workers. Backend `servers` grouping wins when present;
/// otherwise workers are grouped by hostname.
pub fn group_hosts(
    fleet: &Fleet,
    coordinator: Option<&CoordinatorMetrics>,
    health: &BTreeMap<String, WorkerHealth>,
) -> Vec<HostNode> {
    let health_of = |worker: &WorkerStatus| {
        health
            .get(&worker.worker_id)
            .copied()
            .unwrap_or_else(|| worker_health(worker.last_heartbeat_secs_ago))
    };

    let mut hosts: Vec<HostNode> = match &fleet.servers {
        Some(servers) => group_by_servers(fleet, servers, coordinator, health_of),
        None => group_by_hostname(fleet, coordinator, health_of),
    };

    hosts.sort_by(|a, b| {
        let a_front = a.is_coordinator || a.role == ServerRole::Service;
        let b_front = b.is_coordinator || b.role == ServerRole::Service;
        b_front
            .cmp(&a_front)
            .then_with(|| b.cores.cmp(&a.cores))
            .then_with(|| a.hostname.cmp(&b.hostname))
    });
    hosts
}

fn group_by_servers(
    fleet: &Fleet,
    servers: &[ServerInfo],
    coordinator: Option<&CoordinatorMetrics>,
    health_of: impl Fn(&WorkerStatus) -> WorkerHealth,
) -> Vec<HostNode> {
    let coordinator_host = coordinator.filter(|c| !c.hostname.is_empty());
    let mut hosts: Vec<HostNode> = servers
        .iter()
        .map(|server| {
            let healths: Vec<WorkerHealth> = server
                .worker_ids
                .iter()
                .filter_map(|id| fleet.worker(id))
                .map(&health_of)
                .collect();
            let coordinator_here = coordinator_host.filter(|c| c.hostname == server.hostname);
            let metrics = server
                .metrics
                .clone()
                .or_else(|| coordinator_here.map(|c| c.metrics.clone()));
            HostNode {
                hostname: server.hostname.clone(),
                role: server.role,
                cores: server.cores,
                worker_ids: server.worker_ids.clone(),
                status: host_status(server.role, metrics.is_some(), &healths),
                metrics,
                is_coordinator: server.role == ServerRole::Service || coordinator_here.is_some(),
            }
        })
        .collect();

    let placed = coordinator_host
        .is_some_and(|c| servers.iter().any(|server| server.hostname == c.hostname));
    if let Some(coordinator) = coordinator.filter(|_| !placed) {
        hosts.push(coordinator_node(coordinator));
    }
    hosts
}

fn group_by_hostname(
    fleet: &Fleet,
    coordinator: Option<&CoordinatorMetrics>,
    health_of: impl Fn(&WorkerStatus) -> WorkerHealth,
) -> Vec<HostNode> {
    let mut by_host: BTreeMap<&str, Vec<&WorkerStatus>> = BTreeMap::new();
    for worker in &fleet.workers {
        by_host.entry(worker.hostname.as_str()).or_default().push(worker);
    }
    let sole_host = by_host.len() == 1;

    let mut hosts: Vec<HostNode> = by_host
        .into_iter()
        .map(|(hostname, workers)| {
            let healths: Vec<WorkerHealth> = workers.iter().map(|w| health_of(*w)).collect();
            let mut metrics = workers.iter().find_map(|w| w.metrics.clone());
            let is_coordinator = sole_host && coordinator.is_some();
            if is_coordinator {
                metrics = coordinator.map(|c| c.metrics.clone());
            }
            HostNode {
                hostname: hostname.to_string(),
                role: ServerRole::Compute,
                cores: workers.iter().map(|w| u64::from(w.cores)).sum(),
                worker_ids: workers.iter().map(|w| w.worker_id.clone()).collect(),
                status: host_status(ServerRole::Compute, metrics.is_some(), &healths),
                metrics,
                is_coordinator,
            }
        })
        .collect();

    if let Some(coordinator) = coordinator.filter(|_| !sole_host) {
        hosts.push(coordinator_node(coordinator));
    }
    hosts
}

/// Service node for coordinator metrics that belong to no known host.
fn coordinator_node(coordinator: &CoordinatorMetrics) -> HostNode {
    let hostname = if coordinator.hostname.is_empty() {
        SYNTHETIC_COORDINATOR_HOSTNAME.to_string()
    } else {
        coordinator.hostname.clone()
    };
    HostNode {
        hostname,
        role: ServerRole::Service,
        cores: 0,
        worker_ids: Vec::new(),
        metrics: Some(coordinator.metrics.clone()),
        is_coordinator: true,
        status: host_status(ServerRole::Service, true, &[]),
    }
}

/// Workers absent from every backend server group. Empty when the backend sends no groups.
pub fn orphaned_workers(fleet: &Fleet) -> Vec<String> {
    let Some(servers) = &fleet.servers else {
        return Vec::new();
    };
    let grouped: BTreeSet<&str> = servers
        .iter()
        .flat_map(|server| server.worker_ids.iter().map(String::as_str))
        .collect();
    fleet
        .workers
        .iter()
        .filter(|worker| !grouped.contains(worker.worker_id.as_str()))
        .map(|worker| worker.worker_id.clone())
        .collect()
}

/// Candidates tested per second over the worker's uptime.
pub fn worker_throughput(worker: &WorkerStatus) -> f64 {
    if worker.uptime_secs == 0 {
        return 0.0;
    }
    worker.tested as f64 / worker.uptime_secs as f64
}

pub fn fleet_throughput(fleet: &Fleet) -> f64 {
    fleet.workers.iter().map(worker_throughput).sum()
}

/// Percentage through the search range, clamped to `[0, 100]`.
pub fn checkpoint_progress(checkpoint: &Checkpoint) -> Option<f64> {
    match checkpoint {
        Checkpoint::Factorial { start, end, last_n }
        | Checkpoint::Primorial { start, end, last_n } => range_percent(*start, *end, *last_n),
        Checkpoint::Kbn { min_n, max_n, last_n }
        | Checkpoint::Twin { min_n, max_n, last_n }
        | Checkpoint::SophieGermain { min_n, max_n, last_n }
        | Checkpoint::CullenWoodall { min_n, max_n, last_n }
        | Checkpoint::CarolKynea { min_n, max_n, last_n }
        | Checkpoint::Wagstaff { min_n, max_n, last_n }
        | Checkpoint::GenFermat { min_n, max_n, last_n }
        | Checkpoint::Repunit { min_n, max_n, last_n } => range_percent(*min_n, *max_n, *last_n),
        Checkpoint::Palindromic {
            min_digits,
            max_digits,
            digit_count,
        }
        | Checkpoint::NearRepdigit {
            min_digits,
            max_digits,
            digit_count,
        } => range_percent(*min_digits, *max_digits, *digit_count),
        Checkpoint::Unknown => None,
    }
}

fn range_percent(start: u64, end: u64, current: Option<u64>) -> Option<f64> {
    if end <= start {
        return None;
    }
    let current = current.unwrap_or(start);
    let percent = (current as f64 - start as f64) / (end - start) as f64 * 100.0;
    Some(percent.clamp(0.0, 100.0))
}

/// Remembers when each worker's `tested` counter last moved.
#[derive(Debug, Clone)]
pub struct StallTracker {
    threshold: Duration,
    progress: HashMap<String, (u64, Instant)>,
}

impl Default for StallTracker {
    fn default() -> Self {
        Self::new(STALL_THRESHOLD)
    }
}

impl StallTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            progress: HashMap::new(),
        }
    }

    pub fn observe(&mut self, fleet: &Fleet, now: Instant) {
        self.progress
            .retain(|id, _| fleet.workers.iter().any(|worker| &worker.worker_id == id));
        for worker in &fleet.workers {
            self.progress
                .entry(worker.worker_id.clone())
                .and_modify(|(tested, since)| {
                    // A lower counter means the worker restarted.
                    if worker.tested != *tested {
                        *tested = worker.tested;
                        *since = now;
                    }
                })
                .or_insert((worker.tested, now));
        }
    }

    /// Workers whose counter has not moved for the threshold and that are not offline.
    pub fn stalled(&self, health: &BTreeMap<String, WorkerHealth>, now: Instant) -> BTreeSet<String> {
        self.progress
            .iter()
            .filter(|(id, _)| health.get(*id) != Some(&WorkerHealth::Offline))
            .filter(|(_, (_, since))| now.saturating_duration_since(*since) >= self.threshold)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCounts {
    pub healthy: usize,
    pub stale: usize,
    pub offline: usize,
}

pub fn health_counts(health: &BTreeMap<String, WorkerHealth>) -> HealthCounts {
    health
        .values()
        .fold(HealthCounts::default(), |mut counts, health| {
            match health {
                WorkerHealth::Healthy => counts.healthy += 1,
                WorkerHealth::Stale => counts.stale += 1,
                WorkerHealth::Offline => counts.offline += 1,
            }
            counts
        })
}

pub fn running_agents(tasks: &[AgentTask]) -> Vec<&AgentTask> {
    tasks
        .iter()
        .filter(|task| task.status == AgentTaskStatus::InProgress)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSource {
    Managed,
    Job,
}

impl SearchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::Job => "job",
        }
    }
}

/// One line of the combined search list. `id` is only unique within its `source`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRow {
    pub source: SearchSource,
    pub id: i64,
    pub search_type: String,
    pub status: SearchStatus,
    pub tested: u64,
    pub found: u64,
    pub progress: Option<f64>,
}

pub fn search_rows(searches: &[ManagedSearch], jobs: &[SearchJob]) -> Vec<SearchRow> {
    let managed = searches.iter().map(|search| SearchRow {
        source: SearchSource::Managed,
        id: i64::try_from(search.id).unwrap_or(i64::MAX),
        search_type: search.search_type.clone(),
        status: search.status,
        tested: search.tested,
        found: search.found,
        progress: None,
    });
    let persisted = jobs.iter().map(|job| SearchRow {
        source: SearchSource::Job,
        id: job.id,
        search_type: job.search_type.clone(),
        status: job.status,
        tested: job.total_tested,
        found: job.total_found,
        progress: (job.blocks_total > 0).then(|| {
            (job.blocks_completed as f64 / job.blocks_total as f64 * 100.0).clamp(0.0, 100.0)
        }),
    });
    let mut rows: Vec<SearchRow> = managed.chain(persisted).collect();
    rows.sort_by_key(|row| !row.status.is_active());
    rows
}

/// Subtasks keyed by parent id, in snapshot order.
pub fn task_children(tasks: &[AgentTask]) -> BTreeMap<i64, Vec<&AgentTask>> {
    let mut children: BTreeMap<i64, Vec<&AgentTask>> = BTreeMap::new();
    for task in tasks {
        if let Some(parent) = task.parent_task_id {
            children.entry(parent).or_default().push(task);
        }
    }
    children
}

/// Spent share of the budget in percent; may exceed 100 when overspent.
pub fn budget_utilization(budget: &AgentBudget) -> Option<f64> {
    (budget.budget_usd > 0.0).then(|| budget.spent_usd / budget.budget_usd * 100.0)
}
