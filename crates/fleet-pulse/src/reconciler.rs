use crate::metrics::effective_heartbeat_age;
use fleet_core::{
    wire::WireMsg, AgentBudget, AgentEvent, AgentRole, AgentTask, AgentTemplate,
    CoordinatorMetrics, Deployment, Fleet, ManagedSearch, Notification, SearchJob,
    StatusSummary, WorkerStatus,
};
use std::{collections::HashMap, sync::Arc};
use tokio::time::Instant;

pub const MAX_LOG_ENTRIES: usize = 200;

/// Canonical state, one `Arc` per entity kind so untouched kinds keep their identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetSnapshot {
    pub status: Option<Arc<StatusSummary>>,
    pub fleet: Arc<Fleet>,
    pub coordinator: Option<Arc<CoordinatorMetrics>>,
    pub searches: Arc<Vec<ManagedSearch>>,
    pub search_jobs: Arc<Vec<SearchJob>>,
    pub deployments: Arc<Vec<Deployment>>,
    pub agent_tasks: Arc<Vec<AgentTask>>,
    pub agent_events: Arc<Vec<AgentEvent>>,
    pub agent_budgets: Arc<Vec<AgentBudget>>,
    pub agent_roles: Arc<Vec<AgentRole>>,
    pub agent_templates: Arc<Vec<AgentTemplate>>,
    pub notifications: Arc<Vec<Notification>>,
}

/// When this client last heard something new about each worker.
pub type SeenAt = Arc<HashMap<String, Instant>>;

#[derive(Debug)]
pub struct Reconciler {
    snapshot: FleetSnapshot,
    seen_at: SeenAt,
    log_cap: usize,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::from_snapshot(FleetSnapshot::default(), SeenAt::default(), Instant::now())
    }

    /// Resumes from a previously published snapshot and the instants its workers were
    /// last seen. Workers with no recorded instant count as seen `now`.
    pub fn from_snapshot(snapshot: FleetSnapshot, mut seen_at: SeenAt, now: Instant) -> Self {
        let known = Arc::make_mut(&mut seen_at);
        known.retain(|id, _| snapshot.fleet.worker(id).is_some());
        for worker in &snapshot.fleet.workers {
            known.entry(worker.worker_id.clone()).or_insert(now);
        }
        Self {
            snapshot,
            seen_at,
            log_cap: MAX_LOG_ENTRIES,
        }
    }

    pub fn with_log_cap(mut self, log_cap: usize) -> Self {
        self.log_cap = log_cap.max(1);
        self
    }

    pub fn snapshot(&self) -> &FleetSnapshot {
        &self.snapshot
    }

    pub fn seen_at(&self) -> &SeenAt {
        &self.seen_at
    }

    /// Folds one message into the snapshot. Returns whether anything visible changed.
    pub fn apply(&mut self, msg: WireMsg, now: Instant) -> bool {
        let snapshot = &mut self.snapshot;
        match msg {
            WireMsg::WorkerHeartbeat(worker) => {
                let worker_id = worker.worker_id.clone();
                let changed = upsert_worker(&mut snapshot.fleet, worker);
                // Redelivered reports carry no news.
                if changed {
                    Arc::make_mut(&mut self.seen_at).insert(worker_id, now);
                }
                changed
            }
            WireMsg::Fleet(fleet) => {
                let seen_at = Arc::make_mut(&mut self.seen_at);
                seen_at.retain(|id, _| fleet.worker(id).is_some());
                for worker in &fleet.workers {
                    let unchanged = snapshot.fleet.worker(&worker.worker_id) == Some(worker);
                    if !unchanged || !seen_at.contains_key(&worker.worker_id) {
                        seen_at.insert(worker.worker_id.clone(), now);
                    }
                }
                replace(&mut snapshot.fleet, fleet)
            }
            WireMsg::Status(status) => replace_opt(&mut snapshot.status, status),
            WireMsg::CoordinatorMetrics(coordinator) => {
                replace_opt(&mut snapshot.coordinator, coordinator)
            }
            WireMsg::Searches(searches) => replace(&mut snapshot.searches, searches),
            WireMsg::SearchJobs(jobs) => replace(&mut snapshot.search_jobs, jobs),
            WireMsg::Deployments(deployments) => replace(&mut snapshot.deployments, deployments),
            WireMsg::AgentTasks(tasks) => replace(&mut snapshot.agent_tasks, tasks),
            WireMsg::AgentBudgets(budgets) => replace(&mut snapshot.agent_budgets, budgets),
            WireMsg::AgentRoles(roles) => replace(&mut snapshot.agent_roles, roles),
            WireMsg::AgentTemplates(templates) => {
                replace(&mut snapshot.agent_templates, templates)
            }
            WireMsg::AgentEvent(event) => {
                append_unique(&mut snapshot.agent_events, event, |e| e.id, self.log_cap)
            }
            WireMsg::Notification(notification) => append_unique(
                &mut snapshot.notifications,
                notification,
                |n| n.id,
                self.log_cap,
            ),
        }
    }

    /// Reported heartbeat age plus the time since this client last heard about the worker.
    pub fn heartbeat_age(&self, worker: &WorkerStatus, now: Instant) -> u64 {
        let elapsed = self
            .seen_at
            .get(&worker.worker_id)
            .map(|seen| now.saturating_duration_since(*seen))
            .unwrap_or_default();
        effective_heartbeat_age(worker.last_heartbeat_secs_ago, elapsed)
    }
}

fn replace<T: PartialEq>(slot: &mut Arc<T>, value: T) -> bool {
    if **slot == value {
        return false;
    }
    *slot = Arc::new(value);
    true
}

fn replace_opt<T: PartialEq>(slot: &mut Option<Arc<T>>, value: T) -> bool {
    match slot {
        Some(current) if **current == value => false,
        _ => {
            *slot = Some(Arc::new(value));
            true
        }
    }
}

fn upsert_worker(fleet: &mut Arc<Fleet>, worker: WorkerStatus) -> bool {
    let position = fleet
        .workers
        .iter()
        .position(|existing| existing.worker_id == worker.worker_id);
    if let Some(index) = position {
        if fleet.workers[index] == worker {
            return false;
        }
    }
    let fleet = Arc::make_mut(fleet);
    match position {
        Some(index) => fleet.workers[index] = worker,
        None => fleet.workers.push(worker),
    }
    recompute_totals(fleet);
    true
}

fn recompute_totals(fleet: &mut Fleet) {
    fleet.total_workers = fleet.workers.len() as u64;
    fleet.total_cores = fleet.workers.iter().map(|w| u64::from(w.cores)).sum();
    fleet.total_tested = fleet.workers.iter().map(|w| w.tested).sum();
    fleet.total_found = fleet.workers.iter().map(|w| w.found).sum();
}

fn append_unique<T, K, F>(slot: &mut Arc<Vec<T>>, item: T, key: F, cap: usize) -> bool
where
    T: Clone,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let item_key = key(&item);
    if slot.iter().any(|existing| key(existing) == item_key) {
        return false;
    }
    let list = Arc::make_mut(slot);
    list.push(item);
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;

    fn worker(id: &str, host: &str, tested: u64) -> WorkerStatus {
        WorkerStatus {
            worker_id: id.to_string(),
            hostname: host.to_string(),
            cores: 4,
            search_type: "kbn".to_string(),
            search_params: Value::Null,
            tested,
            found: 0,
            current: String::new(),
            checkpoint: None,
            uptime_secs: 60,
            last_heartbeat_secs_ago: 1,
            metrics: None,
        }
    }

    fn notification(id: u64) -> Notification {
        Notification {
            id,
            kind: "prime".to_string(),
            title: format!("prime #{id}"),
            details: Vec::new(),
            timestamp: None,
        }
    }

    fn fleet_of(workers: Vec<WorkerStatus>) -> Fleet {
        let mut fleet = Fleet {
            workers,
            ..Fleet::default()
        };
        recompute_totals(&mut fleet);
        fleet
    }

    #[test]
    fn replaying_replace_messages_is_idempotent() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new();
        let msg = WireMsg::Fleet(fleet_of(vec![worker("w-1", "a", 10)]));
        assert!(reconciler.apply(msg.clone(), now));
        let before = reconciler.snapshot().clone();
        assert!(!reconciler.apply(msg, now));
        assert_eq!(reconciler.snapshot(), &before);
        assert!(Arc::ptr_eq(&before.fleet, &reconciler.snapshot().fleet));
    }

    #[test]
    fn heartbeat_creates_then_updates_without_removing() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new();
        reconciler.apply(WireMsg::Fleet(fleet_of(vec![worker("w-1", "a", 10)])), now);

        assert!(reconciler.apply(WireMsg::WorkerHeartbeat(worker("w-2", "b", 5)), now));
        assert!(reconciler.apply(WireMsg::WorkerHeartbeat(worker("w-1", "a", 20)), now));
        assert!(!reconciler.apply(WireMsg::WorkerHeartbeat(worker("w-1", "a", 20)), now));

        let fleet = &reconciler.snapshot().fleet;
        assert_eq!(fleet.workers.len(), 2);
        assert_eq!(fleet.worker("w-1").map(|w| w.tested), Some(20));
        assert_eq!(fleet.total_workers, 2);
        assert_eq!(fleet.total_tested, 25);
    }

    #[test]
    fn fleet_replace_drops_omitted_workers() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new();
        reconciler.apply(
            WireMsg::Fleet(fleet_of(vec![worker("w-1", "a", 1), worker("w-2", "b", 1)])),
            now,
        );
        reconciler.apply(WireMsg::Fleet(fleet_of(vec![worker("w-2", "b", 2)])), now);
        let fleet = &reconciler.snapshot().fleet;
        assert!(fleet.worker("w-1").is_none());
        assert_eq!(fleet.workers.len(), 1);
    }

    #[test]
    fn notifications_are_deduplicated_by_id() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new();
        assert!(reconciler.apply(WireMsg::Notification(notification(1)), now));
        assert!(reconciler.apply(WireMsg::Notification(notification(2)), now));
        assert!(!reconciler.apply(WireMsg::Notification(notification(1)), now));
        let ids: Vec<u64> = reconciler
            .snapshot()
            .notifications
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn append_log_evicts_oldest_beyond_cap() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new().with_log_cap(3);
        for id in 1..=5 {
            reconciler.apply(WireMsg::Notification(notification(id)), now);
        }
        let ids: Vec<u64> = reconciler
            .snapshot()
            .notifications
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn unrelated_kinds_keep_identity() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new();
        reconciler.apply(WireMsg::Fleet(fleet_of(vec![worker("w-1", "a", 1)])), now);
        reconciler.apply(WireMsg::Notification(notification(1)), now);
        let before = reconciler.snapshot().clone();

        reconciler.apply(WireMsg::Notification(notification(2)), now);
        let after = reconciler.snapshot();
        assert!(Arc::ptr_eq(&before.fleet, &after.fleet));
        assert!(Arc::ptr_eq(&before.searches, &after.searches));
        assert!(!Arc::ptr_eq(&before.notifications, &after.notifications));
    }

    #[test]
    fn replayed_heartbeat_does_not_refresh_local_age() {
        let start = Instant::now();
        let mut reconciler = Reconciler::new();
        let w = worker("w-1", "a", 1);
        reconciler.apply(WireMsg::WorkerHeartbeat(w.clone()), start);

        let later = start + Duration::from_secs(45);
        assert!(!reconciler.apply(WireMsg::WorkerHeartbeat(w.clone()), later));
        assert!(!reconciler.apply(WireMsg::Fleet(fleet_of(vec![w.clone()])), later));
        assert_eq!(reconciler.heartbeat_age(&w, later), 46);

        let progressed = worker("w-1", "a", 2);
        assert!(reconciler.apply(WireMsg::WorkerHeartbeat(progressed.clone()), later));
        assert_eq!(reconciler.heartbeat_age(&progressed, later), 1);
    }

    #[test]
    fn resumed_reconciler_keeps_last_seen_instants() {
        let start = Instant::now();
        let mut first = Reconciler::new();
        let w = worker("w-1", "a", 1);
        first.apply(WireMsg::Fleet(fleet_of(vec![w.clone()])), start);

        let resumed_at = start + Duration::from_secs(600);
        let resumed = Reconciler::from_snapshot(
            first.snapshot().clone(),
            first.seen_at().clone(),
            resumed_at,
        );
        assert_eq!(resumed.heartbeat_age(&w, resumed_at), 601);

        let fresh =
            Reconciler::from_snapshot(first.snapshot().clone(), SeenAt::default(), resumed_at);
        assert_eq!(fresh.heartbeat_age(&w, resumed_at), 1);
    }

    #[test]
    fn heartbeat_age_grows_with_local_time() {
        let start = Instant::now();
        let mut reconciler = Reconciler::new();
        let w = worker("w-1", "a", 1);
        reconciler.apply(WireMsg::WorkerHeartbeat(w.clone()), start);
        assert_eq!(reconciler.heartbeat_age(&w, start), 1);
        assert_eq!(
            reconciler.heartbeat_age(&w, start + Duration::from_secs(40)),
            41
        );
    }
}
