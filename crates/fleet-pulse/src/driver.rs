use crate::{
    metrics::{orphaned_workers, worker_health, StallTracker, WorkerHealth},
    reconciler::{FleetSnapshot, Reconciler, SeenAt},
    transport::TransportEvent,
};
use fleet_core::{wire::MessageKind, ConnectionState};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub const HEALTH_TICK: Duration = Duration::from_secs(1);
pub const STALL_TICK: Duration = Duration::from_secs(2);
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Everything a consumer reads: the canonical snapshot plus values derived from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetView {
    pub snapshot: FleetSnapshot,
    pub health: Arc<BTreeMap<String, WorkerHealth>>,
    pub stalled: Arc<BTreeSet<String>>,
    pub connection: ConnectionState,
    pub revision: u64,
    /// Carried so a later driver keeps aging workers from when they were really seen.
    pub(crate) seen_at: SeenAt,
}

/// State shared between the context and whichever driver is current.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) view_tx: watch::Sender<FleetView>,
    /// Bumped on every teardown; a driver whose generation is stale may no longer publish.
    pub(crate) generation: AtomicU64,
    #[cfg(test)]
    pub(crate) timer_ticks: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (view_tx, _) = watch::channel(FleetView::default());
        Self {
            view_tx,
            generation: AtomicU64::new(0),
            #[cfg(test)]
            timer_ticks: AtomicU64::new(0),
        }
    }

    fn record_tick(&self) {
        #[cfg(test)]
        self.timer_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn current(&self) -> FleetView {
        self.view_tx.borrow().clone()
    }

    /// Invalidates the running driver and marks the retained view disconnected.
    pub(crate) fn retire(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.view_tx.send_if_modified(|view| {
            if view.connection == ConnectionState::Disconnected {
                return false;
            }
            view.connection = ConnectionState::Disconnected;
            view.revision += 1;
            true
        });
    }
}

/// Sole writer of the canonical snapshot for one subscription lifetime.
pub(crate) struct SyncDriver {
    shared: Arc<Shared>,
    generation: u64,
    reconciler: Reconciler,
    stalls: StallTracker,
    orphans: BTreeSet<String>,
    view: FleetView,
}

impl SyncDriver {
    /// Seeds from the last published view so a resubscribe starts from known state.
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let view = shared.current();
        let generation = shared.generation.load(Ordering::SeqCst);
        let now = Instant::now();
        let reconciler =
            Reconciler::from_snapshot(view.snapshot.clone(), view.seen_at.clone(), now);
        let mut stalls = StallTracker::default();
        stalls.observe(&view.snapshot.fleet, now);
        Self {
            shared,
            generation,
            reconciler,
            stalls,
            orphans: BTreeSet::new(),
            view,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) {
        let mut health_tick = tokio::time::interval(HEALTH_TICK);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stall_tick = tokio::time::interval(STALL_TICK);
        stall_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else {
                        break;
                    };
                    if self.handle_event(event, Instant::now()) {
                        self.publish();
                    }
                }
                _ = health_tick.tick() => {
                    self.shared.record_tick();
                    if self.refresh_health(Instant::now()) {
                        self.publish();
                    }
                }
                _ = stall_tick.tick() => {
                    self.shared.record_tick();
                    if self.refresh_stalls(Instant::now()) {
                        self.publish();
                    }
                }
            }
        }
        debug!(event = "sync_driver_stopped", revision = self.view.revision);
    }

    /// Returns whether the view needs republishing.
    fn handle_event(&mut self, event: TransportEvent, now: Instant) -> bool {
        match event {
            TransportEvent::State(state) => {
                if state == self.view.connection {
                    return false;
                }
                info!(event = "connection_state", from = %self.view.connection, to = %state);
                self.view.connection = state;
                true
            }
            TransportEvent::Message(msg) => {
                let kind = msg.kind();
                if !self.reconciler.apply(msg, now) {
                    return false;
                }
                self.view.snapshot = self.reconciler.snapshot().clone();
                self.view.seen_at = self.reconciler.seen_at().clone();
                if matches!(kind, MessageKind::Fleet | MessageKind::WorkerHeartbeat) {
                    self.stalls.observe(&self.view.snapshot.fleet, now);
                    self.refresh_health(now);
                    if kind == MessageKind::Fleet {
                        self.report_orphans();
                    }
                }
                true
            }
        }
    }

    fn refresh_health(&mut self, now: Instant) -> bool {
        let health: BTreeMap<String, WorkerHealth> = self
            .view
            .snapshot
            .fleet
            .workers
            .iter()
            .map(|worker| {
                let age = self.reconciler.heartbeat_age(worker, now);
                (worker.worker_id.clone(), worker_health(age))
            })
            .collect();
        if *self.view.health == health {
            return false;
        }
        self.view.health = Arc::new(health);
        true
    }

    fn refresh_stalls(&mut self, now: Instant) -> bool {
        self.stalls.observe(&self.view.snapshot.fleet, now);
        let stalled = self.stalls.stalled(&self.view.health, now);
        if *self.view.stalled == stalled {
            return false;
        }
        self.view.stalled = Arc::new(stalled);
        true
    }

    fn report_orphans(&mut self) {
        let orphans: BTreeSet<String> = orphaned_workers(&self.view.snapshot.fleet)
            .into_iter()
            .collect();
        for worker_id in orphans.difference(&self.orphans) {
            warn!(event = "orphaned_worker", worker_id = %worker_id);
        }
        self.orphans = orphans;
    }

    fn publish(&mut self) {
        self.view.revision += 1;
        let generation = self.generation;
        let shared = &self.shared;
        let view = &self.view;
        shared.view_tx.send_if_modified(|current| {
            if shared.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *current = view.clone();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{wire::WireMsg, Fleet, Notification, WorkerStatus};
    use serde_json::Value;

    fn worker(id: &str) -> WorkerStatus {
        WorkerStatus {
            worker_id: id.to_string(),
            hostname: "node-a".to_string(),
            cores: 8,
            search_type: "kbn".to_string(),
            search_params: Value::Null,
            tested: 100,
            found: 0,
            current: String::new(),
            checkpoint: None,
            uptime_secs: 10,
            last_heartbeat_secs_ago: 0,
            metrics: None,
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<FleetView>,
        predicate: impl Fn(&FleetView) -> bool,
    ) -> FleetView {
        loop {
            {
                let view = rx.borrow_and_update();
                if predicate(&view) {
                    return view.clone();
                }
            }
            rx.changed().await.expect("view sender alive");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn health_ages_locally_while_backend_is_silent() {
        let shared = Arc::new(Shared::new());
        let mut view_rx = shared.view_tx.subscribe();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let task = tokio::spawn(SyncDriver::new(shared.clone()).run(events_rx));

        events_tx
            .send(TransportEvent::State(ConnectionState::Connected))
            .await
            .expect("send state");
        events_tx
            .send(TransportEvent::Message(WireMsg::Fleet(Fleet {
                workers: vec![worker("w-1")],
                total_workers: 1,
                ..Fleet::default()
            })))
            .await
            .expect("send fleet");

        let view = wait_for(&mut view_rx, |view| !view.health.is_empty()).await;
        assert!(view.connection.is_connected());
        assert_eq!(view.health.get("w-1"), Some(&WorkerHealth::Healthy));

        tokio::time::sleep(Duration::from_millis(31_500)).await;
        let view = shared.current();
        assert_eq!(view.health.get("w-1"), Some(&WorkerHealth::Stale));
        assert!(shared.timer_ticks.load(Ordering::Relaxed) > 0);

        drop(events_tx);
        task.await.expect("driver exits when transport is gone");
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_kinds_keep_identity_across_publishes() {
        let shared = Arc::new(Shared::new());
        let mut view_rx = shared.view_tx.subscribe();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let task = tokio::spawn(SyncDriver::new(shared.clone()).run(events_rx));

        events_tx
            .send(TransportEvent::Message(WireMsg::Fleet(Fleet {
                workers: vec![worker("w-1")],
                ..Fleet::default()
            })))
            .await
            .expect("send fleet");
        let first = wait_for(&mut view_rx, |view| !view.snapshot.fleet.workers.is_empty()).await;

        events_tx
            .send(TransportEvent::Message(WireMsg::Notification(Notification {
                id: 1,
                kind: "prime".to_string(),
                title: "found".to_string(),
                details: Vec::new(),
                timestamp: None,
            })))
            .await
            .expect("send notification");
        let second = wait_for(&mut view_rx, |view| !view.snapshot.notifications.is_empty()).await;

        assert!(second.revision > first.revision);
        assert!(Arc::ptr_eq(&first.snapshot.fleet, &second.snapshot.fleet));
        assert!(Arc::ptr_eq(&first.snapshot.searches, &second.snapshot.searches));
        assert!(Arc::ptr_eq(&first.health, &second.health));

        drop(events_tx);
        task.await.expect("driver exit");
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_keeps_aging_from_the_original_sighting() {
        let shared = Arc::new(Shared::new());
        let mut view_rx = shared.view_tx.subscribe();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let task = tokio::spawn(SyncDriver::new(shared.clone()).run(events_rx));
        events_tx
            .send(TransportEvent::Message(WireMsg::Fleet(Fleet {
                workers: vec![worker("w-1")],
                ..Fleet::default()
            })))
            .await
            .expect("send fleet");
        let view = wait_for(&mut view_rx, |view| !view.health.is_empty()).await;
        assert_eq!(view.health.get("w-1"), Some(&WorkerHealth::Healthy));

        task.abort();
        shared.retire();
        drop(events_tx);
        tokio::time::sleep(Duration::from_secs(600)).await;

        let (_events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let task = tokio::spawn(SyncDriver::new(shared.clone()).run(events_rx));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let view = shared.current();
        assert_eq!(view.snapshot.fleet.workers.len(), 1);
        assert_eq!(view.health.get("w-1"), Some(&WorkerHealth::Offline));
        task.abort();
    }

    #[tokio::test]
    async fn retired_driver_cannot_overwrite_the_view() {
        let shared = Arc::new(Shared::new());
        let mut driver = SyncDriver::new(shared.clone());
        driver.handle_event(TransportEvent::State(ConnectionState::Connected), Instant::now());
        driver.publish();
        assert_eq!(shared.current().connection, ConnectionState::Connected);

        shared.retire();
        assert_eq!(shared.current().connection, ConnectionState::Disconnected);
        driver.publish();
        assert_eq!(shared.current().connection, ConnectionState::Disconnected);
    }
}
