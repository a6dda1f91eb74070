mod common;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use common::{fleet_payload, spawn_backend, wait_until};
use fleet_pulse::{Config, FleetContext, TransportKind};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Clone, Default)]
struct Backend {
    down: Arc<AtomicBool>,
    fleet_hits: Arc<AtomicUsize>,
    failed_fleet_hits: Arc<AtomicUsize>,
}

async fn status(State(backend): State<Backend>) -> Result<Json<Value>, StatusCode> {
    if backend.down.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "active": true,
        "search_type": "factorial",
        "checkpoint": {"type": "factorial", "start": 1000, "end": 2000, "last_n": 1500}
    })))
}

async fn fleet(State(backend): State<Backend>) -> Result<Json<Value>, StatusCode> {
    backend.fleet_hits.fetch_add(1, Ordering::SeqCst);
    if backend.down.load(Ordering::SeqCst) {
        backend.failed_fleet_hits.fetch_add(1, Ordering::SeqCst);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let mut body = fleet_payload(&[("w-1", "solo"), ("w-2", "solo")]);
    body["coordinator"] = json!({"hostname": "solo", "metrics": {"cpu_usage_percent": 17.5}});
    Ok(Json(body))
}

async fn searches(State(backend): State<Backend>) -> Result<Json<Value>, StatusCode> {
    if backend.down.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!([
        {"id": 1, "search_type": "kbn", "status": "running", "tested": 10, "found": 0}
    ])))
}

async fn broken() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "database is locked")
}

async fn notifications(State(backend): State<Backend>) -> Result<Json<Value>, StatusCode> {
    if backend.down.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({"notifications": [
        {"id": 12, "kind": "prime", "title": "second"},
        {"id": 11, "kind": "prime", "title": "first"}
    ]})))
}

async fn agent_tasks(State(backend): State<Backend>) -> Result<Json<Value>, StatusCode> {
    if backend.down.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!([
        {"id": 1, "title": "triage", "status": "in_progress"},
        {"id": 2, "title": "subtask", "status": "pending", "parent_task_id": 1}
    ])))
}

async fn start_backend() -> (SocketAddr, Backend) {
    let backend = Backend::default();
    let app = Router::new()
        .route("/api/status", get(status))
        .route("/api/fleet", get(fleet))
        .route("/api/searches", get(searches))
        .route("/api/search_jobs", get(broken))
        .route("/api/agents/tasks", get(agent_tasks))
        .route("/api/notifications", get(notifications))
        .with_state(backend.clone());
    (spawn_backend(app).await, backend)
}

fn pull_config(addr: SocketAddr) -> Config {
    let mut config =
        Config::new(TransportKind::Pull, &format!("http://{addr}")).expect("pull config");
    config.poll_interval = Duration::from_millis(150);
    config.request_timeout = Duration::from_secs(2);
    config.pull_failure_threshold = 3;
    config
}

#[tokio::test]
async fn polling_fills_every_kind_and_dedupes_notifications() {
    let (addr, backend) = start_backend().await;
    let context = FleetContext::init(pull_config(addr)).expect("init");
    let mut subscription = context.subscribe().expect("subscribe");

    let view = wait_until(&mut subscription, "first round", |view| {
        view.connection.is_connected()
            && view.snapshot.fleet.workers.len() == 2
            && view.snapshot.coordinator.is_some()
    })
    .await;
    assert!(view.snapshot.status.as_ref().is_some_and(|status| status.active));
    assert_eq!(view.snapshot.searches.len(), 1);
    assert!(view.snapshot.search_jobs.is_empty());
    assert!(view.snapshot.deployments.is_empty());

    let hits = backend.fleet_hits.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(backend.fleet_hits.load(Ordering::SeqCst) >= hits + 2);

    let ids: Vec<u64> = subscription
        .notifications()
        .expect("notifications")
        .iter()
        .map(|notification| notification.id)
        .collect();
    assert_eq!(ids, vec![11, 12]);
    assert_eq!(subscription.running_agents().expect("agents").len(), 1);

    let hosts = subscription.hosts().expect("hosts");
    assert_eq!(hosts.len(), 1);
    assert!(hosts[0].is_coordinator);

    context.shutdown().await;
}

#[tokio::test]
async fn connected_survives_failures_below_threshold() {
    let (addr, backend) = start_backend().await;
    let context = FleetContext::init(pull_config(addr)).expect("init");
    let mut subscription = context.subscribe().expect("subscribe");

    wait_until(&mut subscription, "connected", |view| {
        view.connection.is_connected() && !view.snapshot.fleet.workers.is_empty()
    })
    .await;

    backend.down.store(true, Ordering::SeqCst);
    let view = wait_until(&mut subscription, "disconnect after threshold", |view| {
        !view.connection.is_connected()
    })
    .await;
    assert!(backend.failed_fleet_hits.load(Ordering::SeqCst) >= 3);
    assert_eq!(view.snapshot.fleet.workers.len(), 2);

    backend.down.store(false, Ordering::SeqCst);
    wait_until(&mut subscription, "recovered", |view| {
        view.connection.is_connected()
    })
    .await;

    context.shutdown().await;
}
