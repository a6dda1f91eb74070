#![allow(dead_code)]

use axum::Router;
use fleet_pulse::{FleetView, Subscription};
use serde_json::{json, Value};
use std::{net::SocketAddr, time::Duration};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn spawn_backend(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

pub async fn wait_until(
    subscription: &mut Subscription,
    what: &str,
    predicate: impl Fn(&FleetView) -> bool,
) -> FleetView {
    let waited = tokio::time::timeout(WAIT, async {
        loop {
            let view = subscription.view().expect("view while subscribed");
            if predicate(&view) {
                return view;
            }
            subscription.changed().await.expect("view update");
        }
    })
    .await;
    match waited {
        Ok(view) => view,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

pub fn fleet_payload(workers: &[(&str, &str)]) -> Value {
    let workers: Vec<Value> = workers
        .iter()
        .map(|(id, host)| {
            json!({
                "worker_id": id,
                "hostname": host,
                "cores": 8,
                "search_type": "factorial",
                "search_params": {"start": 1000, "end": 2000},
                "tested": 1200,
                "found": 1,
                "current": null,
                "uptime_secs": 600,
                "last_heartbeat_secs_ago": 1
            })
        })
        .collect();
    json!({
        "workers": workers,
        "total_workers": workers.len(),
        "total_cores": workers.len() * 8,
        "total_tested": workers.len() * 1200,
        "total_found": workers.len()
    })
}

pub fn frame(kind: &str, payload: Value) -> String {
    json!({"type": kind, "payload": payload}).to_string()
}
