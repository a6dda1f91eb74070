use super::{emit, stop_requested, TransportError, TransportEvent};
use crate::config::Config;
use fleet_core::{
    wire::{FrameError, WireMsg},
    AgentEvent, ConnectionState, CoordinatorMetrics, Fleet, Notification, StatusSummary,
};
use futures_util::future::join_all;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullEndpoint {
    Status,
    Fleet,
    Searches,
    SearchJobs,
    Deployments,
    AgentTasks,
    AgentEvents,
    AgentBudgets,
    AgentRoles,
    AgentTemplates,
    Notifications,
}

impl PullEndpoint {
    pub const ALL: [PullEndpoint; 11] = [
        Self::Status,
        Self::Fleet,
        Self::Searches,
        Self::SearchJobs,
        Self::Deployments,
        Self::AgentTasks,
        Self::AgentEvents,
        Self::AgentBudgets,
        Self::AgentRoles,
        Self::AgentTemplates,
        Self::Notifications,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Self::Status => "/api/status",
            Self::Fleet => "/api/fleet",
            Self::Searches => "/api/searches",
            Self::SearchJobs => "/api/search_jobs",
            Self::Deployments => "/api/deployments",
            Self::AgentTasks => "/api/agents/tasks",
            Self::AgentEvents => "/api/agents/events",
            Self::AgentBudgets => "/api/agents/budgets",
            Self::AgentRoles => "/api/agents/roles",
            Self::AgentTemplates => "/api/agents/templates",
            Self::Notifications => "/api/notifications",
        }
    }

    /// Key under which list endpoints may wrap their array.
    fn key(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Fleet => "fleet",
            Self::Searches => "searches",
            Self::SearchJobs => "search_jobs",
            Self::Deployments => "deployments",
            Self::AgentTasks => "tasks",
            Self::AgentEvents => "events",
            Self::AgentBudgets => "budgets",
            Self::AgentRoles => "roles",
            Self::AgentTemplates => "templates",
            Self::Notifications => "notifications",
        }
    }
}

#[derive(Deserialize)]
struct FleetBody {
    #[serde(flatten)]
    fleet: Fleet,
    #[serde(default)]
    coordinator: Option<CoordinatorMetrics>,
}

/// Converts one endpoint response into the messages the push feed would have carried.
pub fn messages_from_body(
    endpoint: PullEndpoint,
    body: Value,
) -> Result<Vec<WireMsg>, TransportError> {
    let messages = match endpoint {
        PullEndpoint::Status => vec![WireMsg::Status(from_body::<StatusSummary>(endpoint, body)?)],
        PullEndpoint::Fleet => {
            let FleetBody { fleet, coordinator } = from_body(endpoint, body)?;
            let mut messages = vec![WireMsg::Fleet(fleet)];
            if let Some(coordinator) = coordinator {
                messages.push(WireMsg::CoordinatorMetrics(coordinator));
            }
            messages
        }
        PullEndpoint::Searches => vec![WireMsg::Searches(list_from_body(endpoint, body)?)],
        PullEndpoint::SearchJobs => vec![WireMsg::SearchJobs(list_from_body(endpoint, body)?)],
        PullEndpoint::Deployments => vec![WireMsg::Deployments(list_from_body(endpoint, body)?)],
        PullEndpoint::AgentTasks => vec![WireMsg::AgentTasks(list_from_body(endpoint, body)?)],
        PullEndpoint::AgentBudgets => {
            vec![WireMsg::AgentBudgets(list_from_body(endpoint, body)?)]
        }
        PullEndpoint::AgentRoles => vec![WireMsg::AgentRoles(list_from_body(endpoint, body)?)],
        PullEndpoint::AgentTemplates => {
            vec![WireMsg::AgentTemplates(list_from_body(endpoint, body)?)]
        }
        PullEndpoint::AgentEvents => {
            let mut events: Vec<AgentEvent> = list_from_body(endpoint, body)?;
            events.sort_by_key(|event| event.id);
            events.into_iter().map(WireMsg::AgentEvent).collect()
        }
        PullEndpoint::Notifications => {
            let mut notifications: Vec<Notification> = list_from_body(endpoint, body)?;
            notifications.sort_by_key(|notification| notification.id);
            notifications
                .into_iter()
                .map(WireMsg::Notification)
                .collect()
        }
    };
    Ok(messages)
}

fn from_body<T: DeserializeOwned>(endpoint: PullEndpoint, body: Value) -> Result<T, TransportError> {
    serde_json::from_value(body).map_err(|err| TransportError::Body {
        endpoint: endpoint.path(),
        reason: err.to_string(),
    })
}

fn list_from_body<T: DeserializeOwned>(
    endpoint: PullEndpoint,
    body: Value,
) -> Result<Vec<T>, TransportError> {
    match body {
        Value::Array(_) => from_body(endpoint, body),
        Value::Object(mut map) => match map.remove(endpoint.key()) {
            Some(list) => from_body(endpoint, list),
            None => Err(TransportError::Body {
                endpoint: endpoint.path(),
                reason: format!("object has no '{}' list", endpoint.key()),
            }),
        },
        other => Err(TransportError::Body {
            endpoint: endpoint.path(),
            reason: format!("expected list, got {other}"),
        }),
    }
}

/// Tracks consecutive failed rounds and decides when the connection state flips.
#[derive(Debug, Clone)]
pub struct PollHealth {
    failures: u32,
    threshold: u32,
    state: ConnectionState,
}

impl PollHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: 0,
            threshold: threshold.max(1),
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns the new state when the round changed it.
    pub fn record(&mut self, success: bool) -> Option<ConnectionState> {
        let next = if success {
            self.failures = 0;
            ConnectionState::Connected
        } else {
            self.failures = self.failures.saturating_add(1);
            if self.failures < self.threshold {
                return None;
            }
            ConnectionState::Reconnecting
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}

/// Periodic HTTP polling of the coordinator's read endpoints.
#[derive(Debug, Clone)]
pub struct PullTransport {
    client: reqwest::Client,
    endpoints: Vec<(PullEndpoint, Url)>,
    poll_interval: Duration,
    failure_threshold: u32,
    max_body_bytes: usize,
}

struct RoundOutcome {
    messages: Vec<WireMsg>,
    succeeded: usize,
    failed: usize,
}

impl PullTransport {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.client_id.clone())
            .build()?;
        let endpoints = PullEndpoint::ALL
            .into_iter()
            .map(|endpoint| Ok::<_, TransportError>((endpoint, config.endpoint(endpoint.path())?)))
            .collect::<Result<Vec<_>, TransportError>>()?;
        Ok(Self {
            client,
            endpoints,
            poll_interval: config.poll_interval,
            failure_threshold: config.pull_failure_threshold,
            max_body_bytes: config.max_frame_bytes,
        })
    }

    pub async fn run(
        self,
        events: mpsc::Sender<TransportEvent>,
        mut outbound: mpsc::Receiver<Value>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut health = PollHealth::new(self.failure_threshold);
        if !emit(&events, TransportEvent::State(health.state())).await {
            return;
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outbound_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let round = tokio::select! {
                        round = self.poll_round() => round,
                        _ = stop_requested(&mut stop) => break,
                    };
                    for msg in round.messages {
                        if !emit(&events, TransportEvent::Message(msg)).await {
                            return;
                        }
                    }
                    let success = round.succeeded > 0;
                    if !success {
                        warn!(
                            event = "pull_round_failed",
                            failed = round.failed,
                            consecutive = health.failures() + 1
                        );
                    }
                    if let Some(state) = health.record(success) {
                        info!(event = "pull_state", state = %state, failed = round.failed);
                        if !emit(&events, TransportEvent::State(state)).await {
                            return;
                        }
                    }
                }
                maybe_payload = outbound.recv(), if outbound_open => {
                    match maybe_payload {
                        Some(payload) => {
                            debug!(event = "send_unsupported", transport = "pull", payload = %payload);
                        }
                        None => outbound_open = false,
                    }
                }
                _ = stop_requested(&mut stop) => break,
            }
        }

        let _ = emit(&events, TransportEvent::State(ConnectionState::Disconnected)).await;
        info!(event = "pull_stopped");
    }

    async fn poll_round(&self) -> RoundOutcome {
        let results = join_all(
            self.endpoints
                .iter()
                .map(|(endpoint, url)| self.fetch(*endpoint, url)),
        )
        .await;

        let mut outcome = RoundOutcome {
            messages: Vec::new(),
            succeeded: 0,
            failed: 0,
        };
        for (endpoint, result) in results {
            match result {
                Ok(messages) => {
                    outcome.succeeded += 1;
                    outcome.messages.extend(messages);
                }
                Err(err) => {
                    outcome.failed += 1;
                    debug!(event = "pull_endpoint_error", endpoint = endpoint.path(), error = %err);
                }
            }
        }
        outcome
    }

    async fn fetch(
        &self,
        endpoint: PullEndpoint,
        url: &Url,
    ) -> (PullEndpoint, Result<Vec<WireMsg>, TransportError>) {
        (endpoint, self.fetch_messages(endpoint, url).await)
    }

    async fn fetch_messages(
        &self,
        endpoint: PullEndpoint,
        url: &Url,
    ) -> Result<Vec<WireMsg>, TransportError> {
        let bytes = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let body = parse_body(endpoint, &bytes, self.max_body_bytes)?;
        messages_from_body(endpoint, body)
    }
}

/// Same size rule as websocket frames, so both transports accept the same payloads.
fn parse_body(
    endpoint: PullEndpoint,
    bytes: &[u8],
    max_bytes: usize,
) -> Result<Value, TransportError> {
    if bytes.len() > max_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_bytes,
        }
        .into());
    }
    serde_json::from_slice(bytes).map_err(|err| TransportError::Body {
        endpoint: endpoint.path(),
        reason: err.to_string(),
    })
}
