pub mod pull;
pub mod push;

use crate::config::{Config, ConfigError, TransportKind};
use fleet_core::{
    wire::{FrameError, WireMsg},
    ConnectionState,
};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::debug;

pub use pull::PullTransport;
pub use push::PushTransport;

pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// What a transport hands to the sync driver; both strategies produce the same stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    State(ConnectionState),
    Message(WireMsg),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("unexpected body for {endpoint}: {reason}")]
    Body {
        endpoint: &'static str,
        reason: String,
    },
}

/// The one transport strategy chosen for the lifetime of a context.
#[derive(Debug)]
pub enum Transport {
    Push(PushTransport),
    Pull(PullTransport),
}

impl Transport {
    pub fn select(config: &Config) -> Result<Self, TransportError> {
        Ok(match config.transport {
            TransportKind::Push => Transport::Push(PushTransport::new(config)?),
            TransportKind::Pull => Transport::Pull(PullTransport::new(config)?),
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Push(_) => TransportKind::Push,
            Transport::Pull(_) => TransportKind::Pull,
        }
    }

    pub fn spawn(
        self,
        runtime: &tokio::runtime::Handle,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let kind = self.kind();
        let task = match self {
            Transport::Push(transport) => {
                runtime.spawn(transport.run(events, outbound_rx, stop_rx))
            }
            Transport::Pull(transport) => {
                runtime.spawn(transport.run(events, outbound_rx, stop_rx))
            }
        };
        TransportHandle {
            kind,
            outbound: outbound_tx,
            stop: stop_tx,
            task,
        }
    }
}

#[derive(Debug)]
pub struct TransportHandle {
    kind: TransportKind,
    outbound: mpsc::Sender<Value>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Fire-and-forget; results show up in later snapshots, never here.
    pub fn send_message(&self, payload: Value) {
        if let Err(err) = self.outbound.try_send(payload) {
            debug!(event = "send_dropped", transport = %self.kind, error = %err);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the transport without waiting: pending backoff sleeps, poll rounds and the
    /// socket are dropped with the task.
    pub fn close(&self) {
        let _ = self.stop.send(true);
        self.task.abort();
    }

    /// Asks the transport to stop and waits for it to close its connection.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.stop.send(true);
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
        }
    }
}

pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Returns false once the driver side has gone away.
pub(crate) async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> bool {
    events.send(event).await.is_ok()
}

pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}
