use super::{emit, next_backoff, stop_requested, TransportError, TransportEvent};
use crate::config::Config;
use fleet_core::{
    wire::{decode_message, FrameError},
    ConnectionState,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Persistent websocket subscription to the coordinator's `/ws` feed.
#[derive(Debug, Clone)]
pub struct PushTransport {
    url: Url,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_frame_bytes: usize,
}

enum SessionEnd {
    Remote,
    Local,
    DriverGone,
}

impl PushTransport {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Ok(Self {
            url: config.websocket_url()?,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn run(
        self,
        events: mpsc::Sender<TransportEvent>,
        mut outbound: mpsc::Receiver<Value>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut backoff = self.initial_backoff;
        let mut state = ConnectionState::Connecting;

        loop {
            if !emit(&events, TransportEvent::State(state)).await {
                return;
            }
            let connect = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = stop_requested(&mut stop) => break,
            };
            let mut ws = match connect {
                Ok((ws, _)) => ws,
                Err(err) => {
                    warn!(event = "push_connect_error", url = %self.url, error = %err, backoff_ms = backoff.as_millis() as u64);
                    state = ConnectionState::Reconnecting;
                    if !emit(&events, TransportEvent::State(state)).await {
                        return;
                    }
                    if self.sleep_or_stop(backoff, &mut stop).await {
                        break;
                    }
                    backoff = next_backoff(backoff, self.max_backoff);
                    continue;
                }
            };
            backoff = self.initial_backoff;
            info!(event = "push_connected", url = %self.url);
            if !emit(&events, TransportEvent::State(ConnectionState::Connected)).await {
                let _ = ws.close(None).await;
                return;
            }

            let mut outbound_open = true;
            let end = loop {
                tokio::select! {
                    frame = ws.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                if !forward_frame(&text, self.max_frame_bytes, &events).await {
                                    break SessionEnd::DriverGone;
                                }
                            }
                            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                Ok(text) => {
                                    if !forward_frame(&text, self.max_frame_bytes, &events).await {
                                        break SessionEnd::DriverGone;
                                    }
                                }
                                Err(err) => {
                                    warn!(event = "pulse_decode_error", error = %err, "binary frame is not utf-8");
                                }
                            },
                            Some(Ok(Message::Close(frame))) => {
                                info!(event = "push_closed_by_server", reason = ?frame);
                                break SessionEnd::Remote;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(event = "push_read_error", error = %err);
                                break SessionEnd::Remote;
                            }
                            None => break SessionEnd::Remote,
                        }
                    }
                    maybe_payload = outbound.recv(), if outbound_open => {
                        match maybe_payload {
                            Some(payload) => {
                                if let Err(err) = ws.send(Message::Text(payload.to_string())).await {
                                    debug!(event = "send_failed", error = %err);
                                    break SessionEnd::Remote;
                                }
                            }
                            None => outbound_open = false,
                        }
                    }
                    _ = stop_requested(&mut stop) => {
                        let _ = ws.close(None).await;
                        break SessionEnd::Local;
                    }
                }
            };

            match end {
                SessionEnd::Local => break,
                SessionEnd::DriverGone => {
                    let _ = ws.close(None).await;
                    return;
                }
                SessionEnd::Remote => {
                    state = ConnectionState::Reconnecting;
                    if !emit(&events, TransportEvent::State(state)).await {
                        return;
                    }
                    warn!(event = "push_disconnected", backoff_ms = backoff.as_millis() as u64);
                    if self.sleep_or_stop(backoff, &mut stop).await {
                        break;
                    }
                    backoff = next_backoff(backoff, self.max_backoff);
                }
            }
        }

        let _ = emit(&events, TransportEvent::State(ConnectionState::Disconnected)).await;
        info!(event = "push_stopped", url = %self.url);
    }

    /// Returns true when a local stop interrupted the backoff.
    async fn sleep_or_stop(&self, delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = stop_requested(stop) => true,
        }
    }
}

async fn forward_frame(
    text: &str,
    max_frame_bytes: usize,
    events: &mpsc::Sender<TransportEvent>,
) -> bool {
    match decode_message(text, max_frame_bytes) {
        Ok(msg) => emit(events, TransportEvent::Message(msg)).await,
        Err(FrameError::UnknownKind(kind)) => {
            warn!(event = "pulse_unknown_kind", kind = %kind);
            true
        }
        Err(err) => {
            warn!(event = "pulse_decode_error", error = %err);
            true
        }
    }
}
