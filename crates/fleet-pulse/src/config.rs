use fleet_core::wire::DEFAULT_MAX_FRAME_BYTES;
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7001/";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_PULL_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Push,
    Pull,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "push" | "ws" | "websocket" => Ok(Self::Push),
            "pull" | "poll" | "http" => Ok(Self::Pull),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base url '{value}': {source}")]
    InvalidBaseUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("base url must use http or https, got '{0}'")]
    UnsupportedScheme(String),
    #[error("unknown transport '{0}' (expected push or pull)")]
    UnknownTransport(String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub transport: TransportKind,
    pub base_url: Url,
    pub client_id: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub pull_failure_threshold: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Largest websocket frame or polled response body accepted, in bytes.
    pub max_frame_bytes: usize,
}

impl Config {
    pub fn new(transport: TransportKind, base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            transport,
            base_url: parse_base_url(base_url)?,
            client_id: format!("fleet-pulse-{}", std::process::id()),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            pull_failure_threshold: DEFAULT_PULL_FAILURE_THRESHOLD,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(resolve_transport()?, &resolve_base_url())?;
        if let Some(secs) = env_u64("FLEET_POLL_INTERVAL_SECS").filter(|secs| *secs > 0) {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_u64("FLEET_PULL_FAILURE_THRESHOLD").filter(|n| *n > 0) {
            config.pull_failure_threshold = u32::try_from(threshold).unwrap_or(u32::MAX);
        }
        if let Some(bytes) = env_u64("FLEET_MAX_FRAME_BYTES").filter(|n| *n > 0) {
            config.max_frame_bytes = usize::try_from(bytes).unwrap_or(usize::MAX);
        }
        Ok(config)
    }

    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.endpoint("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
        Ok(url)
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|source| ConfigError::InvalidBaseUrl {
                value: format!("{}{}", self.base_url, path),
                source,
            })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&normalized).map_err(|source| ConfigError::InvalidBaseUrl {
        value: raw.to_string(),
        source,
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_transport() -> Result<TransportKind, ConfigError> {
    if let Ok(value) = std::env::var("FLEET_TRANSPORT") {
        if !value.trim().is_empty() {
            return value.parse();
        }
    }
    let use_websocket = std::env::var("FLEET_USE_WEBSOCKET")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(true);
    Ok(if use_websocket {
        TransportKind::Push
    } else {
        TransportKind::Pull
    })
}

fn resolve_base_url() -> String {
    if let Ok(value) = std::env::var("FLEET_BASE_URL") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_BASE_URL.to_string()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}
