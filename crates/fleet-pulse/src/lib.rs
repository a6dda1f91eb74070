//! Keeps one live channel to the fleet coordinator and shares the reconciled state with
//! any number of consumers.

pub mod config;
pub mod context;
pub mod driver;
pub mod metrics;
pub mod reconciler;
pub mod transport;

use thiserror::Error;

pub use config::{Config, ConfigError, TransportKind};
pub use context::{FleetContext, Subscription};
pub use driver::FleetView;
pub use reconciler::{FleetSnapshot, Reconciler, SeenAt};
pub use transport::{Transport, TransportError, TransportEvent};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no active subscription: call FleetContext::subscribe before reading fleet state")]
    NoActiveSubscription,
    #[error("fleet context has been shut down")]
    ContextShutDown,
    #[error("subscribe must be called from inside a tokio runtime")]
    NoRuntime,
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
}
