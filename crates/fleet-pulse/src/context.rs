use crate::{
    config::{Config, TransportKind},
    driver::{FleetView, Shared, SyncDriver, EVENT_QUEUE_CAPACITY},
    metrics::{self, HostNode},
    transport::{Transport, TransportHandle},
    SyncError,
};
use fleet_core::{
    AgentBudget, AgentTask, CoordinatorMetrics, Deployment, Fleet, ManagedSearch, Notification,
    SearchJob, StatusSummary,
};
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{runtime::Handle, sync::mpsc, sync::watch, task::JoinHandle};
use tracing::info;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Owns the one live channel to the backend and hands out subscriptions to it.
///
/// Cloning is cheap and every clone refers to the same context. The transport runs only
/// while at least one [`Subscription`] is alive.
#[derive(Clone)]
pub struct FleetContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: Config,
    shared: Arc<Shared>,
    runtime: Mutex<Runtime>,
}

#[derive(Default)]
struct Runtime {
    subscribers: usize,
    shut_down: bool,
    driver: Option<DriverHandle>,
}

struct DriverHandle {
    task: JoinHandle<()>,
    transport: TransportHandle,
}

impl DriverHandle {
    fn abort(&self) {
        self.transport.close();
        self.task.abort();
    }

    async fn shutdown(self) {
        self.transport.shutdown(SHUTDOWN_GRACE).await;
        let mut task = self.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FleetContext {
    /// Validates the configuration by building its transport once; nothing connects yet.
    pub fn init(config: Config) -> Result<Self, SyncError> {
        let transport = Transport::select(&config)?;
        info!(
            event = "context_init",
            transport = %transport.kind(),
            base_url = %config.base_url,
            client_id = %config.client_id
        );
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                shared: Arc::new(Shared::new()),
                runtime: Mutex::new(Runtime::default()),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.config.transport
    }

    /// Attaches a consumer, starting the transport if this is the first one.
    pub fn subscribe(&self) -> Result<Subscription, SyncError> {
        let handle = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let mut runtime = lock_or_recover(&self.inner.runtime);
        if runtime.shut_down {
            return Err(SyncError::ContextShutDown);
        }
        if runtime.driver.is_none() {
            runtime.driver = Some(self.start(&handle)?);
        }
        runtime.subscribers += 1;
        Ok(Subscription {
            context: self.clone(),
            view_rx: self.inner.shared.view_tx.subscribe(),
            shown_notifications: HashSet::new(),
        })
    }

    fn start(&self, handle: &Handle) -> Result<DriverHandle, SyncError> {
        let transport = Transport::select(&self.inner.config)?;
        let kind = transport.kind();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let driver = SyncDriver::new(self.inner.shared.clone());
        let task = handle.spawn(driver.run(events_rx));
        let transport = transport.spawn(handle, events_tx);
        info!(event = "sync_started", transport = %kind);
        Ok(DriverHandle { task, transport })
    }

    fn release(&self) {
        let mut runtime = lock_or_recover(&self.inner.runtime);
        runtime.subscribers = runtime.subscribers.saturating_sub(1);
        if runtime.subscribers > 0 {
            return;
        }
        if let Some(driver) = runtime.driver.take() {
            driver.abort();
            self.inner.shared.retire();
            info!(event = "sync_stopped", reason = "last_unsubscribe");
        }
    }

    /// Latest view. Only valid while some subscription keeps the context running.
    pub fn view(&self) -> Result<FleetView, SyncError> {
        let runtime = lock_or_recover(&self.inner.runtime);
        if runtime.shut_down {
            return Err(SyncError::ContextShutDown);
        }
        if runtime.subscribers == 0 {
            return Err(SyncError::NoActiveSubscription);
        }
        Ok(self.inner.shared.current())
    }

    pub fn send_message(&self, payload: Value) -> Result<(), SyncError> {
        let runtime = lock_or_recover(&self.inner.runtime);
        if runtime.shut_down {
            return Err(SyncError::ContextShutDown);
        }
        match &runtime.driver {
            Some(driver) => {
                driver.transport.send_message(payload);
                Ok(())
            }
            None => Err(SyncError::NoActiveSubscription),
        }
    }

    pub fn is_running(&self) -> bool {
        lock_or_recover(&self.inner.runtime).driver.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        lock_or_recover(&self.inner.runtime).shut_down
    }

    pub fn subscriber_count(&self) -> usize {
        lock_or_recover(&self.inner.runtime).subscribers
    }

    /// Stops the transport, closing its connection, and refuses all later use.
    pub async fn shutdown(&self) {
        let driver = {
            let mut runtime = lock_or_recover(&self.inner.runtime);
            if runtime.shut_down {
                return;
            }
            runtime.shut_down = true;
            runtime.driver.take()
        };
        if let Some(driver) = driver {
            driver.shutdown().await;
        }
        self.inner.shared.retire();
        info!(event = "sync_stopped", reason = "shutdown");
    }
}

/// A consumer's handle on the shared fleet state. Dropping the last one stops syncing.
pub struct Subscription {
    context: FleetContext,
    view_rx: watch::Receiver<FleetView>,
    shown_notifications: HashSet<u64>,
}

impl Subscription {
    pub fn context(&self) -> &FleetContext {
        &self.context
    }

    pub fn view(&self) -> Result<FleetView, SyncError> {
        self.ensure_live()?;
        Ok(self.view_rx.borrow().clone())
    }

    fn ensure_live(&self) -> Result<(), SyncError> {
        if self.context.is_shut_down() {
            return Err(SyncError::ContextShutDown);
        }
        Ok(())
    }

    /// Waits for the next published view.
    pub async fn changed(&mut self) -> Result<FleetView, SyncError> {
        self.ensure_live()?;
        self.view_rx
            .changed()
            .await
            .map_err(|_| SyncError::ContextShutDown)?;
        self.ensure_live()?;
        Ok(self.view_rx.borrow_and_update().clone())
    }

    pub fn status(&self) -> Result<Option<Arc<StatusSummary>>, SyncError> {
        Ok(self.view()?.snapshot.status)
    }

    pub fn fleet(&self) -> Result<Arc<Fleet>, SyncError> {
        Ok(self.view()?.snapshot.fleet)
    }

    pub fn coordinator(&self) -> Result<Option<Arc<CoordinatorMetrics>>, SyncError> {
        Ok(self.view()?.snapshot.coordinator)
    }

    pub fn searches(&self) -> Result<Arc<Vec<ManagedSearch>>, SyncError> {
        Ok(self.view()?.snapshot.searches)
    }

    pub fn search_jobs(&self) -> Result<Arc<Vec<SearchJob>>, SyncError> {
        Ok(self.view()?.snapshot.search_jobs)
    }

    pub fn deployments(&self) -> Result<Arc<Vec<Deployment>>, SyncError> {
        Ok(self.view()?.snapshot.deployments)
    }

    pub fn notifications(&self) -> Result<Arc<Vec<Notification>>, SyncError> {
        Ok(self.view()?.snapshot.notifications)
    }

    pub fn agent_tasks(&self) -> Result<Arc<Vec<AgentTask>>, SyncError> {
        Ok(self.view()?.snapshot.agent_tasks)
    }

    pub fn agent_budgets(&self) -> Result<Arc<Vec<AgentBudget>>, SyncError> {
        Ok(self.view()?.snapshot.agent_budgets)
    }

    pub fn running_agents(&self) -> Result<Vec<AgentTask>, SyncError> {
        let tasks = self.agent_tasks()?;
        Ok(metrics::running_agents(&tasks).into_iter().cloned().collect())
    }

    pub fn hosts(&self) -> Result<Vec<HostNode>, SyncError> {
        let view = self.view()?;
        Ok(metrics::group_hosts(
            &view.snapshot.fleet,
            view.snapshot.coordinator.as_deref(),
            &view.health,
        ))
    }

    pub fn connected(&self) -> Result<bool, SyncError> {
        Ok(self.view()?.connection.is_connected())
    }

    /// Best effort. Any outcome shows up in later snapshots only.
    pub fn send_message(&self, payload: Value) -> Result<(), SyncError> {
        self.context.send_message(payload)
    }

    /// Notifications this subscriber has not been handed before.
    pub fn fresh_notifications(&mut self) -> Result<Vec<Notification>, SyncError> {
        let notifications = self.notifications()?;
        Ok(take_fresh(&mut self.shown_notifications, &notifications))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.context.release();
    }
}

fn take_fresh(shown: &mut HashSet<u64>, notifications: &[Notification]) -> Vec<Notification> {
    // Forget ids that fell out of the bounded log so the set stays bounded too.
    shown.retain(|id| notifications.iter().any(|n| n.id == *id));
    notifications
        .iter()
        .filter(|notification| shown.insert(notification.id))
        .cloned()
        .collect()
}
