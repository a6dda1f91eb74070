use clap::Parser;
use fleet_pulse::{
    metrics::{budget_utilization, fleet_throughput, health_counts, search_rows},
    Config, FleetContext, Subscription, TransportKind,
};
use std::{error::Error, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "fleet-pulse")]
struct Args {
    #[arg(long, default_value = "")]
    base_url: String,
    /// push (websocket) or pull (http polling)
    #[arg(long)]
    transport: Option<TransportKind>,
    #[arg(long)]
    poll_interval_secs: Option<u64>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.debug);
    let config = load_config(&args)?;

    let context = FleetContext::init(config)?;
    let mut subscription = context.subscribe()?;
    let mut report = tokio::time::interval(REPORT_INTERVAL);
    let mut last_connected = false;

    loop {
        tokio::select! {
            changed = subscription.changed() => {
                let view = match changed {
                    Ok(view) => view,
                    Err(err) => {
                        error!(event = "subscription_error", error = %err);
                        break;
                    }
                };
                let connected = view.connection.is_connected();
                if connected != last_connected {
                    info!(event = "connection", state = %view.connection, revision = view.revision);
                    last_connected = connected;
                }
                for notification in subscription.fresh_notifications()? {
                    info!(
                        event = "notification",
                        id = notification.id,
                        kind = %notification.kind,
                        title = %notification.title
                    );
                }
            }
            _ = report.tick() => report_fleet(&subscription)?,
            _ = tokio::signal::ctrl_c() => {
                info!(event = "shutdown_signal");
                break;
            }
        }
    }

    context.shutdown().await;
    Ok(())
}

fn load_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let mut config = Config::from_env()?;
    if !args.base_url.trim().is_empty() {
        let base = Config::new(config.transport, &args.base_url)?;
        config.base_url = base.base_url;
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(secs) = args.poll_interval_secs.filter(|secs| *secs > 0) {
        config.poll_interval = Duration::from_secs(secs);
    }
    Ok(config)
}

fn report_fleet(subscription: &Subscription) -> Result<(), Box<dyn Error>> {
    let view = subscription.view()?;
    let fleet = &view.snapshot.fleet;
    let counts = health_counts(&view.health);
    info!(
        event = "fleet_report",
        connected = view.connection.is_connected(),
        workers = fleet.workers.len(),
        cores = fleet.total_cores,
        tested = fleet.total_tested,
        found = fleet.total_found,
        throughput = fleet_throughput(fleet),
        healthy = counts.healthy,
        stale = counts.stale,
        offline = counts.offline,
        stalled = view.stalled.len(),
        running_agents = subscription.running_agents()?.len()
    );
    for host in subscription.hosts()? {
        info!(
            event = "host",
            hostname = %host.hostname,
            role = %host.role,
            status = %host.status,
            cores = host.cores,
            workers = host.worker_ids.len(),
            coordinator = host.is_coordinator
        );
    }
    for row in search_rows(&view.snapshot.searches, &view.snapshot.search_jobs)
        .iter()
        .filter(|row| row.status.is_active())
    {
        info!(
            event = "search",
            source = row.source.as_str(),
            id = row.id,
            search_type = %row.search_type,
            status = %row.status,
            tested = row.tested,
            progress = ?row.progress
        );
    }
    for budget in view.snapshot.agent_budgets.iter() {
        if let Some(used) = budget_utilization(budget).filter(|used| *used >= 90.0) {
            warn!(event = "budget_near_limit", period = %budget.period, used_percent = used);
        }
    }
    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FLEET_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
