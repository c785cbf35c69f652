use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use autoremedy_dispatcher::{
    alerts::AlertConfigStore,
    config::Config,
    dispatcher::AlertDispatcher,
    executor::{ActionExecutor, ProcessRunner},
    metrics,
    rate_limit::RateLimiter,
    server::Server,
};

#[derive(Parser)]
#[command(author, version, about = "Run remediation scripts for Alertmanager alerts", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set (debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Address to listen on (overrides SERVER_ADDR)
    #[arg(long)]
    addr: Option<String>,

    /// YAML file with alert definitions (overrides ALERT_CONFIG_PATH)
    #[arg(long)]
    alert_config: Option<PathBuf>,

    /// Number of concurrent remediation workers (overrides MAX_WORKERS)
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let mut config = Config::load()?;
    if let Some(addr) = cli.addr {
        config.server.addr = addr;
    }
    if let Some(path) = cli.alert_config {
        config.alerts.config_path = Some(path);
    }
    if let Some(workers) = cli.workers {
        config.executor.max_workers = workers;
    }
    config.validate()?;
    info!("Loaded configuration: {:?}", config);

    metrics::register_metrics()?;

    let store = Arc::new(AlertConfigStore::load(config.alerts.config_path.as_deref()));
    info!("Configured alerts: {:?}", store.names());

    let limiter = Arc::new(RateLimiter::new(config.alerts.cooldown));
    let runner = Arc::new(ProcessRunner::new(config.action.clone()));
    let executor = Arc::new(ActionExecutor::new(runner, config.executor.max_workers)?);
    let dispatcher = Arc::new(AlertDispatcher::new(store, limiter.clone(), executor));

    let sweep_interval = config.alerts.sweep_interval;
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match limiter.evict_expired() {
                Ok(0) => {}
                Ok(evicted) => info!("Evicted {} expired rate-limit entries", evicted),
                Err(e) => error!("Rate-limit sweep failed: {}", e),
            }
        }
    });

    let server = Server::new(dispatcher.clone());
    info!("Starting server on {}", config.server.addr);
    server
        .start(&config.server.addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    sweeper.abort();
    dispatcher.shutdown().await;
    info!("All remediations finished, exiting");

    Ok(())
}
