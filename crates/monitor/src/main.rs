use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use proxy_monitor::{
    alerting::AlertStateStore,
    config::Config,
    notify::{build_notifier, MessageRenderer},
    scheduler::{Checkers, Job, Monitor},
    server::Server,
    store::create_store,
};

#[derive(Debug, Parser)]
#[command(name = "proxy-monitor", version, about = "Server, domain, and DNS monitoring for the proxy panel")]
struct Args {
    /// Listen address for the status API, overrides SERVER_ADDR
    #[arg(long)]
    addr: Option<String>,

    /// Run every job once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::load().context("invalid configuration")?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    info!(
        addr = %config.server.addr,
        database = ?config.database.db_type,
        availability_mode = ?config.probe.availability_mode,
        telegram = config.telegram.is_configured(),
        "Loaded configuration"
    );

    // Initialize store
    let store = create_store(&config.database)
        .await
        .context("failed to open database")?;
    store.init().await.context("failed to run migrations")?;

    let renderer = Arc::new(MessageRenderer::new(config.mask.clone())?);
    let alerts = Arc::new(AlertStateStore::new(
        store.clone(),
        renderer,
        config.thresholds.cooldown(),
    ));
    let notifier = build_notifier(&config.telegram)?;
    let checkers = Checkers::from_config(&config)?;
    let monitor = Arc::new(Monitor::new(
        &config,
        store.clone(),
        alerts.clone(),
        checkers,
        notifier,
    ));

    if args.once {
        for job in Job::ALL {
            let checked = monitor.run_once(job).await?;
            info!(job = %job, checked, "Job finished");
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = monitor.spawn(shutdown_rx);

    let server = Server::new(store, alerts);
    let result = server
        .serve(&config.server.addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await;

    let _ = shutdown_tx.send(true);
    for job in jobs {
        if let Err(e) = job.await {
            warn!(error = %e, "Monitor job ended abnormally");
        }
    }

    result.context("HTTP server failed")
}
