//! CiHub server entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML file named by `--config`, apply
//!    command-line overrides, and validate.
//! 2. **Wire observability**: `tracing-subscriber` with an env filter, pretty
//!    or JSON output, and an optional OpenTelemetry OTLP exporter.
//! 3. **Construct infrastructure**: the node store (JSON file or memory) and
//!    one adapter per node kind, injected into the [`engine::Aggregator`].
//! 4. **Serve**: the `gateway` router on the configured address until Ctrl-C
//!    or SIGTERM, with a background task sweeping expired cache entries.

mod config;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use engine::{Aggregator, JsonFileNodeStore, MemoryNodeStore, RemoteClients};
use hub::{NodeKind, NodeStore};
use jenkins::JenkinsClient;

use crate::config::Config;

/// Aggregating control plane for Jenkins-family build servers.
#[derive(Debug, Parser)]
#[command(name = "cihub", version, about)]
struct Args {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on; overrides `server.bind`.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Node registry file; overrides `store.path`.
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(store) = args.store {
        config.store.path = Some(store);
    }

    let telemetry = telemetry::init(&config.telemetry)?;
    let outcome = run(config).await;
    if let Err(err) = &outcome {
        tracing::error!(error = format!("{err:#}"), "cihub stopped");
    }
    telemetry.shutdown();
    outcome
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn NodeStore> = match &config.store.path {
        Some(path) => {
            info!(path = %path.display(), "using file node store");
            Arc::new(JsonFileNodeStore::new(path))
        }
        None => {
            warn!("no store path configured; registered nodes are lost on exit");
            Arc::new(MemoryNodeStore::new())
        }
    };

    let jenkins = JenkinsClient::new(config.jenkins.client_config())
        .context("failed to build the Jenkins client")?;
    let clients = RemoteClients::new().with(NodeKind::Jenkins, Arc::new(jenkins));

    let engine = Aggregator::open(store, clients, config.engine.settings())
        .await
        .context("failed to load the node registry")?;
    let engine = Arc::new(engine);

    let sweeper = tokio::spawn(sweep(engine.clone(), config.engine.sweep_interval()));

    let app = gateway::router(engine.clone(), &config.server.base_path);
    let listener = TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(
        addr = %listener.local_addr()?,
        base_path = %config.server.base_path,
        nodes = engine.node_count(),
        "cihub listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    sweeper.abort();
    info!("cihub stopped");
    Ok(())
}

/// Evicts expired cache entries every `every`.
async fn sweep(engine: Arc<Aggregator>, every: Duration) {
    let mut ticks = tokio::time::interval(every);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        let evicted = engine.sweep();
        debug!(evicted, "sweep finished");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}
