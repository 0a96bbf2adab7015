//! Edge agent entrypoint
//!
//! Wires the reconciler, DNS server, HTTP/HTTPS edges, port forwarders, and
//! the health endpoint together. Everything is configured from the
//! environment; the agent runs until it receives a termination signal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edge_agent::config::ConfigStore;
use edge_agent::dns::DnsServer;
use edge_agent::edge::{run_http_edge, run_https_edge};
use edge_agent::forwarder::ForwarderManager;
use edge_agent::geoip::GeoLocator;
use edge_agent::health::run_health_server;
use edge_agent::metrics::AgentMetrics;
use edge_agent::poll::Reconciler;
use edge_agent::waf::ScriptFilter;

/// Edge agent: GeoDNS, filtered reverse proxy, and dynamic port forwarding
#[derive(Parser, Debug)]
#[command(name = "edge-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Agent identifier issued by Core
    #[arg(long, env = "AGENT_ID")]
    agent_id: String,

    /// Agent authentication key
    #[arg(long, env = "AGENT_KEY")]
    agent_key: String,

    /// Base URL of the Core control plane
    #[arg(long, env = "CORE_URL")]
    core_url: String,

    /// Seconds between configuration polls
    #[arg(long, env = "POLLING_INTERVAL", default_value = "60")]
    polling_interval: u64,

    /// Path to the MaxMind city database for GeoDNS
    #[arg(long, env = "GEOIP_DB", default_value = "GeoLite2-City.mmdb")]
    geoip_db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls crypto provider before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "starting edge agent");
    info!(agent_id = %args.agent_id, core_url = %args.core_url, "agent identity");

    let store = Arc::new(ConfigStore::new());
    let metrics = Arc::new(AgentMetrics::new());
    let filter = Arc::new(ScriptFilter::new());

    // A missing GeoIP database degrades GeoDNS to "default" answers only.
    let geo = match GeoLocator::open(&args.geoip_db) {
        Ok(locator) => Some(Arc::new(locator)),
        Err(e) => {
            warn!(path = %args.geoip_db.display(), error = %e,
                "GeoIP database unavailable, all clients treated as default");
            None
        }
    };

    let reconciler = Reconciler::new(
        args.core_url.clone(),
        args.agent_id.clone(),
        args.agent_key.clone(),
        store.clone(),
        metrics.clone(),
    )?;
    tokio::spawn(reconciler.run(Duration::from_secs(args.polling_interval)));

    // Give the first poll a chance to land before the data planes come up.
    info!("waiting for initial configuration");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let dns = Arc::new(DnsServer::new(store.clone(), geo, metrics.clone()));
    let mut dns_task = tokio::spawn(dns.run(53));

    let http_store = store.clone();
    let http_filter = filter.clone();
    let http_metrics = metrics.clone();
    tokio::spawn(async move {
        let addr: SocketAddr = ([0, 0, 0, 0], 80).into();
        if let Err(e) = run_http_edge(addr, http_store, http_filter, http_metrics).await {
            error!(error = %e, "HTTP edge failed");
        }
    });

    let https_store = store.clone();
    let https_metrics = metrics.clone();
    tokio::spawn(async move {
        let addr: SocketAddr = ([0, 0, 0, 0], 443).into();
        if let Err(e) = run_https_edge(addr, https_store, filter, https_metrics).await {
            error!(error = %e, "HTTPS edge failed");
        }
    });

    tokio::spawn(ForwarderManager::new(store).run());

    let health_metrics = metrics.clone();
    tokio::spawn(async move {
        let addr: SocketAddr = ([0, 0, 0, 0], 8080).into();
        if let Err(e) = run_health_server(addr, health_metrics).await {
            error!(error = %e, "health server failed");
        }
    });

    info!("edge agent started");

    tokio::select! {
        // Failing to bind the DNS sockets is the one fatal data-plane error.
        result = &mut dns_task => {
            result??;
            anyhow::bail!("DNS server exited unexpectedly");
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, shutting down");
        }
    }

    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}
