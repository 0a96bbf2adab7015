//! Liveness and statistics endpoint
//!
//! `GET /health` answers a liveness summary, `GET /stats` a fuller
//! config/runtime breakdown. Field names are part of the agent's external
//! interface and mirror what fleet monitoring already scrapes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::metrics::AgentMetrics;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime: String,
    last_poll: String,
    domains_loaded: u64,
    proxies_active: u64,
    memory_usage: String,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct StatsResponse {
    config: ConfigStats,
    runtime: RuntimeStats,
}

#[derive(Serialize)]
struct ConfigStats {
    total_polls: u64,
    failed_polls: u64,
    last_poll_time: Option<DateTime<Utc>>,
    domains_loaded: u64,
    proxies_active: u64,
}

#[derive(Serialize)]
struct RuntimeStats {
    uptime: String,
    memory_alloc: String,
    memory_sys: String,
    num_goroutine: usize,
    num_cpu: usize,
}

pub async fn run_health_server(addr: SocketAddr, metrics: Arc<AgentMetrics>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .with_state(metrics);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_health(State(metrics): State<Arc<AgentMetrics>>) -> Json<HealthResponse> {
    let poll = metrics.poll_snapshot();
    let (resident, _) = memory_stats();

    Json(HealthResponse {
        status: "healthy",
        uptime: format_uptime(metrics.uptime_secs()),
        last_poll: poll
            .last_poll_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        domains_loaded: poll.domains_loaded,
        proxies_active: poll.proxies_active,
        memory_usage: format_bytes(resident),
        timestamp: Utc::now(),
    })
}

async fn handle_stats(State(metrics): State<Arc<AgentMetrics>>) -> Json<StatsResponse> {
    let poll = metrics.poll_snapshot();
    let (resident, virtual_size) = memory_stats();

    Json(StatsResponse {
        config: ConfigStats {
            total_polls: poll.total_polls,
            failed_polls: poll.failed_polls,
            last_poll_time: poll.last_poll_time,
            domains_loaded: poll.domains_loaded,
            proxies_active: poll.proxies_active,
        },
        runtime: RuntimeStats {
            uptime: format_uptime(metrics.uptime_secs()),
            memory_alloc: format_bytes(resident),
            memory_sys: format_bytes(virtual_size),
            num_goroutine: alive_tasks(),
            num_cpu: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        },
    })
}

/// Concurrent tasks currently alive on the runtime.
fn alive_tasks() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|h| h.metrics().num_alive_tasks())
        .unwrap_or(0)
}

/// Resident and virtual memory of this process, in bytes. Zero where the
/// platform does not expose them.
fn memory_stats() -> (u64, u64) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };
            return (field("VmRSS:"), field("VmSize:"));
        }
    }
    (0, 0)
}

fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, b"KMGTPE"[exp] as char)
}

fn format_uptime(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{hours}h{minutes}m{secs}s")
    } else if minutes > 0 {
        format!("{minutes}m{secs}s")
    } else {
        format!("{secs}s")
    }
}
