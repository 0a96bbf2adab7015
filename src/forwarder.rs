//! Dynamic TCP/UDP port forwarders
//!
//! A reconcile tick every 10 seconds mirrors the listener set onto the proxy
//! list in the snapshot: missing listeners are bound, listeners whose port
//! left the list are stopped. Each TCP connection is piped bidirectionally to
//! the configured target; UDP relays one response datagram per request.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, ProxyRecord};

/// Listener reconciliation period.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Upstream TCP connect timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a UDP response datagram.
const UDP_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-datagram buffer size.
const UDP_BUFFER_SIZE: usize = 65535;

/// Per-listener traffic counters.
#[derive(Default)]
pub struct ForwarderStats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

struct ActiveForwarder {
    protocol: String,
    task: JoinHandle<()>,
    stats: Arc<ForwarderStats>,
}

/// Owns the listener table; the reconcile loop is its only writer.
pub struct ForwarderManager {
    store: Arc<ConfigStore>,
    active: HashMap<u16, ActiveForwarder>,
}

impl ForwarderManager {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            active: HashMap::new(),
        }
    }

    /// Reconcile immediately, then on every tick, forever.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            ticker.tick().await;
            self.reconcile_once().await;
        }
    }

    /// One reconcile pass against the current snapshot.
    pub async fn reconcile_once(&mut self) {
        let proxies = self.store.list_proxies();

        let mut target_ports: HashSet<u16> = HashSet::new();
        for proxy in &proxies {
            target_ports.insert(proxy.listen_port);

            if self.active.contains_key(&proxy.listen_port) {
                continue;
            }
            match proxy.protocol.as_str() {
                "tcp" => {
                    if let Some(forwarder) = start_tcp(proxy).await {
                        self.active.insert(proxy.listen_port, forwarder);
                    }
                }
                "udp" => {
                    if let Some(forwarder) = start_udp(proxy).await {
                        self.active.insert(proxy.listen_port, forwarder);
                    }
                }
                "" => warn!(
                    name = %proxy.name,
                    port = proxy.listen_port,
                    "skipping proxy with empty protocol"
                ),
                other => warn!(
                    name = %proxy.name,
                    port = proxy.listen_port,
                    protocol = other,
                    "skipping proxy with unknown protocol"
                ),
            }
        }

        self.active.retain(|port, forwarder| {
            if target_ports.contains(port) {
                return true;
            }
            info!(port, protocol = %forwarder.protocol, "stopping forwarder");
            forwarder.task.abort();
            false
        });
    }

    /// Currently bound listener ports.
    pub fn active_ports(&self) -> Vec<u16> {
        self.active.keys().copied().collect()
    }

    /// Traffic counters for the listener on `port`, if one is active.
    pub fn stats(&self, port: u16) -> Option<Arc<ForwarderStats>> {
        self.active.get(&port).map(|f| f.stats.clone())
    }
}

fn target_addr(proxy: &ProxyRecord) -> String {
    format!("{}:{}", proxy.target_host, proxy.target_port)
}

async fn start_tcp(proxy: &ProxyRecord) -> Option<ActiveForwarder> {
    let listener = match TcpListener::bind(("0.0.0.0", proxy.listen_port)).await {
        Ok(l) => l,
        Err(e) => {
            warn!(port = proxy.listen_port, error = %e, "failed to bind TCP forwarder");
            return None;
        }
    };

    info!(
        name = %proxy.name,
        port = proxy.listen_port,
        target = %target_addr(proxy),
        "TCP forwarder started"
    );

    let stats = Arc::new(ForwarderStats::default());
    let task = tokio::spawn(run_tcp(listener, target_addr(proxy), stats.clone()));
    Some(ActiveForwarder {
        protocol: "tcp".to_string(),
        task,
        stats,
    })
}

pub(crate) async fn run_tcp(listener: TcpListener, target: String, stats: Arc<ForwarderStats>) {
    loop {
        let (client, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "TCP forwarder accept error");
                continue;
            }
        };
        debug!(%peer, %target, "TCP forwarder connection");
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(pipe_tcp(client, target.clone(), stats.clone()));
    }
}

/// Dial the target and copy bytes both ways until one side closes, then tear
/// both down.
async fn pipe_tcp(client: TcpStream, target: String, stats: Arc<ForwarderStats>) {
    let upstream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            warn!(%target, error = %e, "TCP forwarder failed to reach target");
            stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        Err(_) => {
            warn!(%target, "TCP forwarder dial timed out");
            stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let inbound_stats = stats.clone();
    let mut inbound = tokio::spawn(async move {
        let n = tokio::io::copy(&mut client_read, &mut upstream_write)
            .await
            .unwrap_or(0);
        inbound_stats.bytes_received.fetch_add(n, Ordering::Relaxed);
    });

    let outbound_stats = stats.clone();
    let mut outbound = tokio::spawn(async move {
        let n = tokio::io::copy(&mut upstream_read, &mut client_write)
            .await
            .unwrap_or(0);
        outbound_stats.bytes_sent.fetch_add(n, Ordering::Relaxed);
    });

    tokio::select! {
        _ = &mut inbound => outbound.abort(),
        _ = &mut outbound => inbound.abort(),
    }
    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
}

async fn start_udp(proxy: &ProxyRecord) -> Option<ActiveForwarder> {
    let socket = match UdpSocket::bind(("0.0.0.0", proxy.listen_port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(port = proxy.listen_port, error = %e, "failed to bind UDP forwarder");
            return None;
        }
    };

    info!(
        name = %proxy.name,
        port = proxy.listen_port,
        target = %target_addr(proxy),
        "UDP forwarder started"
    );

    let stats = Arc::new(ForwarderStats::default());
    let task = tokio::spawn(run_udp(Arc::new(socket), target_addr(proxy)));
    Some(ActiveForwarder {
        protocol: "udp".to_string(),
        task,
        stats,
    })
}

pub(crate) async fn run_udp(socket: Arc<UdpSocket>, target: String) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let (len, client) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP forwarder read error");
                continue;
            }
        };
        let payload = buf[..len].to_vec();
        tokio::spawn(relay_udp(socket.clone(), client, payload, target.clone()));
    }
}

/// Fire one datagram at the target from an ephemeral socket and relay at
/// most one response. Unreachable targets and timeouts drop silently.
async fn relay_udp(listener: Arc<UdpSocket>, client: SocketAddr, payload: Vec<u8>, target: String) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(_) => return,
    };
    if socket.connect(&target).await.is_err() {
        return;
    }
    if socket.send(&payload).await.is_err() {
        return;
    }

    let mut response = vec![0u8; UDP_BUFFER_SIZE];
    let len = match tokio::time::timeout(UDP_READ_TIMEOUT, socket.recv(&mut response)).await {
        Ok(Ok(len)) => len,
        _ => return,
    };

    if let Err(e) = listener.send_to(&response[..len], client).await {
        warn!(error = %e, "UDP forwarder failed to write response");
    }
}
