//! Agent-wide counters
//!
//! Lock-free atomic counters grouped per subsystem, with a `snapshot()` view
//! consumed by the observability endpoint. Counters are monotonically
//! increasing except the `*_loaded`/`*_active` gauges, which track the most
//! recent reconcile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Reconciler counters.
#[derive(Default)]
pub struct PollMetrics {
    pub total_polls: AtomicU64,
    pub failed_polls: AtomicU64,
    pub domains_loaded: AtomicU64,
    pub proxies_active: AtomicU64,
    last_poll_time: RwLock<Option<DateTime<Utc>>>,
}

impl PollMetrics {
    pub fn record_success(&self, domains: usize, proxies: usize) {
        self.domains_loaded.store(domains as u64, Ordering::Relaxed);
        self.proxies_active.store(proxies as u64, Ordering::Relaxed);
        *self.last_poll_time.write() = Some(Utc::now());
    }

    pub fn last_poll_time(&self) -> Option<DateTime<Utc>> {
        *self.last_poll_time.read()
    }
}

/// DNS resolver counters.
#[derive(Default)]
pub struct DnsMetrics {
    pub total_queries: AtomicU64,
    pub geodns_queries: AtomicU64,
    pub nxdomain: AtomicU64,
}

/// Shared between the HTTP and HTTPS edges.
#[derive(Default)]
pub struct HttpEdgeMetrics {
    pub total_requests: AtomicU64,
    pub blocked_requests: AtomicU64,
    pub proxy_errors: AtomicU64,
}

/// Point-in-time view of the reconciler counters.
pub struct PollSnapshot {
    pub total_polls: u64,
    pub failed_polls: u64,
    pub domains_loaded: u64,
    pub proxies_active: u64,
    pub last_poll_time: Option<DateTime<Utc>>,
}

/// Global metrics registry, created once at startup and shared by all tasks.
pub struct AgentMetrics {
    pub poll: PollMetrics,
    pub dns: DnsMetrics,
    pub http: HttpEdgeMetrics,
    start_time: Instant,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self {
            poll: PollMetrics::default(),
            dns: DnsMetrics::default(),
            http: HttpEdgeMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// Seconds since the registry was created (process start).
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn poll_snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            total_polls: self.poll.total_polls.load(Ordering::Relaxed),
            failed_polls: self.poll.failed_polls.load(Ordering::Relaxed),
            domains_loaded: self.poll.domains_loaded.load(Ordering::Relaxed),
            proxies_active: self.poll.proxies_active.load(Ordering::Relaxed),
            last_poll_time: self.poll.last_poll_time(),
        }
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: relaxed increment, the only ordering these counters need.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
