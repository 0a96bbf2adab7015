//! Edge agent for a distributed traffic-management system.
//!
//! The agent reconciles itself against a central control plane ("Core") and
//! serves four data planes from the reconciled snapshot:
//! - Authoritative DNS with geographic answer selection (GeoDNS)
//! - HTTP/HTTPS reverse proxy with per-domain SNI certificates and a
//!   per-domain scripted request filter
//! - Dynamic TCP/UDP port forwarders mirroring Core's proxy list
//! - A liveness/statistics endpoint

pub mod config;
pub mod dns;
pub mod edge;
pub mod forwarder;
pub mod geoip;
pub mod health;
pub mod metrics;
pub mod poll;
pub mod waf;

// Re-export commonly used types
pub use config::{ConfigStore, DnsRecord, DomainRecord, ProxyRecord, RecordData, Snapshot};
pub use geoip::GeoLocator;
pub use metrics::AgentMetrics;
pub use poll::Reconciler;
pub use waf::ScriptFilter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
