//! Reconciled configuration model and the process-wide snapshot store
//!
//! The Reconciler produces an immutable [`Snapshot`] per poll cycle and
//! publishes it through [`ConfigStore::swap`]. Data-plane components grab a
//! snapshot reference per request and never take a lock: publication is a
//! single atomic pointer swap, so a reader either sees the old snapshot fully
//! or the new one fully.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

/// Typed payload of a DNS record.
///
/// Address values are parsed at construction; a record whose value does not
/// parse for its declared type is rejected by [`RecordData::from_wire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Mx { preference: u16, exchange: String },
    Txt(String),
}

impl RecordData {
    /// Build typed record data from the wire discriminator + value pair.
    ///
    /// Returns `None` for unknown types and for A/AAAA values that are not
    /// valid address literals.
    pub fn from_wire(rtype: &str, value: &str, priority: u16) -> Option<Self> {
        match rtype {
            "A" => value.parse().ok().map(RecordData::A),
            "AAAA" => value.parse().ok().map(RecordData::Aaaa),
            "CNAME" => Some(RecordData::Cname(value.to_string())),
            "MX" => Some(RecordData::Mx {
                preference: priority,
                exchange: value.to_string(),
            }),
            "TXT" => Some(RecordData::Txt(value.to_string())),
            _ => None,
        }
    }

    /// Wire-format type name, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            RecordData::A(_) => "A",
            RecordData::Aaaa(_) => "AAAA",
            RecordData::Cname(_) => "CNAME",
            RecordData::Mx { .. } => "MX",
            RecordData::Txt(_) => "TXT",
        }
    }
}

/// A single reconciled DNS record.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    /// `"@"` for the apex, a bare subdomain label, or an FQDN with a
    /// trailing dot.
    pub name: String,
    pub data: RecordData,
    pub ttl: u32,
    pub http_proxy_enabled: bool,
}

impl DnsRecord {
    /// Fully qualified name of this record under `domain`, lowercase and
    /// without a trailing dot.
    pub fn fqdn(&self, domain: &str) -> String {
        let name = if self.name == "@" || self.name.is_empty() {
            domain.to_string()
        } else if self.name.ends_with('.') {
            self.name.trim_end_matches('.').to_string()
        } else {
            format!("{}.{}", self.name, domain)
        };
        name.to_ascii_lowercase()
    }
}

/// Which edge protocol a domain is restricted to, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeScheme {
    Http,
    Https,
}

/// HTTP proxying settings for a domain.
#[derive(Debug, Clone, Default)]
pub struct HttpProxySettings {
    /// Protocol restriction; `None` means both edges may serve the domain.
    pub kind: Option<EdgeScheme>,
    pub enabled: bool,
}

/// TLS material for a domain, delivered inline by Core.
#[derive(Debug, Clone, Default)]
pub struct SslSettings {
    pub enabled: bool,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub auto_renew: bool,
}

/// The reconciled unit, keyed by canonical (lowercase, no trailing dot)
/// domain name.
#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub domain: String,
    pub dns_records: Vec<DnsRecord>,
    /// Location key (lowercase ISO 3166-1 alpha-2 or `"default"`) → answer IP.
    pub geo_map: HashMap<String, Ipv4Addr>,
    pub http_proxy: HttpProxySettings,
    pub ssl: SslSettings,
    /// Per-domain filter script source; empty means no filter.
    pub script: String,
}

impl DomainRecord {
    /// Whether either the domain-level flag or any record-level flag enables
    /// HTTP proxying.
    pub fn http_enabled(&self) -> bool {
        self.http_proxy.enabled || self.dns_records.iter().any(|r| r.http_proxy_enabled)
    }
}

/// A raw TCP/UDP forwarder definition from Core.
#[derive(Debug, Clone)]
pub struct ProxyRecord {
    pub id: String,
    pub name: String,
    /// `"tcp"` or `"udp"`; other values are carried through and skipped by
    /// the forwarder with a warning.
    pub protocol: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub enabled: bool,
}

/// An immutable configuration snapshot.
#[derive(Debug, Default)]
pub struct Snapshot {
    domains: Vec<DomainRecord>,
    by_name: HashMap<String, usize>,
    proxies: Vec<ProxyRecord>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(domains: Vec<DomainRecord>, proxies: Vec<ProxyRecord>) -> Self {
        let by_name = domains
            .iter()
            .enumerate()
            .map(|(i, d)| (d.domain.clone(), i))
            .collect();
        Self {
            domains,
            by_name,
            proxies,
            last_update: Some(Utc::now()),
        }
    }

    /// Look up a domain, case- and trailing-dot-insensitively.
    ///
    /// If `name` has no exact entry, the parent domain (the last two
    /// dot-separated labels) is consulted; deeper ancestors are not.
    pub fn get_domain(&self, name: &str) -> Option<&DomainRecord> {
        let name = canonical_name(name);
        if let Some(&i) = self.by_name.get(&name) {
            return Some(&self.domains[i]);
        }
        let parent = parent_domain(&name)?;
        self.by_name.get(&parent).map(|&i| &self.domains[i])
    }

    pub fn domains(&self) -> &[DomainRecord] {
        &self.domains
    }

    pub fn proxies(&self) -> &[ProxyRecord] {
        &self.proxies
    }
}

/// Lowercase a queried name and strip the trailing dot.
pub fn canonical_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Parent of a subdomain: the last two dot-separated labels.
/// `None` when `name` already has two or fewer labels.
fn parent_domain(name: &str) -> Option<String> {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() <= 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}

/// Process-wide snapshot holder: many concurrent readers, one writer.
///
/// Readers only pay an atomic pointer load; the writer swaps the pointer.
pub struct ConfigStore {
    snapshot: ArcSwap<Snapshot>,
}

impl ConfigStore {
    /// Create a store holding an empty snapshot (no domains, no proxies,
    /// no `last_update`), served until the first reconcile succeeds.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    /// Current snapshot. The returned `Arc` stays coherent for as long as
    /// the caller holds it, across any number of concurrent swaps.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Atomically publish a new snapshot.
    pub fn swap(&self, snapshot: Snapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Cloned domain record for a one-shot lookup. Request paths that read
    /// the record more than once should hold a [`Self::snapshot`] instead.
    pub fn get_domain(&self, name: &str) -> Option<DomainRecord> {
        self.snapshot.load().get_domain(name).cloned()
    }

    /// Stable copy of the current domain list.
    pub fn list_domains(&self) -> Vec<DomainRecord> {
        self.snapshot.load().domains().to_vec()
    }

    /// Stable copy of the current proxy list.
    pub fn list_proxies(&self) -> Vec<ProxyRecord> {
        self.snapshot.load().proxies().to_vec()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
