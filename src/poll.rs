//! Core reconciliation: periodic poll, payload normalization, snapshot swap
//!
//! The agent POSTs its credentials to `<core_url>/api/agent/poll` on a fixed
//! interval. A successful response is normalized into a fresh [`Snapshot`]
//! and atomically published; any failure leaves the live snapshot untouched,
//! so the agent keeps serving the last good configuration indefinitely.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{
    ConfigStore, DnsRecord, DomainRecord, EdgeScheme, HttpProxySettings, ProxyRecord, RecordData,
    Snapshot, SslSettings, canonical_name,
};
use crate::metrics::{inc, AgentMetrics};

/// Overall timeout for one poll round-trip.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PollRequest<'a> {
    agent_id: &'a str,
    agent_key: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct PollResponse {
    pub success: bool,
    #[serde(default)]
    pub domains: Vec<WireDomain>,
    #[serde(default)]
    pub proxies: Vec<WireProxy>,
}

#[derive(Debug, Deserialize)]
pub struct WireDomain {
    pub domain: String,
    #[serde(rename = "dnsRecords", default)]
    pub dns_records: Vec<WireDnsRecord>,
    #[serde(rename = "geoDnsMap", default)]
    pub geo_dns_map: HashMap<String, String>,
    #[serde(rename = "httpProxy", default)]
    pub http_proxy: WireHttpProxy,
    #[serde(default)]
    pub ssl: WireSsl,
    #[serde(rename = "luaCode", default)]
    pub lua_code: String,
}

#[derive(Debug, Deserialize)]
pub struct WireDnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub value: String,
    #[serde(default)]
    pub ttl: u32,
    #[serde(rename = "httpProxyEnabled", default)]
    pub http_proxy_enabled: bool,
    #[serde(default)]
    pub priority: u16,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireHttpProxy {
    /// Core calls the restriction "type"; empty string means unrestricted.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireSsl {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub certificate: String,
    #[serde(rename = "privateKey", default)]
    pub private_key: String,
    #[serde(rename = "autoRenew", default)]
    pub auto_renew: bool,
}

/// Core reuses `type` for the transport protocol and names the ports
/// `sourcePort`/`destinationPort`; translated here at the boundary so the
/// rest of the agent never sees the collision with DNS record types.
#[derive(Debug, Deserialize)]
pub struct WireProxy {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub protocol: String,
    #[serde(rename = "sourcePort")]
    pub listen_port: u16,
    #[serde(rename = "destinationHost", default)]
    pub target_host: String,
    #[serde(rename = "destinationPort", default)]
    pub target_port: u16,
    #[serde(default)]
    pub enabled: bool,
}

fn is_country_code(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_alphabetic())
}

fn normalize_domain(wire: WireDomain) -> DomainRecord {
    let domain = canonical_name(&wire.domain);

    // Geo entries sent directly by Core are validated the same way as the
    // ones materialized from A-records below.
    let mut geo_map: HashMap<String, Ipv4Addr> = HashMap::new();
    for (key, value) in wire.geo_dns_map {
        let key = key.to_ascii_lowercase();
        if key != "default" && !is_country_code(&key) {
            warn!(%domain, %key, "dropping geo entry with invalid location key");
            continue;
        }
        match value.parse::<Ipv4Addr>() {
            Ok(ip) => {
                geo_map.insert(key, ip);
            }
            Err(_) => warn!(%domain, %key, %value, "dropping geo entry with invalid IPv4"),
        }
    }

    let mut dns_records = Vec::with_capacity(wire.dns_records.len());
    for rec in wire.dns_records {
        // A-records named after a country are GeoDNS placement entries:
        // they move into the geo map and leave the record set.
        if rec.rtype == "A" && is_country_code(&rec.name) {
            let location = rec.name.to_ascii_lowercase();
            match rec.value.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    geo_map.insert(location, ip);
                }
                Err(_) => warn!(
                    %domain,
                    %location,
                    value = %rec.value,
                    "dropping GeoDNS record with invalid IPv4"
                ),
            }
            continue;
        }

        // The apex A-record doubles as the geo map's default, and stays
        // in the record set for ordinary queries.
        if rec.rtype == "A"
            && (rec.name == "@" || rec.name.is_empty() || canonical_name(&rec.name) == domain)
        {
            if let Ok(ip) = rec.value.parse::<Ipv4Addr>() {
                geo_map.insert("default".to_string(), ip);
            }
        }

        match RecordData::from_wire(&rec.rtype, &rec.value, rec.priority) {
            Some(data) => dns_records.push(DnsRecord {
                name: rec.name,
                data,
                ttl: rec.ttl,
                http_proxy_enabled: rec.http_proxy_enabled,
            }),
            None => warn!(
                %domain,
                name = %rec.name,
                rtype = %rec.rtype,
                value = %rec.value,
                "dropping DNS record with unknown type or unparsable value"
            ),
        }
    }

    let kind = match wire.http_proxy.kind.as_str() {
        "http" => Some(EdgeScheme::Http),
        "https" => Some(EdgeScheme::Https),
        "" => None,
        other => {
            warn!(%domain, kind = other, "ignoring unknown http proxy type");
            None
        }
    };

    // Core omits the enabled flag when a type is set; a record-level flag
    // also forces the domain on.
    let enabled = wire.http_proxy.enabled
        || kind.is_some()
        || dns_records.iter().any(|r| r.http_proxy_enabled);

    DomainRecord {
        domain,
        dns_records,
        geo_map,
        http_proxy: HttpProxySettings { kind, enabled },
        ssl: SslSettings {
            enabled: wire.ssl.enabled,
            certificate_pem: wire.ssl.certificate,
            private_key_pem: wire.ssl.private_key,
            auto_renew: wire.ssl.auto_renew,
        },
        script: wire.lua_code,
    }
}

/// Validate and normalize a poll payload into a publishable snapshot.
pub fn normalize(domains: Vec<WireDomain>, proxies: Vec<WireProxy>) -> Snapshot {
    let domains: Vec<DomainRecord> = domains.into_iter().map(normalize_domain).collect();

    // Listen ports are unique; if Core sends a duplicate the last one wins.
    let mut out: Vec<ProxyRecord> = Vec::with_capacity(proxies.len());
    let mut by_port: HashMap<u16, usize> = HashMap::new();
    for wire in proxies {
        let record = ProxyRecord {
            id: wire.id,
            name: wire.name,
            protocol: wire.protocol.to_ascii_lowercase(),
            listen_port: wire.listen_port,
            target_host: wire.target_host,
            target_port: wire.target_port,
            enabled: wire.enabled,
        };
        match by_port.get(&record.listen_port) {
            Some(&i) => {
                warn!(
                    port = record.listen_port,
                    "duplicate proxy listen port, keeping the later entry"
                );
                out[i] = record;
            }
            None => {
                by_port.insert(record.listen_port, out.len());
                out.push(record);
            }
        }
    }

    Snapshot::new(domains, out)
}

/// Periodically reconciles the agent against Core.
pub struct Reconciler {
    core_url: String,
    agent_id: String,
    agent_key: String,
    store: Arc<ConfigStore>,
    metrics: Arc<AgentMetrics>,
    client: reqwest::Client,
}

impl Reconciler {
    pub fn new(
        core_url: String,
        agent_id: String,
        agent_key: String,
        store: Arc<ConfigStore>,
        metrics: Arc<AgentMetrics>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(POLL_TIMEOUT).build()?;
        Ok(Self {
            core_url,
            agent_id,
            agent_key,
            store,
            metrics,
            client,
        })
    }

    /// Poll immediately, then on every interval tick, forever.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    /// One reconcile cycle. Failures are logged and counted; the live
    /// snapshot is only replaced on a fully decoded, successful response.
    pub async fn poll_once(&self) {
        inc(&self.metrics.poll.total_polls);
        debug!("fetching configuration from Core");

        let request = PollRequest {
            agent_id: &self.agent_id,
            agent_key: &self.agent_key,
        };

        let response = match self
            .client
            .post(format!("{}/api/agent/poll", self.core_url))
            .bearer_auth(&self.agent_key)
            .json(&request)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "poll transport error, keeping current snapshot");
                inc(&self.metrics.poll.failed_polls);
                return;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "poll rejected by Core, keeping current snapshot");
            inc(&self.metrics.poll.failed_polls);
            return;
        }

        let payload: PollResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "poll decode error, keeping current snapshot");
                inc(&self.metrics.poll.failed_polls);
                return;
            }
        };

        if !payload.success {
            warn!("Core returned success=false, keeping current snapshot");
            inc(&self.metrics.poll.failed_polls);
            return;
        }

        let snapshot = normalize(payload.domains, payload.proxies);
        let (domains, proxies) = (snapshot.domains().len(), snapshot.proxies().len());

        for d in snapshot.domains() {
            debug!(
                domain = %d.domain,
                records = d.dns_records.len(),
                geo_entries = d.geo_map.len(),
                http_proxy = d.http_proxy.enabled,
                ssl = d.ssl.enabled,
                "reconciled domain"
            );
        }
        for p in snapshot.proxies() {
            debug!(
                name = %p.name,
                protocol = %p.protocol,
                listen_port = p.listen_port,
                target = %format!("{}:{}", p.target_host, p.target_port),
                "reconciled proxy"
            );
        }

        self.store.swap(snapshot);
        self.metrics.poll.record_success(domains, proxies);
        info!(domains, proxies, "configuration updated");
    }
}
