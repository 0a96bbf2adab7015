//! Authoritative DNS with geographic answer selection
//!
//! Serves UDP and TCP on port 53 straight from the current snapshot. A-queries
//! for a domain's apex route through GeoDNS when the domain carries a geo map:
//! the client's country is resolved via [`GeoLocator`], then an answer IP is
//! chosen by exact match, country-neighbor fallback, the `"default"` entry,
//! any entry, and finally the first plain A-record.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::config::{canonical_name, ConfigStore, DomainRecord, RecordData};
use crate::geoip::GeoLocator;
use crate::metrics::{inc, AgentMetrics};

/// GeoDNS answers always use a short fixed TTL so clients re-resolve as they
/// move, regardless of the apex record's configured TTL.
const GEO_TTL: u32 = 60;

/// Country proximity, ordered by affinity. First neighbor present in the
/// domain's geo map wins.
fn neighbor_candidates(code: &str) -> &'static [&'static str] {
    match code {
        "us" => &["ca", "mx", "gb", "de"],
        "ca" => &["us", "mx", "gb", "de"],
        "mx" => &["us", "ca", "br", "cl"],
        "br" => &["ar", "cl", "us", "mx"],
        "ar" => &["br", "cl", "mx", "us"],
        "cl" => &["ar", "br", "mx", "us"],
        "co" => &["br", "ar", "mx", "cl"],
        "gb" => &["de", "fr", "nl", "us"],
        "de" => &["nl", "fr", "gb", "pl"],
        "fr" => &["de", "gb", "es", "it"],
        "it" => &["fr", "de", "es", "tr"],
        "es" => &["fr", "it", "br", "mx"],
        "nl" => &["de", "gb", "fr", "pl"],
        "pl" => &["de", "ua", "ru", "nl"],
        "ua" => &["pl", "ru", "tr", "de"],
        "ru" => &["ua", "pl", "kz", "cn"],
        "cn" => &["jp", "kr", "sg", "in"],
        "jp" => &["kr", "cn", "sg", "au"],
        "kr" => &["jp", "cn", "sg", "au"],
        "in" => &["sg", "th", "id", "ae"],
        "id" => &["sg", "th", "au", "in"],
        "th" => &["sg", "id", "in", "cn"],
        "sg" => &["id", "th", "in", "au"],
        "au" => &["nz", "sg", "id", "jp"],
        "nz" => &["au", "sg", "id", "jp"],
        "za" => &["eg", "ng", "ae", "gb"],
        "eg" => &["ae", "tr", "za", "ng"],
        "ng" => &["za", "eg", "br", "fr"],
        "ae" => &["ir", "tr", "in", "eg"],
        "tr" => &["ae", "ir", "eg", "it"],
        "ir" => &["ae", "tr", "kz", "in"],
        "kz" => &["ru", "cn", "ir", "tr"],
        _ => &[],
    }
}

/// Pick the answer IP for a GeoDNS query. Stages, in order: exact location,
/// country neighbors, `"default"`, any map entry, first plain A-record.
fn select_geo_ip(domain: &DomainRecord, location: &str) -> Option<std::net::Ipv4Addr> {
    if let Some(ip) = domain.geo_map.get(location) {
        return Some(*ip);
    }
    for neighbor in neighbor_candidates(location) {
        if let Some(ip) = domain.geo_map.get(*neighbor) {
            debug!(location, neighbor = *neighbor, "GeoDNS neighbor fallback");
            return Some(*ip);
        }
    }
    if let Some(ip) = domain.geo_map.get("default") {
        return Some(*ip);
    }
    if let Some((loc, ip)) = domain.geo_map.iter().next() {
        debug!(location = loc.as_str(), "GeoDNS using arbitrary map entry");
        return Some(*ip);
    }
    domain.dns_records.iter().find_map(|r| match r.data {
        RecordData::A(ip) => Some(ip),
        _ => None,
    })
}

/// Name with the root appended, for CNAME targets and MX exchanges.
fn absolute_name(value: &str) -> Option<Name> {
    Name::from_utf8(format!("{}.", value.trim_end_matches('.'))).ok()
}

/// The authoritative resolver shared by the UDP and TCP listeners.
pub struct DnsServer {
    store: Arc<ConfigStore>,
    geo: Option<Arc<GeoLocator>>,
    metrics: Arc<AgentMetrics>,
}

impl DnsServer {
    pub fn new(
        store: Arc<ConfigStore>,
        geo: Option<Arc<GeoLocator>>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self { store, geo, metrics }
    }

    /// Bind and serve both transports. Failing to bind is fatal to the agent.
    pub async fn run(self: Arc<Self>, port: u16) -> anyhow::Result<()> {
        let udp = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding DNS UDP socket on :{port}"))?;
        let tcp = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding DNS TCP socket on :{port}"))?;
        info!(port, "DNS server listening on UDP and TCP");

        let udp_server = self.clone();
        let udp_task = tokio::spawn(async move { udp_server.serve_udp(udp).await });
        let tcp_task = tokio::spawn(async move { self.serve_tcp(tcp).await });

        let _ = tokio::try_join!(udp_task, tcp_task)?;
        Ok(())
    }

    async fn serve_udp(self: Arc<Self>, socket: UdpSocket) {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "DNS UDP receive error");
                    continue;
                }
            };
            let packet = buf[..len].to_vec();
            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(reply) = server.handle_packet(&packet, Some(peer.ip())) {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        warn!(error = %e, "DNS UDP send error");
                    }
                }
            });
        }
    }

    async fn serve_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "DNS TCP accept error");
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_tcp_conn(stream, peer.ip()).await {
                    debug!(error = %e, "DNS TCP connection closed");
                }
            });
        }
    }

    /// One TCP connection: length-prefixed messages until the client hangs up.
    async fn serve_tcp_conn(
        &self,
        mut stream: tokio::net::TcpStream,
        peer: IpAddr,
    ) -> std::io::Result<()> {
        loop {
            let len = match stream.read_u16().await {
                Ok(len) => len as usize,
                Err(_) => return Ok(()),
            };
            let mut packet = vec![0u8; len];
            stream.read_exact(&mut packet).await?;

            if let Some(reply) = self.handle_packet(&packet, Some(peer)) {
                stream.write_u16(reply.len() as u16).await?;
                stream.write_all(&reply).await?;
            }
        }
    }

    /// Decode, answer, encode. Undecodable packets are dropped.
    fn handle_packet(&self, packet: &[u8], client_ip: Option<IpAddr>) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping unparsable DNS packet");
                return None;
            }
        };
        let response = self.handle_query(&request, client_ip);
        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(error = %e, "failed to encode DNS response");
                None
            }
        }
    }

    /// Answer a single query from the current snapshot.
    pub fn handle_query(&self, request: &Message, client_ip: Option<IpAddr>) -> Message {
        inc(&self.metrics.dns.total_queries);

        let mut response = reply_to(request);

        let query = match request.queries().first() {
            Some(q) => q.clone(),
            // No question section: empty authoritative reply.
            None => return response,
        };
        response.add_query(query.clone());

        let qname = canonical_name(&query.name().to_utf8());
        let qtype = query.query_type();
        debug!(name = %qname, qtype = %qtype, "DNS query");

        let snapshot = self.store.snapshot();
        let domain = match snapshot.get_domain(&qname) {
            Some(d) => d,
            None => {
                inc(&self.metrics.dns.nxdomain);
                response.set_response_code(ResponseCode::NXDomain);
                return response;
            }
        };

        let geo_eligible =
            qtype == RecordType::A && qname == domain.domain && !domain.geo_map.is_empty();
        if geo_eligible {
            inc(&self.metrics.dns.geodns_queries);
            self.answer_geo(&mut response, &query, domain, client_ip);
        } else {
            self.answer_ordinary(&mut response, &query, &qname, domain);
        }
        response
    }

    fn answer_geo(
        &self,
        response: &mut Message,
        query: &Query,
        domain: &DomainRecord,
        client_ip: Option<IpAddr>,
    ) {
        let location = match (&self.geo, client_ip) {
            (Some(geo), Some(ip)) => geo.locate(&ip.to_string()),
            _ => "default".to_string(),
        };

        match select_geo_ip(domain, &location) {
            Some(ip) => {
                debug!(domain = %domain.domain, %location, answer = %ip, "GeoDNS answer");
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    GEO_TTL,
                    RData::A(rdata::A::from(ip)),
                ));
            }
            None => {
                warn!(domain = %domain.domain, %location, "GeoDNS has no selectable IP");
                inc(&self.metrics.dns.nxdomain);
                response.set_response_code(ResponseCode::NXDomain);
            }
        }
    }

    fn answer_ordinary(
        &self,
        response: &mut Message,
        query: &Query,
        qname: &str,
        domain: &DomainRecord,
    ) {
        let qtype = query.query_type();
        for record in &domain.dns_records {
            if record.fqdn(&domain.domain) != qname {
                continue;
            }
            let rdata = match (&record.data, qtype) {
                (RecordData::A(ip), RecordType::A) => Some(RData::A(rdata::A::from(*ip))),
                (RecordData::Aaaa(ip), RecordType::AAAA) => {
                    Some(RData::AAAA(rdata::AAAA::from(*ip)))
                }
                (RecordData::Cname(target), RecordType::CNAME) => {
                    absolute_name(target).map(|n| RData::CNAME(rdata::CNAME(n)))
                }
                (RecordData::Mx { preference, exchange }, RecordType::MX) => {
                    absolute_name(exchange).map(|n| RData::MX(rdata::MX::new(*preference, n)))
                }
                (RecordData::Txt(text), RecordType::TXT) => {
                    Some(RData::TXT(rdata::TXT::new(vec![text.clone()])))
                }
                _ => None,
            };
            if let Some(rdata) = rdata {
                response.add_answer(Record::from_rdata(query.name().clone(), record.ttl, rdata));
            }
        }

        if response.answers().is_empty() {
            inc(&self.metrics.dns.nxdomain);
            response.set_response_code(ResponseCode::NXDomain);
        }
    }
}

/// Authoritative response skeleton mirroring the request envelope.
fn reply_to(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_authoritative(true);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DnsRecord, HttpProxySettings, ProxyRecord, Snapshot, SslSettings,
    };
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn record(name: &str, data: RecordData, ttl: u32) -> DnsRecord {
        DnsRecord {
            name: name.to_string(),
            data,
            ttl,
            http_proxy_enabled: false,
        }
    }

    fn domain(name: &str, records: Vec<DnsRecord>, geo: &[(&str, &str)]) -> DomainRecord {
        DomainRecord {
            domain: name.to_string(),
            dns_records: records,
            geo_map: geo
                .iter()
                .map(|(k, v)| (k.to_string(), v.parse().unwrap()))
                .collect(),
            http_proxy: HttpProxySettings::default(),
            ssl: SslSettings::default(),
            script: String::new(),
        }
    }

    fn server_with(domains: Vec<DomainRecord>) -> DnsServer {
        let store = Arc::new(ConfigStore::new());
        store.swap(Snapshot::new(domains, Vec::<ProxyRecord>::new()));
        DnsServer::new(store, None, Arc::new(AgentMetrics::new()))
    }

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.add_query(Query::query(Name::from_utf8(name).unwrap(), qtype));
        msg
    }

    fn a_ip(answer: &Record) -> Ipv4Addr {
        match answer.data() {
            Some(RData::A(a)) => a.0,
            other => panic!("expected A record, got {other:?}"),
        }
    }

    #[test]
    fn neighbor_fallback_prefers_affinity_order() {
        let d = domain("ex.io", Vec::new(), &[("de", "9.9.9.9"), ("default", "2.2.2.2")]);
        // fr → [de, gb, es, it]: de wins over default.
        assert_eq!(select_geo_ip(&d, "fr"), Some("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn no_neighbor_match_uses_default() {
        let d = domain("ex.io", Vec::new(), &[("jp", "9.9.9.9"), ("default", "2.2.2.2")]);
        assert_eq!(select_geo_ip(&d, "fr"), Some("2.2.2.2".parse().unwrap()));
    }

    #[test]
    fn empty_map_falls_back_to_first_a_record() {
        let d = domain(
            "ex.io",
            vec![
                record("mail", RecordData::Txt("x".into()), 60),
                record("@", RecordData::A("3.3.3.3".parse().unwrap()), 300),
            ],
            &[],
        );
        assert_eq!(select_geo_ip(&d, "us"), Some("3.3.3.3".parse().unwrap()));

        let empty = domain("ex.io", Vec::new(), &[]);
        assert_eq!(select_geo_ip(&empty, "us"), None);
    }

    #[test]
    fn geo_answer_uses_fixed_sixty_second_ttl() {
        let server = server_with(vec![domain(
            "ex.io",
            vec![record("@", RecordData::A("2.2.2.2".parse().unwrap()), 3600)],
            &[("us", "1.1.1.1"), ("default", "2.2.2.2")],
        )]);

        // No locator configured: every client is "default".
        let response = server.handle_query(&query("ex.io.", RecordType::A), None);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.authoritative());

        let answer = &response.answers()[0];
        assert_eq!(answer.ttl(), 60);
        assert_eq!(a_ip(answer), "2.2.2.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn queried_name_normalization_is_case_and_dot_insensitive() {
        let server = server_with(vec![domain(
            "example.com",
            vec![record("@", RecordData::A("5.5.5.5".parse().unwrap()), 120)],
            &[],
        )]);

        for name in ["example.com.", "EXAMPLE.COM."] {
            let response = server.handle_query(&query(name, RecordType::A), None);
            assert_eq!(response.answers().len(), 1, "query for {name}");
            assert_eq!(response.answers()[0].ttl(), 120);
        }
    }

    #[test]
    fn parent_fallback_serves_subdomain_records() {
        let server = server_with(vec![domain(
            "ex.io",
            vec![record(
                "_acme-challenge",
                RecordData::Txt("token123".into()),
                60,
            )],
            &[],
        )]);

        let response = server.handle_query(&query("_acme-challenge.ex.io.", RecordType::TXT), None);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        match response.answers()[0].data() {
            Some(RData::TXT(txt)) => {
                assert_eq!(txt.txt_data()[0].as_ref(), b"token123" as &[u8]);
            }
            other => panic!("expected TXT, got {other:?}"),
        }
    }

    #[test]
    fn subdomain_without_matching_record_is_nxdomain() {
        let server = server_with(vec![domain(
            "example.com",
            vec![record("@", RecordData::A("5.5.5.5".parse().unwrap()), 120)],
            &[],
        )]);

        // Parent lookup succeeds but the apex record does not answer for the
        // subdomain name.
        let response = server.handle_query(&query("sub.example.com.", RecordType::A), None);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn unknown_domain_is_nxdomain() {
        let server = server_with(Vec::new());
        let response = server.handle_query(&query("nowhere.test.", RecordType::A), None);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[test]
    fn mx_and_cname_answers_carry_record_ttl_and_fqdn_target() {
        let server = server_with(vec![domain(
            "ex.io",
            vec![
                record(
                    "@",
                    RecordData::Mx {
                        preference: 10,
                        exchange: "mail.ex.io".into(),
                    },
                    900,
                ),
                record("www", RecordData::Cname("ex.io".into()), 450),
            ],
            &[],
        )]);

        let response = server.handle_query(&query("ex.io.", RecordType::MX), None);
        match response.answers()[0].data() {
            Some(RData::MX(mx)) => {
                assert_eq!(mx.preference(), 10);
                assert_eq!(mx.exchange().to_utf8(), "mail.ex.io.");
            }
            other => panic!("expected MX, got {other:?}"),
        }
        assert_eq!(response.answers()[0].ttl(), 900);

        let response = server.handle_query(&query("www.ex.io.", RecordType::CNAME), None);
        assert_eq!(response.answers()[0].ttl(), 450);
    }

    #[test]
    fn aaaa_queries_do_not_take_the_geo_path() {
        let server = server_with(vec![domain(
            "ex.io",
            vec![record("@", RecordData::Aaaa("2001:db8::1".parse().unwrap()), 300)],
            &[("default", "2.2.2.2")],
        )]);

        let response = server.handle_query(&query("ex.io.", RecordType::AAAA), None);
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.answers()[0].ttl(), 300);
    }
}
