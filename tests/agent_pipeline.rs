//! End-to-end pipeline tests: Core payload → normalization → snapshot →
//! DNS answers, the HTTP edge request path, and forwarder listener churn.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::{TcpListener, TcpStream};

use edge_agent::config::ConfigStore;
use edge_agent::dns::DnsServer;
use edge_agent::edge::{edge_router, EdgeKind};
use edge_agent::forwarder::ForwarderManager;
use edge_agent::metrics::AgentMetrics;
use edge_agent::poll::{normalize, PollResponse};
use edge_agent::waf::ScriptFilter;

fn snapshot_from_json(body: &str) -> edge_agent::config::Snapshot {
    let response: PollResponse = serde_json::from_str(body).expect("poll payload decodes");
    assert!(response.success);
    normalize(response.domains, response.proxies)
}

fn dns_query(name: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(1234);
    msg.add_query(Query::query(Name::from_utf8(name).unwrap(), qtype));
    msg
}

#[test]
fn core_payload_flows_through_to_authoritative_answers() {
    let snapshot = snapshot_from_json(
        r#"{
            "success": true,
            "domains": [{
                "domain": "ex.io",
                "dnsRecords": [
                    {"name": "@", "type": "A", "value": "2.2.2.2", "ttl": 3600,
                     "httpProxyEnabled": false, "priority": 0},
                    {"name": "us", "type": "A", "value": "1.1.1.1", "ttl": 300,
                     "httpProxyEnabled": false, "priority": 0},
                    {"name": "_acme-challenge", "type": "TXT", "value": "token123",
                     "ttl": 60, "httpProxyEnabled": false, "priority": 0}
                ],
                "geoDnsMap": {},
                "httpProxy": {"type": ""},
                "ssl": {"enabled": false, "certificate": "", "privateKey": "", "autoRenew": false},
                "luaCode": ""
            }],
            "proxies": []
        }"#,
    );

    // Country record moved to the geo map, apex doubled as default.
    let domain = snapshot.get_domain("ex.io").unwrap();
    assert_eq!(domain.geo_map["us"], "1.1.1.1".parse::<std::net::Ipv4Addr>().unwrap());
    assert_eq!(domain.geo_map["default"], "2.2.2.2".parse::<std::net::Ipv4Addr>().unwrap());
    assert!(domain.dns_records.iter().all(|r| r.name != "us"));

    let store = Arc::new(ConfigStore::new());
    store.swap(snapshot);
    let server = DnsServer::new(store, None, Arc::new(AgentMetrics::new()));

    // GeoDNS path: no locator, so the client resolves to "default";
    // the answer carries the fixed 60 second TTL, not the record's 3600.
    let response = server.handle_query(&dns_query("ex.io.", RecordType::A), None);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.authoritative());
    let answer = &response.answers()[0];
    assert_eq!(answer.ttl(), 60);
    match answer.data() {
        Some(RData::A(a)) => assert_eq!(a.0, "2.2.2.2".parse::<std::net::Ipv4Addr>().unwrap()),
        other => panic!("expected A answer, got {other:?}"),
    }

    // Parent-domain fallback serves the challenge TXT record.
    let response = server.handle_query(
        &dns_query("_acme-challenge.ex.io.", RecordType::TXT),
        None,
    );
    assert_eq!(response.response_code(), ResponseCode::NoError);
    match response.answers()[0].data() {
        Some(RData::TXT(txt)) => assert_eq!(txt.txt_data()[0].as_ref(), b"token123" as &[u8]),
        other => panic!("expected TXT answer, got {other:?}"),
    }

    // Unrelated subdomains still miss.
    let response = server.handle_query(&dns_query("www.ex.io.", RecordType::A), None);
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
}

#[test]
fn snapshot_invariants_survive_a_messy_payload() {
    let snapshot = snapshot_from_json(
        r#"{
            "success": true,
            "domains": [{
                "domain": "Messy.EXAMPLE.",
                "dnsRecords": [
                    {"name": "GB", "type": "A", "value": "9.9.9.9", "ttl": 60,
                     "httpProxyEnabled": false, "priority": 0},
                    {"name": "fr", "type": "A", "value": "not-an-ip", "ttl": 60,
                     "httpProxyEnabled": false, "priority": 0},
                    {"name": "www", "type": "A", "value": "7.7.7.7", "ttl": 60,
                     "httpProxyEnabled": true, "priority": 0}
                ],
                "geoDnsMap": {"JP": "8.8.8.8", "bogus": "1.2.3.4"},
                "httpProxy": {"type": ""},
                "ssl": {"enabled": false, "certificate": "", "privateKey": "", "autoRenew": false},
                "luaCode": ""
            }],
            "proxies": []
        }"#,
    );

    let domain = snapshot.get_domain("messy.example").unwrap();

    // Geo keys are lowercase country codes or "default"; values parsed IPv4.
    for key in domain.geo_map.keys() {
        assert!(
            key == "default" || (key.len() == 2 && key.chars().all(|c| c.is_ascii_lowercase())),
            "unexpected geo key {key}"
        );
    }
    assert!(domain.geo_map.contains_key("gb"));
    assert!(domain.geo_map.contains_key("jp"));
    assert!(!domain.geo_map.contains_key("fr"));
    assert!(!domain.geo_map.contains_key("bogus"));

    // No country-code record names survive normalization.
    assert!(domain
        .dns_records
        .iter()
        .all(|r| r.name.len() != 2 || !r.name.bytes().all(|b| b.is_ascii_alphabetic())));

    // A record-level proxy flag forces the domain-level switch.
    assert!(domain.http_proxy.enabled);
    assert!(domain.http_enabled());
}

#[tokio::test]
async fn edge_scripts_see_canonical_header_names() {
    // The script indexes request.headers by the canonical Title-Case name,
    // the way filter scripts are written against the upstream agent.
    let snapshot = snapshot_from_json(
        r#"{
            "success": true,
            "domains": [{
                "domain": "ex.io",
                "dnsRecords": [
                    {"name": "@", "type": "A", "value": "127.0.0.1", "ttl": 300,
                     "httpProxyEnabled": true, "priority": 0}
                ],
                "geoDnsMap": {},
                "httpProxy": {"type": ""},
                "ssl": {"enabled": false, "certificate": "", "privateKey": "", "autoRenew": false},
                "luaCode": "local ua = request.headers[\"User-Agent\"] or \"\"\nif string.find(string.lower(ua), \"bot\") then\n    return ngx.exit(403)\nend"
            }],
            "proxies": []
        }"#,
    );

    let store = Arc::new(ConfigStore::new());
    store.swap(snapshot);
    let app = edge_router(
        EdgeKind::Http,
        store,
        Arc::new(ScriptFilter::new()),
        Arc::new(AgentMetrics::new()),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();

    let blocked = client
        .get(format!("http://{addr}/probe"))
        .header(reqwest::header::HOST, "ex.io")
        .header(reqwest::header::USER_AGENT, "BadBot/1.0")
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), 403);
    assert_eq!(blocked.text().await.unwrap(), "Blocked by WAF");

    // A benign agent passes the filter; the request reaches backend
    // dispatch instead of being blocked.
    let allowed = client
        .get(format!("http://{addr}/probe"))
        .header(reqwest::header::HOST, "ex.io")
        .header(reqwest::header::USER_AGENT, "Mozilla/5.0")
        .send()
        .await
        .unwrap();
    assert_ne!(allowed.status(), 403);
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn proxy_payload(port: u16) -> String {
    format!(
        r#"{{
            "success": true,
            "domains": [],
            "proxies": [{{
                "id": "p1", "name": "churn", "type": "tcp",
                "sourcePort": {port}, "destinationHost": "127.0.0.1",
                "destinationPort": 1, "enabled": true
            }}]
        }}"#
    )
}

#[tokio::test]
async fn forwarder_listener_set_follows_the_proxy_list() {
    let port_a = free_port().await;
    let port_b = free_port().await;

    let store = Arc::new(ConfigStore::new());
    store.swap(snapshot_from_json(&proxy_payload(port_a)));

    let mut manager = ForwarderManager::new(store.clone());
    manager.reconcile_once().await;
    assert_eq!(manager.active_ports(), vec![port_a]);
    assert!(TcpStream::connect(("127.0.0.1", port_a)).await.is_ok());

    // Core stops listing port A and lists port B instead.
    store.swap(snapshot_from_json(&proxy_payload(port_b)));
    manager.reconcile_once().await;
    assert_eq!(manager.active_ports(), vec![port_b]);

    // The old listener is torn down, the new one accepts.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(("127.0.0.1", port_a)).await.is_err());
    assert!(TcpStream::connect(("127.0.0.1", port_b)).await.is_ok());
}
