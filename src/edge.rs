//! HTTP and HTTPS reverse-proxy edges
//!
//! Both edges share one request pipeline: domain lookup by Host, proxy
//! enablement and protocol-restriction checks, the per-domain script filter,
//! backend selection from the domain's DNS records, and plaintext-HTTP
//! upstream dispatch. The HTTPS edge additionally terminates TLS with a
//! per-SNI certificate resolved from the snapshot on every ClientHello.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Host, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use dashmap::DashMap;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, DomainRecord, EdgeScheme, RecordData};
use crate::metrics::{inc, AgentMetrics};
use crate::waf::{FilterRequest, ScriptFilter};

/// Total timeout for one upstream round-trip.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Which edge a listener serves; decides the protocol restriction and the
/// advertised `X-Forwarded-Proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Http,
    Https,
}

impl EdgeKind {
    fn scheme(self) -> &'static str {
        match self {
            EdgeKind::Http => "http",
            EdgeKind::Https => "https",
        }
    }

    /// The restriction that shuts this edge out for a domain.
    fn rejected_kind(self) -> EdgeScheme {
        match self {
            EdgeKind::Http => EdgeScheme::Https,
            EdgeKind::Https => EdgeScheme::Http,
        }
    }
}

/// Shared state for one edge listener.
#[derive(Clone)]
pub struct EdgeState {
    kind: EdgeKind,
    store: Arc<ConfigStore>,
    filter: Arc<ScriptFilter>,
    metrics: Arc<AgentMetrics>,
    client: Client<HttpConnector, Body>,
}

impl EdgeState {
    fn new(
        kind: EdgeKind,
        store: Arc<ConfigStore>,
        filter: Arc<ScriptFilter>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build_http();
        Self {
            kind,
            store,
            filter,
            metrics,
            client,
        }
    }
}

/// The request pipeline for one edge as an axum router.
pub fn edge_router(
    kind: EdgeKind,
    store: Arc<ConfigStore>,
    filter: Arc<ScriptFilter>,
    metrics: Arc<AgentMetrics>,
) -> Router {
    let state = EdgeState::new(kind, store, filter, metrics);
    Router::new().fallback(any(proxy_handler)).with_state(state)
}

/// Run the plaintext edge.
pub async fn run_http_edge(
    addr: SocketAddr,
    store: Arc<ConfigStore>,
    filter: Arc<ScriptFilter>,
    metrics: Arc<AgentMetrics>,
) -> anyhow::Result<()> {
    let app = edge_router(EdgeKind::Http, store, filter, metrics);
    info!(%addr, "HTTP edge listening");
    axum_server::bind(addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

/// Run the TLS-terminating edge with snapshot-backed SNI certificates.
pub async fn run_https_edge(
    addr: SocketAddr,
    store: Arc<ConfigStore>,
    filter: Arc<ScriptFilter>,
    metrics: Arc<AgentMetrics>,
) -> anyhow::Result<()> {
    let resolver = Arc::new(SniCertResolver::new(store.clone()));

    let mut tls = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_cert_resolver(resolver);
    tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let app = edge_router(EdgeKind::Https, store, filter, metrics);
    info!(%addr, "HTTPS edge listening");
    axum_server::bind_rustls(addr, RustlsConfig::from_config(Arc::new(tls)))
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

/// Resolves the certificate for each ClientHello from the current snapshot.
///
/// The handshake is aborted (no certificate) when the domain is unknown, SSL
/// is disabled, or the PEM material is missing. Parsed keys are cached per
/// domain and invalidated by certificate fingerprint, so a rotation from
/// Core takes effect on the next handshake.
pub struct SniCertResolver {
    store: Arc<ConfigStore>,
    cache: DashMap<String, (String, Arc<CertifiedKey>)>,
}

impl SniCertResolver {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    fn certified_key_for(&self, domain: &DomainRecord) -> Option<Arc<CertifiedKey>> {
        let mut hasher = Sha256::new();
        hasher.update(domain.ssl.certificate_pem.as_bytes());
        hasher.update(domain.ssl.private_key_pem.as_bytes());
        let fingerprint = format!("{:x}", hasher.finalize());

        if let Some(entry) = self.cache.get(&domain.domain) {
            let (cached_fingerprint, key) = entry.value();
            if *cached_fingerprint == fingerprint {
                return Some(key.clone());
            }
        }

        let key = match build_certified_key(&domain.ssl.certificate_pem, &domain.ssl.private_key_pem)
        {
            Ok(key) => Arc::new(key),
            Err(e) => {
                warn!(domain = %domain.domain, error = %e, "failed to load certificate");
                return None;
            }
        };
        self.cache
            .insert(domain.domain.clone(), (fingerprint, key.clone()));
        Some(key)
    }
}

impl fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let snapshot = self.store.snapshot();
        let domain = snapshot.get_domain(name)?;

        if !domain.ssl.enabled {
            debug!(domain = %domain.domain, "SSL not enabled, aborting handshake");
            return None;
        }
        if domain.ssl.certificate_pem.is_empty() || domain.ssl.private_key_pem.is_empty() {
            debug!(domain = %domain.domain, "certificate or key missing, aborting handshake");
            return None;
        }

        self.certified_key_for(domain)
    }
}

fn build_certified_key(cert_pem: &str, key_pem: &str) -> anyhow::Result<CertifiedKey> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("invalid certificate PEM: {e}"))?;
    if certs.is_empty() {
        anyhow::bail!("certificate PEM contains no certificates");
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid private key PEM: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("private key PEM contains no key"))?;
    let signing_key =
        any_supported_type(&key).map_err(|e| anyhow::anyhow!("unsupported key type: {e}"))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Host header value without its port suffix.
fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Canonical Title-Case form of a header name ("user-agent" -> "User-Agent").
///
/// `http::HeaderName` lowercases names on parse, but scripts index
/// `request.headers` by exact string and expect the canonical form
/// (`request.headers["User-Agent"]`).
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Client IP honoring forwarding headers: first `X-Forwarded-For` entry,
/// then `X-Real-IP`, then the peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xri.is_empty() {
            return xri.to_string();
        }
    }
    peer.ip().to_string()
}

/// First record with the proxy flag wins; then any address record.
fn select_backend(domain: &DomainRecord) -> Option<String> {
    let address = |data: &RecordData| match data {
        RecordData::A(ip) => Some(ip.to_string()),
        RecordData::Aaaa(ip) => Some(ip.to_string()),
        _ => None,
    };

    domain
        .dns_records
        .iter()
        .filter(|r| r.http_proxy_enabled)
        .find_map(|r| address(&r.data))
        .or_else(|| domain.dns_records.iter().find_map(|r| address(&r.data)))
}

fn apply_filter_headers(target: &mut HeaderMap, filter_headers: &[(String, String)]) {
    for (name, value) in filter_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            target.insert(name, value);
        }
    }
}

async fn proxy_handler(
    State(state): State<EdgeState>,
    Host(host): Host,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    inc(&state.metrics.http.total_requests);

    let request_uri = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let hostname = strip_port(&host).to_string();

    debug!(
        edge = state.kind.scheme(),
        %method,
        host = %hostname,
        uri = %request_uri,
        %peer,
        "incoming request"
    );

    let snapshot = state.store.snapshot();
    let domain = match snapshot.get_domain(&hostname) {
        Some(d) => d,
        None => {
            debug!(host = %hostname, "domain not found");
            return (StatusCode::NOT_FOUND, "Domain not found").into_response();
        }
    };

    if !domain.http_enabled() {
        debug!(domain = %domain.domain, "HTTP proxy not enabled");
        return (StatusCode::FORBIDDEN, "HTTP proxy not enabled").into_response();
    }

    if domain.http_proxy.kind == Some(state.kind.rejected_kind()) {
        debug!(
            domain = %domain.domain,
            edge = state.kind.scheme(),
            "protocol restricted"
        );
        let message = match state.kind {
            EdgeKind::Http => "HTTPS only",
            EdgeKind::Https => "HTTP only",
        };
        return (StatusCode::FORBIDDEN, message).into_response();
    }

    // Script filter runs strictly before backend dispatch. Its headers are
    // applied to the response whether or not the request is blocked.
    let mut filter_headers = Vec::new();
    if !domain.script.is_empty() {
        let filter_request = FilterRequest {
            method: method.to_string(),
            uri: request_uri.clone(),
            host: host.clone(),
            remote_addr: peer.ip().to_string(),
            headers: headers
                .keys()
                .filter_map(|name| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| (canonical_header_name(name.as_str()), v.to_string()))
                })
                .collect(),
        };

        let (blocked, verdict) = state.filter.execute(&domain.script, &filter_request);
        if blocked {
            inc(&state.metrics.http.blocked_requests);
            debug!(domain = %domain.domain, status = verdict.status_code, "blocked by filter");

            let status = StatusCode::from_u16(verdict.status_code)
                .unwrap_or(StatusCode::FORBIDDEN);
            let mut response = (status, verdict.body).into_response();
            apply_filter_headers(response.headers_mut(), &verdict.headers);
            return response;
        }
        filter_headers = verdict.headers;
    }

    let backend = match select_backend(domain) {
        Some(backend) => backend,
        None => {
            warn!(domain = %domain.domain, "no backend available");
            inc(&state.metrics.http.proxy_errors);
            return (StatusCode::BAD_GATEWAY, "No backend available").into_response();
        }
    };

    // Upstream is always plaintext HTTP, even from the HTTPS edge.
    let upstream_url = format!("http://{}:80{}", backend, request_uri);
    let derived_ip = client_ip(&headers, peer);

    let mut upstream = Request::builder().method(method).uri(&upstream_url);
    if let Some(h) = upstream.headers_mut() {
        for (name, value) in headers.iter() {
            h.append(name.clone(), value.clone());
        }
        if let Ok(v) = HeaderValue::from_str(&derived_ip) {
            h.insert("x-forwarded-for", v.clone());
            h.insert("x-real-ip", v);
        }
        h.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(state.kind.scheme()),
        );
    }

    let upstream_request = match upstream.body(body) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "failed to build upstream request");
            inc(&state.metrics.http.proxy_errors);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Proxy error").into_response();
        }
    };

    match tokio::time::timeout(UPSTREAM_TIMEOUT, state.client.request(upstream_request)).await {
        Ok(Ok(upstream_response)) => {
            let (mut parts, incoming) = upstream_response.into_parts();
            // Redirects are surfaced verbatim, never followed.
            apply_filter_headers(&mut parts.headers, &filter_headers);
            debug!(status = %parts.status, %backend, "proxied");
            Response::from_parts(parts, Body::new(incoming))
        }
        Ok(Err(e)) => {
            warn!(error = %e, %backend, "upstream request failed");
            inc(&state.metrics.http.proxy_errors);
            (StatusCode::BAD_GATEWAY, "Backend error").into_response()
        }
        Err(_) => {
            warn!(%backend, "upstream request timed out");
            inc(&state.metrics.http.proxy_errors);
            (StatusCode::BAD_GATEWAY, "Backend timeout").into_response()
        }
    }
}
