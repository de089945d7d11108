//! Server (C6): HTTP listener, request dispatcher, reverse-proxy/WebSocket
//! tunnel, internal endpoints, rate limiter, forwarding-header policy, and
//! graceful shutdown.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use crate::config::{AdminAuth, AdminAuthKind, Config};
use crate::group::GroupRouter;
use crate::index::Indices;
use crate::lifecycle::LifecycleManager;
use crate::metrics;
use crate::runtime::{ContainerStatus, RuntimeAdapter};
use crate::templates;

const RATE_LIMIT_MIN_INTERVAL: Duration = Duration::from_secs(1);
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const WEBSOCKET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Per-client-IP rate limiter: at most one admission per
/// [`RATE_LIMIT_MIN_INTERVAL`], entries evicted after 2x that interval.
pub struct RateLimiter {
    last_seen: Mutex<HashMap<IpAddr, Instant>>,
    min_interval: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_MIN_INTERVAL)
    }
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut map = self.last_seen.lock();
        match map.get(&ip) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            _ => {
                map.insert(ip, now);
                true
            }
        }
    }

    pub fn cleanup(&self) {
        let now = Instant::now();
        let stale_after = self.min_interval * 2;
        self.last_seen
            .lock()
            .retain(|_, last| now.saturating_duration_since(*last) < stale_after);
    }
}

/// Resolves the client IP to attribute a request to: the `X-Forwarded-For`
/// left-most entry if the direct peer is a trusted proxy, else the direct
/// peer IP.
pub fn resolve_client_ip(peer_ip: IpAddr, forwarded_for: Option<&str>, trusted: &[IpNet]) -> IpAddr {
    if trusted.is_empty() || !trusted.iter().any(|net| net.contains(&peer_ip)) {
        return peer_ip;
    }
    forwarded_for
        .and_then(|v| v.split(',').next())
        .and_then(|tok| tok.trim().parse().ok())
        .unwrap_or(peer_ip)
}

/// Parses CIDR strings, logging and dropping malformed entries at load time.
pub fn parse_trusted_proxies(raw: &[String]) -> Vec<IpNet> {
    raw.iter()
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!(cidr = %s, error = %e, "ignoring malformed trusted-proxy CIDR");
                None
            }
        })
        .collect()
}

/// Applies the forwarding-header policy in place, given the direct peer IP
/// and the original `Host` header value.
pub fn apply_forwarding_headers(headers: &mut hyper::HeaderMap, peer_ip: IpAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");

    let peer = peer_ip.to_string();

    match headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        Some(existing) => {
            let combined = format!("{existing}, {peer}");
            if let Ok(v) = HeaderValue::from_str(&combined) {
                headers.insert(XFF.clone(), v);
            }
        }
        None => {
            if let Ok(v) = HeaderValue::from_str(&peer) {
                headers.insert(XFF.clone(), v);
            }
        }
    }

    if !headers.contains_key(&XRI) {
        if let Ok(v) = HeaderValue::from_str(&peer) {
            headers.insert(XRI.clone(), v);
        }
    }

    if !headers.contains_key(&XFP) {
        // This engine never terminates TLS (see Non-goals), so absent an
        // upstream-set value the connection is always plain http.
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if let Ok(v) = HeaderValue::from_str(original_host) {
        headers.insert(XFH.clone(), v);
    }
}

/// `true` only when both the `Upgrade: websocket` (case-insensitive) and a
/// `Connection` header containing `upgrade` are present.
pub fn is_websocket_upgrade(headers: &hyper::HeaderMap) -> bool {
    let is_upgrade = headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_connection_upgrade = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    is_upgrade && has_connection_upgrade
}

/// Strips an optional `:port` suffix from a `Host` header value.
pub fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Allow,
    Unauthorized,
}

/// Admin-auth middleware: constant-time credential/token comparison so wall
/// clock timing cannot leak how many leading bytes matched.
pub fn check_admin_auth(auth: &AdminAuth, header: Option<&str>) -> AuthOutcome {
    match auth.method {
        AdminAuthKind::None => AuthOutcome::Allow,
        AdminAuthKind::Basic => {
            let Some(header) = header else {
                return AuthOutcome::Unauthorized;
            };
            let Some(encoded) = header.strip_prefix("Basic ") else {
                return AuthOutcome::Unauthorized;
            };
            let Ok(decoded) = base64::decode(encoded) else {
                return AuthOutcome::Unauthorized;
            };
            let Ok(decoded) = String::from_utf8(decoded) else {
                return AuthOutcome::Unauthorized;
            };
            let Some((user, pass)) = decoded.split_once(':') else {
                return AuthOutcome::Unauthorized;
            };
            let user_ok: bool = user.as_bytes().ct_eq(auth.username.as_bytes()).into();
            let pass_ok: bool = pass.as_bytes().ct_eq(auth.password.as_bytes()).into();
            if user_ok && pass_ok {
                AuthOutcome::Allow
            } else {
                AuthOutcome::Unauthorized
            }
        }
        AdminAuthKind::Bearer => {
            let Some(header) = header else {
                return AuthOutcome::Unauthorized;
            };
            let Some(token) = header.strip_prefix("Bearer ") else {
                return AuthOutcome::Unauthorized;
            };
            let ok: bool = token.as_bytes().ct_eq(auth.token.as_bytes()).into();
            if ok {
                AuthOutcome::Allow
            } else {
                AuthOutcome::Unauthorized
            }
        }
    }
}

/// Checks that an `Origin` header (if present) names the same host as the
/// request's `Host` header. Absent `Origin` is allowed (non-browser
/// clients, e.g. curl, never send one).
pub fn same_origin(origin: Option<&str>, host: &str) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let origin_host = origin
        .split("://")
        .nth(1)
        .unwrap_or(origin);
    strip_port(origin_host) == strip_port(host)
}

/// Which route a resolved host maps to.
enum Route {
    Workload(Arc<crate::config::Workload>),
    Group(Arc<crate::config::Group>),
}

/// Resolves a `Host` header (and the `?container=` testing fallback) against
/// the current indices: exact match first, then port-stripped, then the
/// query-parameter fallback.
fn resolve_route(indices: &Indices, host: &str, container_param: Option<&str>) -> Option<Route> {
    if let Some(g) = indices.host_to_group.get(host) {
        return Some(Route::Group(Arc::clone(g)));
    }
    if let Some(w) = indices.host_to_workload.get(host) {
        return Some(Route::Workload(Arc::clone(w)));
    }
    let stripped = strip_port(host);
    if stripped != host {
        if let Some(g) = indices.host_to_group.get(stripped) {
            return Some(Route::Group(Arc::clone(g)));
        }
        if let Some(w) = indices.host_to_workload.get(stripped) {
            return Some(Route::Workload(Arc::clone(w)));
        }
    }
    if let Some(name) = container_param {
        if let Some(w) = indices.name_to_workload.get(name) {
            return Some(Route::Workload(Arc::clone(w)));
        }
    }
    None
}

pub struct Server {
    pub indices: Arc<ArcSwap<Indices>>,
    pub lifecycle: Arc<LifecycleManager>,
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub group_router: GroupRouter,
    pub rate_limiter: RateLimiter,
    pub trusted_proxies: Vec<IpNet>,
    /// Bound at startup; a reload never changes these (hot-reload boundary).
    pub admin_auth: AdminAuth,
    pub log_lines: usize,
}

impl Server {
    pub fn new(config: Config, lifecycle: Arc<LifecycleManager>, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        let trusted_proxies = parse_trusted_proxies(&config.gateway.trusted_proxies);
        let admin_auth = config.gateway.admin_auth.clone();
        let log_lines = config.gateway.log_lines;
        let indices = Arc::new(ArcSwap::new(Arc::new(Indices::build(config))));
        Self {
            indices,
            lifecycle,
            runtime,
            group_router: GroupRouter::new(),
            rate_limiter: RateLimiter::default(),
            trusted_proxies,
            admin_auth,
            log_lines,
        }
    }

    /// Swaps in indices derived from `config`. Atomic: readers never observe
    /// a half-rebuilt mixture of old and new.
    pub fn reload_indices(&self, config: Config) {
        self.indices.store(Arc::new(Indices::build(config)));
    }

    fn client_ip(&self, peer: SocketAddr, headers: &hyper::HeaderMap) -> IpAddr {
        let xff = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        resolve_client_ip(peer.ip(), xff, &self.trusted_proxies)
    }

    pub async fn handle(
        self: Arc<Self>,
        req: Request<Body>,
        peer: SocketAddr,
    ) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().trim_start_matches('/').to_string();
        let client_ip = self.client_ip(peer, req.headers());

        let response = match path.as_str() {
            "_health" => self.handle_health(&req, client_ip).await,
            "_logs" => self.handle_logs(&req, client_ip).await,
            "_status" => self.handle_status_page(&req).await,
            "_status/api" => self.handle_status_api(&req, client_ip).await,
            "_status/wake" => self.handle_wake(&req, client_ip).await,
            "_metrics" => self.handle_metrics(&req).await,
            _ => self.handle_proxy(req, peer, client_ip).await,
        };
        Ok(response.unwrap_or_else(|e| e))
    }

    fn query_param(&self, req: &Request<Body>, key: &str) -> Option<String> {
        req.uri().query().and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        })
    }

    fn host_header(req: &Request<Body>) -> Option<&str> {
        req.headers().get(hyper::header::HOST).and_then(|v| v.to_str().ok())
    }

    // ---- internal endpoints ----

    async fn handle_health(&self, req: &Request<Body>, client_ip: IpAddr) -> Result<Response<Body>, Response<Body>> {
        if !self.rate_limiter.allow(client_ip) {
            return Err(rate_limited_response());
        }
        let Some(name) = self.query_param(req, "container") else {
            return Err(json_response(StatusCode::NOT_FOUND, &ErrorBody { error: "missing container".into() }));
        };
        let state = self.lifecycle.get_start_state(&name);
        let (status, error) = if state.status == crate::lifecycle::StartStatus::Unknown {
            match self.runtime.status(&name).await {
                Ok(ContainerStatus::Running) => ("running".to_string(), None),
                _ => ("unknown".to_string(), None),
            }
        } else {
            (state.status.as_str().to_string(), state.error)
        };
        Ok(json_response(StatusCode::OK, &HealthBody { status, error }))
    }

    async fn handle_logs(&self, req: &Request<Body>, client_ip: IpAddr) -> Result<Response<Body>, Response<Body>> {
        if !self.rate_limiter.allow(client_ip) {
            return Err(rate_limited_response());
        }
        let Some(name) = self.query_param(req, "container") else {
            return Err(json_response(StatusCode::NOT_FOUND, &ErrorBody { error: "missing container".into() }));
        };
        let lines = self
            .runtime
            .tail_logs(&name, self.log_lines)
            .await
            .unwrap_or_default();
        Ok(json_response(StatusCode::OK, &LogsBody { lines }))
    }

    async fn handle_status_page(&self, req: &Request<Body>) -> Result<Response<Body>, Response<Body>> {
        self.require_admin(req)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(templates::dashboard_page()))
            .unwrap())
    }

    async fn handle_status_api(&self, req: &Request<Body>, client_ip: IpAddr) -> Result<Response<Body>, Response<Body>> {
        self.require_admin(req)?;
        if !self.rate_limiter.allow(client_ip) {
            return Err(rate_limited_response());
        }
        let indices = self.indices.load();
        let mut containers = Vec::new();
        for w in &indices.config.workloads {
            let inspect = self.runtime.inspect(&w.name).await.ok();
            let start_state = self.lifecycle.get_start_state(&w.name);
            let last_request = self.lifecycle.last_seen(&w.name);
            containers.push(ContainerSummary {
                name: w.name.clone(),
                host: w.host.clone(),
                status: inspect.as_ref().map(|i| i.status.as_raw().to_string()).unwrap_or_else(|| "unknown".into()),
                start_state: start_state.status.as_str().to_string(),
                image: inspect.as_ref().map(|i| i.image.clone()).unwrap_or_default(),
                icon: w.icon.clone(),
                target_port: w.target_port.clone(),
                start_timeout: humantime::format_duration(w.start_timeout).to_string(),
                idle_timeout: humantime::format_duration(w.idle_timeout).to_string(),
                started_at: inspect.as_ref().and_then(|i| i.started_at.clone()),
                last_request: last_request.map(|_| chrono::Utc::now().to_rfc3339()),
                network: w.network.clone(),
            });
        }
        Ok(json_response(
            StatusCode::OK,
            &StatusApiBody {
                containers,
                updated_at: chrono::Utc::now().to_rfc3339(),
            },
        ))
    }

    async fn handle_wake(&self, req: &Request<Body>, client_ip: IpAddr) -> Result<Response<Body>, Response<Body>> {
        self.require_admin(req)?;
        if !self.rate_limiter.allow(client_ip) {
            return Err(rate_limited_response());
        }
        let host = Self::host_header(req).unwrap_or_default().to_string();
        let origin = req
            .headers()
            .get(hyper::header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        if !same_origin(origin, &host) {
            return Err(json_response(StatusCode::FORBIDDEN, &ErrorBody { error: "cross-origin request rejected".into() }));
        }
        let Some(name) = self.query_param(req, "container") else {
            return Err(json_response(StatusCode::NOT_FOUND, &ErrorBody { error: "missing container".into() }));
        };
        let indices = self.indices.load_full();
        let runtime = Arc::clone(&self.runtime);
        if let Some(lifecycle) = self.lifecycle_handle() {
            tokio::spawn(async move {
                let _ = lifecycle.ensure_deps_running(runtime.as_ref(), &indices, &name).await;
            });
        }
        Ok(json_response(StatusCode::OK, &WakeBody { ok: true }))
    }

    /// The lifecycle manager is always constructed as an `Arc` by `main`;
    /// exposed through a method so `handle_wake` can clone it into a
    /// detached task without borrowing `self` across `.await`.
    fn lifecycle_handle(&self) -> Option<Arc<LifecycleManager>> {
        Some(Arc::clone(&self.lifecycle))
    }

    async fn handle_metrics(&self, req: &Request<Body>) -> Result<Response<Body>, Response<Body>> {
        self.require_admin(req)?;
        match metrics::encode() {
            Ok(buf) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Body::from(buf))
                .unwrap()),
            Err(e) => Ok(json_response(StatusCode::INTERNAL_SERVER_ERROR, &ErrorBody { error: e.to_string() })),
        }
    }

    fn require_admin(&self, req: &Request<Body>) -> Result<(), Response<Body>> {
        let header = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        match check_admin_auth(&self.admin_auth, header) {
            AuthOutcome::Allow => Ok(()),
            AuthOutcome::Unauthorized => {
                let mut resp = json_response(StatusCode::UNAUTHORIZED, &ErrorBody { error: "unauthorized".into() });
                if self.admin_auth.method == AdminAuthKind::Basic {
                    resp.headers_mut().insert(
                        hyper::header::WWW_AUTHENTICATE,
                        HeaderValue::from_static("Basic realm=\"wakegate\""),
                    );
                }
                Err(resp)
            }
        }
    }

    // ---- proxy / holding path ----

    async fn handle_proxy(
        &self,
        req: Request<Body>,
        peer: SocketAddr,
        client_ip: IpAddr,
    ) -> Result<Response<Body>, Response<Body>> {
        let host = Self::host_header(&req).unwrap_or_default().to_string();
        let container_param = self.query_param(&req, "container");
        let indices = self.indices.load_full();

        let route = resolve_route(&indices, &host, container_param.as_deref());
        let Some(route) = route else {
            return Err(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from(templates::error_page("", "no workload matches this host")))
                .unwrap());
        };

        let workload = match route {
            Route::Workload(w) => w,
            Route::Group(g) => {
                let Some(member) = self.group_router.pick(&g.name, &g.members) else {
                    return Err(Response::builder()
                        .status(StatusCode::SERVICE_UNAVAILABLE)
                        .body(Body::from(templates::error_page(&g.name, "group has no members")))
                        .unwrap());
                };
                match indices.name_to_workload.get(member) {
                    Some(w) => Arc::clone(w),
                    None => {
                        return Err(Response::builder()
                            .status(StatusCode::SERVICE_UNAVAILABLE)
                            .body(Body::from(templates::error_page(&g.name, "group member not found")))
                            .unwrap())
                    }
                }
            }
        };

        match self.runtime.status(&workload.name).await {
            Ok(ContainerStatus::Running) => {
                let deps_running = workload
                    .depends_on
                    .iter()
                    .all(|d| self.lifecycle.get_start_state(d).status == crate::lifecycle::StartStatus::Running);
                if deps_running {
                    self.lifecycle.record_activity(&workload.name);
                    return self.proxy_to(req, peer, client_ip, &workload).await;
                }
                self.start_holding(&workload, &indices);
                Ok(holding_response(&workload))
            }
            Ok(_not_running) => {
                self.start_holding(&workload, &indices);
                Ok(holding_response(&workload))
            }
            Err(e) => {
                let status = if matches!(e, crate::error::RuntimeError::NotFound(_)) {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::BAD_GATEWAY
                };
                Err(Response::builder()
                    .status(status)
                    .body(Body::from(templates::error_page(&workload.name, &e.to_string())))
                    .unwrap())
            }
        }
    }

    fn start_holding(&self, workload: &Arc<crate::config::Workload>, indices: &Arc<Indices>) {
        self.lifecycle.get_start_state(&workload.name);
        let lifecycle = Arc::clone(&self.lifecycle);
        let runtime = Arc::clone(&self.runtime);
        let indices = Arc::clone(indices);
        let name = workload.name.clone();
        tokio::spawn(async move {
            let deadline = workload_deadline(&indices, &name);
            let fut = lifecycle.ensure_deps_running(runtime.as_ref(), &indices, &name);
            if tokio::time::timeout(deadline, fut).await.is_err() {
                tracing::warn!(workload = %name, "orchestration deadline exceeded");
            }
        });
    }

    async fn proxy_to(
        &self,
        req: Request<Body>,
        peer: SocketAddr,
        client_ip: IpAddr,
        workload: &crate::config::Workload,
    ) -> Result<Response<Body>, Response<Body>> {
        let _ = client_ip;
        let network = workload.network.as_deref().unwrap_or("");
        let ip = self
            .runtime
            .ip(&workload.name, network)
            .await
            .map_err(|e| bad_gateway(&workload.name, &e.to_string()))?;
        let port: u16 = workload.target_port.parse().unwrap_or(80);

        if is_websocket_upgrade(req.headers()) {
            return self.tunnel_websocket(req, ip, port).await;
        }

        let start = Instant::now();
        let original_host = Self::host_header(&req).unwrap_or_default().to_string();
        let (mut parts, body) = req.into_parts();
        apply_forwarding_headers(&mut parts.headers, peer.ip(), &original_host);

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: hyper::Uri = format!("http://{ip}:{port}{path_and_query}")
            .parse()
            .map_err(|_| bad_gateway(&workload.name, "invalid upstream uri"))?;
        parts.uri = uri;

        let upstream_req = Request::from_parts(parts, body);
        let client = hyper::Client::new();
        match client.request(upstream_req).await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                metrics::record_proxy_request(&workload.name, status, start.elapsed());
                Ok(resp)
            }
            Err(e) => {
                metrics::record_proxy_request(&workload.name, 502, start.elapsed());
                Err(bad_gateway(&workload.name, &e.to_string()))
            }
        }
    }

    async fn tunnel_websocket(
        &self,
        req: Request<Body>,
        ip: IpAddr,
        port: u16,
    ) -> Result<Response<Body>, Response<Body>> {
        let raw_request_line = format!(
            "{} {} {:?}\r\n",
            req.method(),
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
            req.version()
        );
        let mut raw_headers = String::new();
        for (name, value) in req.headers() {
            if let Ok(v) = value.to_str() {
                raw_headers.push_str(name.as_str());
                raw_headers.push_str(": ");
                raw_headers.push_str(v);
                raw_headers.push_str("\r\n");
            }
        }
        let handshake_bytes = format!("{raw_request_line}{raw_headers}\r\n").into_bytes();

        let backend = tokio::time::timeout(WEBSOCKET_DIAL_TIMEOUT, tokio::net::TcpStream::connect((ip, port)))
            .await
            .map_err(|_| bad_gateway("websocket", "dial timeout"))?
            .map_err(|e| bad_gateway("websocket", &e.to_string()))?;

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut backend = backend;
            if backend.write_all(&handshake_bytes).await.is_err() {
                return;
            }
            match hyper::upgrade::on(req).await {
                Ok(mut upgraded) => {
                    if let Err(e) = tokio::io::copy_bidirectional(&mut upgraded, &mut backend).await {
                        tracing::debug!(error = %e, "websocket tunnel closed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to hijack client connection for websocket"),
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(hyper::header::UPGRADE, "websocket")
            .header(hyper::header::CONNECTION, "upgrade")
            .body(Body::empty())
            .map_err(|_| bad_gateway("websocket", "failed to build upgrade response"))
    }

    /// Runs the HTTP listener until `cancel` fires, waiting up to 15s for
    /// in-flight requests to finish before returning.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
            let server = Arc::clone(&self);
            let peer = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle(req, peer).await }
                }))
            }
        });

        let shutdown_signal = cancel.clone();
        let graceful = hyper::Server::bind(&addr)
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                shutdown_signal.cancelled().await;
            });

        tokio::select! {
            result = graceful => result.map_err(anyhow::Error::from),
            _ = async { cancel.cancelled().await; tokio::time::sleep(SHUTDOWN_GRACE).await } => {
                tracing::warn!("graceful shutdown grace period elapsed, forcing exit");
                Ok(())
            }
        }
    }
}

fn workload_deadline(indices: &Indices, name: &str) -> Duration {
    indices
        .name_to_workload
        .get(name)
        .map(|w| w.start_timeout + Duration::from_secs(10))
        .unwrap_or(Duration::from_secs(70))
}

fn holding_response(workload: &crate::config::Workload) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(templates::holding_page(&workload.name, &workload.redirect_path)))
        .unwrap()
}

fn bad_gateway(workload: &str, message: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from(templates::error_page(workload, message)))
        .unwrap()
}

fn rate_limited_response() -> Response<Body> {
    json_response(StatusCode::TOO_MANY_REQUESTS, &ErrorBody { error: "rate limited".into() })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap()
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct HealthBody {
    status: String,
    error: Option<String>,
}

#[derive(Serialize)]
struct LogsBody {
    lines: Vec<String>,
}

#[derive(Serialize)]
struct WakeBody {
    ok: bool,
}

#[derive(Serialize)]
struct ContainerSummary {
    name: String,
    host: Option<String>,
    status: String,
    start_state: String,
    image: String,
    icon: String,
    target_port: String,
    start_timeout: String,
    idle_timeout: String,
    started_at: Option<String>,
    last_request: Option<String>,
    network: Option<String>,
}

#[derive(Serialize)]
struct StatusApiBody {
    containers: Vec<ContainerSummary>,
    updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rate_limiter_allows_at_most_one_per_interval() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn rate_limiter_cleanup_evicts_stale_entries() {
        let limiter = RateLimiter::new(Duration::from_millis(5));
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.allow(ip));
        std::thread::sleep(Duration::from_millis(20));
        limiter.cleanup();
        assert_eq!(limiter.last_seen.lock().len(), 0);
    }

    #[test]
    fn trusted_peer_uses_forwarded_for_left_most_entry() {
        let trusted = parse_trusted_proxies(&["10.0.0.0/8".to_string()]);
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let resolved = resolve_client_ip(peer, Some("1.2.3.4, 5.6.7.8"), &trusted);
        assert_eq!(resolved, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_for() {
        let trusted = parse_trusted_proxies(&["10.0.0.0/8".to_string()]);
        let peer = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let resolved = resolve_client_ip(peer, Some("1.2.3.4"), &trusted);
        assert_eq!(resolved, peer);
    }

    #[test]
    fn malformed_cidr_is_dropped() {
        let trusted = parse_trusted_proxies(&["not-a-cidr".to_string()]);
        assert!(trusted.is_empty());
    }

    #[test]
    fn websocket_requires_both_headers() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(hyper::header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(is_websocket_upgrade(&headers));
    }

    #[test]
    fn host_with_port_strips_to_match() {
        assert_eq!(strip_port("app.localhost:8080"), "app.localhost");
        assert_eq!(strip_port("app.localhost"), "app.localhost");
    }

    #[test]
    fn admin_auth_none_always_allows() {
        let auth = AdminAuth::default();
        assert_eq!(check_admin_auth(&auth, None), AuthOutcome::Allow);
    }

    #[test]
    fn admin_auth_basic_rejects_wrong_credentials() {
        let auth = AdminAuth {
            method: AdminAuthKind::Basic,
            username: "admin".to_string(),
            password: "secret".to_string(),
            token: String::new(),
        };
        let wrong = format!("Basic {}", base64::encode(b"admin:wrong"));
        assert_eq!(check_admin_auth(&auth, Some(&wrong)), AuthOutcome::Unauthorized);
        let right = format!("Basic {}", base64::encode(b"admin:secret"));
        assert_eq!(check_admin_auth(&auth, Some(&right)), AuthOutcome::Allow);
    }

    #[test]
    fn admin_auth_bearer_rejects_wrong_token() {
        let auth = AdminAuth {
            method: AdminAuthKind::Bearer,
            username: String::new(),
            password: String::new(),
            token: "s3cr3t".to_string(),
        };
        assert_eq!(check_admin_auth(&auth, Some("Bearer wrong")), AuthOutcome::Unauthorized);
        assert_eq!(check_admin_auth(&auth, Some("Bearer s3cr3t")), AuthOutcome::Allow);
    }

    #[test]
    fn same_origin_allows_absent_origin() {
        assert!(same_origin(None, "app.localhost"));
    }

    #[test]
    fn same_origin_rejects_cross_host() {
        assert!(!same_origin(Some("https://evil.example"), "app.localhost"));
    }

    #[test]
    fn same_origin_allows_matching_host_even_with_scheme_and_port() {
        assert!(same_origin(Some("http://app.localhost:1234"), "app.localhost:5678"));
    }

    #[test]
    fn query_fallback_resolves_by_name() {
        use crate::config::{GatewaySettings, Workload};
        use std::time::Duration as StdDuration;
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![Workload {
                name: "app".to_string(),
                host: None,
                target_port: "80".to_string(),
                start_timeout: StdDuration::from_secs(60),
                idle_timeout: StdDuration::ZERO,
                network: None,
                redirect_path: "/".to_string(),
                icon: "box".to_string(),
                health_path: None,
                depends_on: vec![],
            }],
            groups: vec![],
        };
        let indices = Indices::build(config);
        let route = resolve_route(&indices, "unrelated.localhost", Some("app"));
        assert!(matches!(route, Some(Route::Workload(_))));
    }
}
