//! Host-based request dispatch
//! Looks the request's host up in the route store and streams the request to the
//! matching backend, or answers 404.

use crate::routes::{Route, RouteStore, BACKEND_HOST};
use crate::shutdown::ShutdownSignal;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST, LOCATION, UPGRADE};
use hyper::http::uri::{Authority, PathAndQuery};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const DEFAULT_UPGRADE_GRACE: Duration = Duration::from_secs(5);

/// Routing decision for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Routed(Route),
    Unrouted(String),
    MissingHost,
}

/// Routes requests by host
#[derive(Debug, Clone)]
pub struct Dispatcher {
    routes: Arc<RouteStore>,
    /// Spliced upgrade connections, kept so shutdown can bound them.
    upgrades: Arc<Mutex<JoinSet<()>>>,
    upgrade_grace: Duration,
}

impl Dispatcher {
    pub fn new(routes: Arc<RouteStore>) -> Self {
        Self {
            routes,
            upgrades: Arc::new(Mutex::new(JoinSet::new())),
            upgrade_grace: DEFAULT_UPGRADE_GRACE,
        }
    }

    /// How long an upgraded connection may keep running after shutdown.
    pub fn with_upgrade_grace(mut self, grace: Duration) -> Self {
        self.upgrade_grace = grace;
        self
    }

    pub fn routes(&self) -> &Arc<RouteStore> {
        &self.routes
    }

    /// Number of upgraded connections still being spliced
    pub fn active_upgrades(&self) -> usize {
        let mut upgrades = self.upgrades.lock();
        while upgrades.try_join_next().is_some() {}
        upgrades.len()
    }

    /// Wait up to `grace` for upgraded connections to end, then abort the rest.
    pub async fn close_upgrades(&self, grace: Duration) {
        let mut upgrades = std::mem::take(&mut *self.upgrades.lock());
        if upgrades.is_empty() {
            return;
        }
        info!("Waiting for {} upgraded connection(s)", upgrades.len());

        let drain = async { while upgrades.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                "Shutdown grace period elapsed, closing {} upgraded connection(s)",
                upgrades.len()
            );
            upgrades.shutdown().await;
        }
    }

    fn track_upgrade<F>(&self, splice: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut upgrades = self.upgrades.lock();
        while upgrades.try_join_next().is_some() {}
        upgrades.spawn(splice);
    }

    /// Decide where a request goes. Only the host is consulted.
    pub fn resolve<T>(&self, req: &Request<T>) -> Resolution {
        match request_host(req) {
            Some(host) => match self.routes.get(&host) {
                Some(route) => Resolution::Routed(route),
                None => Resolution::Unrouted(host),
            },
            None => Resolution::MissingHost,
        }
    }

    /// Forward a request to its backend, or reject it.
    ///
    /// An upgraded connection keeps running after the response; `shutdown` ends it once
    /// the upgrade grace period has passed.
    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_https: bool,
        shutdown: &ShutdownSignal,
    ) -> Response<ProxyBody> {
        let route = match self.resolve(&req) {
            Resolution::Routed(route) => route,
            Resolution::Unrouted(host) => {
                debug!("No route for host {}", host);
                return error_response(StatusCode::NOT_FOUND, "Not found");
            }
            Resolution::MissingHost => {
                return error_response(StatusCode::BAD_REQUEST, "Missing Host header");
            }
        };

        debug!("hit: {} -> {}", route.domain, route.target);

        match self.forward(req, &route, remote_addr, is_https, shutdown).await {
            Ok(response) => response,
            Err(e) => {
                error!("Proxy error for {}: {:#}", route.domain, e);
                error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    /// Stream the request to the route's backend and the response back.
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        route: &Route,
        remote_addr: SocketAddr,
        is_https: bool,
        shutdown: &ShutdownSignal,
    ) -> Result<Response<ProxyBody>> {
        let backend_host = route.target.host_str().unwrap_or(BACKEND_HOST);
        let backend_port = route.target.port_or_known_default().unwrap_or(80);

        let stream = TcpStream::connect((backend_host, backend_port))
            .await
            .with_context(|| {
                format!("failed to connect to backend {}:{}", backend_host, backend_port)
            })?;

        let client_upgrade = if is_upgrade_request(&req) {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let (mut parts, body) = req.into_parts();

        let upgrade_protocol = parts.headers.get(UPGRADE).cloned();
        remove_hop_by_hop(&mut parts.headers);
        if client_upgrade.is_some() {
            if let Some(protocol) = upgrade_protocol {
                parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
                parts.headers.insert(UPGRADE, protocol);
            }
        }

        let original_host = match parts.headers.get(HOST) {
            Some(host) => Some(host.clone()),
            None => parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok()),
        };
        if let Some(host) = &original_host {
            parts.headers.insert(HOST, host.clone());
        }
        set_forwarding_headers(&mut parts.headers, original_host, remote_addr, is_https)?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(path_and_query);
        parts.version = Version::HTTP_11;

        let proxy_req = Request::from_parts(parts, body);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("Failed to establish connection to backend")?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Backend connection error: {}", e);
            }
        });

        let mut response = sender
            .send_request(proxy_req)
            .await
            .context("Failed to send request to backend")?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                self.track_upgrade(splice(
                    client_upgrade,
                    backend_upgrade,
                    route.domain.clone(),
                    shutdown.clone(),
                    self.upgrade_grace,
                ));

                let (parts, _) = response.into_parts();
                return Ok(Response::from_parts(parts, empty_body()));
            }
        }

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Host a request is addressed to, without any port.
pub fn request_host<T>(req: &Request<T>) -> Option<String> {
    let authority = match req.headers().get(HOST) {
        Some(value) => value.to_str().ok()?.parse::<Authority>().ok()?,
        None => req.uri().authority()?.clone(),
    };

    let host = authority.host().trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Check if request asks for a protocol upgrade
fn is_upgrade_request<T>(req: &Request<T>) -> bool {
    req.headers().contains_key(UPGRADE)
        && req
            .headers()
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Strip hop-by-hop headers, including any the `Connection` header names.
fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn set_forwarding_headers(
    headers: &mut HeaderMap,
    original_host: Option<HeaderValue>,
    remote_addr: SocketAddr,
    is_https: bool,
) -> Result<()> {
    // Every prior hop is kept, whether sent as one list or as repeated headers.
    let mut hops: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    hops.push(remote_addr.ip().to_string());
    headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&hops.join(", "))?);

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if is_https { "https" } else { "http" }),
    );
    Ok(())
}

/// Copy bytes both ways between an upgraded client and backend connection.
///
/// Ends when either side closes, or `grace` after shutdown.
async fn splice(
    client: OnUpgrade,
    backend: OnUpgrade,
    domain: String,
    mut shutdown: ShutdownSignal,
    grace: Duration,
) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!("Protocol upgrade for {} failed: {}", domain, e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    let deadline = async {
        shutdown.recv().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut backend) => match result {
            Ok((up, down)) => debug!(
                "Upgraded connection for {} closed ({} bytes up, {} bytes down)",
                domain, up, down
            ),
            Err(e) => debug!("Upgraded connection for {} failed: {}", domain, e),
        },
        _ = deadline => {
            debug!("Closing upgraded connection for {} at shutdown", domain);
        }
    }
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain"));
    response
}

/// Create error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    text_response(status, message)
}

/// Create redirect response
pub fn redirect_response(location: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => error_response(StatusCode::BAD_REQUEST, "Bad Request"),
    }
}

/// Create full body
fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
