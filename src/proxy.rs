//! Proxy server implementation
//! Accepts HTTP and HTTPS connections and hands requests to the dispatcher.

use crate::certificate::CertificateManager;
use crate::dispatcher::{
    error_response, redirect_response, request_host, text_response, Dispatcher, ProxyBody,
};
use crate::routes::RouteStore;
use crate::shutdown::ShutdownSignal;
use anyhow::{bail, Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

/// Path prefix under which HTTP-01 challenge tokens are served
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_address: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub force_https: bool,
    /// How long in-flight connections may take to finish after shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 8080,
            https_port: 8443,
            enable_https: false,
            force_https: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("HTTP"),
            Scheme::Https => f.write_str("HTTPS"),
        }
    }
}

/// Bound listening sockets, ready to be served.
#[derive(Debug)]
pub struct Listeners {
    http: TcpListener,
    http_addr: SocketAddr,
    https: Option<(TcpListener, SocketAddr)>,
}

impl Listeners {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().map(|(_, addr)| *addr)
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    dispatcher: Dispatcher,
    cert_manager: Option<Arc<CertificateManager>>,
}

impl ProxyServer {
    /// Create a new proxy server. HTTPS needs a certificate manager.
    pub fn new(
        config: ProxyConfig,
        routes: Arc<RouteStore>,
        cert_manager: Option<Arc<CertificateManager>>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(routes).with_upgrade_grace(config.shutdown_grace),
            config,
            cert_manager,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Bind the HTTP listener and, when enabled, the HTTPS listener.
    pub async fn bind(&self) -> Result<Listeners> {
        if self.config.enable_https && self.cert_manager.is_none() {
            bail!("HTTPS is enabled but no certificate manager is configured");
        }

        let addr = SocketAddr::new(self.config.bind_address, self.config.http_port);
        let http = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
        let http_addr = http.local_addr()?;
        info!("HTTP server listening on {}", http_addr);

        let https = if self.config.enable_https {
            let addr = SocketAddr::new(self.config.bind_address, self.config.https_port);
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind HTTPS listener on {}", addr))?;
            let local = listener.local_addr()?;
            info!("HTTPS server listening on {}", local);
            Some((listener, local))
        } else {
            None
        };

        Ok(Listeners {
            http,
            http_addr,
            https,
        })
    }

    /// Serve bound listeners until `shutdown` fires and connections have drained.
    ///
    /// Upgraded connections are drained last, under the same grace period.
    pub async fn serve(
        self: Arc<Self>,
        listeners: Listeners,
        shutdown: ShutdownSignal,
    ) -> Result<()> {
        let mut loops = JoinSet::new();

        loops.spawn(self.clone().accept_loop(listeners.http, Scheme::Http, shutdown.clone()));
        if let Some((listener, _)) = listeners.https {
            loops.spawn(self.clone().accept_loop(listener, Scheme::Https, shutdown));
        }

        while let Some(result) = loops.join_next().await {
            result.context("listener task failed")?;
        }

        self.dispatcher.close_upgrades(self.config.shutdown_grace).await;
        Ok(())
    }

    /// Bind and serve.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners, shutdown).await
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        scheme: Scheme,
        mut shutdown: ShutdownSignal,
    ) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let server = self.clone();
                        let signal = shutdown.clone();
                        connections.spawn(async move {
                            server.handle_connection(stream, remote_addr, scheme, signal).await
                        });
                    }
                    Err(e) => {
                        warn!("{} accept error: {}", scheme, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.recv() => break,
            }
        }

        drop(listener);
        info!(
            "{} listener closed, waiting for {} connection(s)",
            scheme,
            connections.len()
        );

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                "Shutdown grace period elapsed, closing {} {} connection(s)",
                connections.len(),
                scheme
            );
            connections.shutdown().await;
        }
    }

    /// Handle a single connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        scheme: Scheme,
        shutdown: ShutdownSignal,
    ) {
        match scheme {
            Scheme::Http => self.serve_http1(stream, remote_addr, false, shutdown).await,
            Scheme::Https => {
                if let Some(tls) = self.accept_tls(stream, remote_addr).await {
                    self.serve_http1(tls, remote_addr, true, shutdown).await
                }
            }
        }
    }

    /// Complete a TLS handshake with a certificate chosen by SNI.
    async fn accept_tls(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Option<TlsStream<TcpStream>> {
        let cert_manager = self.cert_manager.as_ref()?;

        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = match acceptor.await {
            Ok(start) => start,
            Err(e) => {
                debug!("TLS client hello from {} failed: {}", remote_addr, e);
                return None;
            }
        };

        let server_name = start.client_hello().server_name().map(str::to_string);
        let config = match cert_manager.tls_config_for(server_name.as_deref()).await {
            Ok(config) => config,
            Err(e) => {
                debug!(
                    "Refusing TLS from {} for {:?}: {}",
                    remote_addr, server_name, e
                );
                return None;
            }
        };

        match start.into_stream(config).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!("TLS handshake with {} failed: {}", remote_addr, e);
                None
            }
        }
    }

    async fn serve_http1<I>(
        self: Arc<Self>,
        io: I,
        remote_addr: SocketAddr,
        is_https: bool,
        mut shutdown: ShutdownSignal,
    ) where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let request_shutdown = shutdown.clone();
        let service = service_fn(move |req| {
            let server = self.clone();
            let shutdown = request_shutdown.clone();
            async move {
                let response = server
                    .handle_request(req, remote_addr, is_https, &shutdown)
                    .await;
                Ok::<_, Infallible>(response)
            }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            }
            _ = shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                if let Err(e) = conn.await {
                    debug!("Connection error from {} during shutdown: {}", remote_addr, e);
                }
            }
        }
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_https: bool,
        shutdown: &ShutdownSignal,
    ) -> Response<ProxyBody> {
        debug!("{} {} from {}", req.method(), req.uri(), remote_addr);

        if !is_https {
            if let Some(cert_manager) = &self.cert_manager {
                if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
                    return match cert_manager.challenge_response(token) {
                        Some(key_auth) => text_response(StatusCode::OK, &key_auth),
                        None => error_response(StatusCode::NOT_FOUND, "Challenge not found"),
                    };
                }
            }

            if self.config.force_https {
                return self.https_redirect(&req);
            }
        }

        self.dispatcher
            .dispatch(req, remote_addr, is_https, shutdown)
            .await
    }

    /// Redirect a plain HTTP request to the same URL over HTTPS.
    fn https_redirect<T>(&self, req: &Request<T>) -> Response<ProxyBody> {
        let host = match request_host(req) {
            Some(host) => host,
            None => return error_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let location = match self.config.https_port {
            443 => format!("https://{}{}", host, path),
            port => format!("https://{}:{}{}", host, port, path),
        };
        redirect_response(&location)
    }
}
