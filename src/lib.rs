//! RouteProxy - A host-routed HTTP/HTTPS reverse proxy
//!
//! Provides:
//! - Domain-based routing to `localhost:<port>` backends
//! - A live route table edited from an interactive console and saved atomically to JSON
//! - HTTPS with certificates issued on demand, only for routed domains
//! - WebSocket and other protocol upgrades
//! - Graceful shutdown with a bounded grace period

pub mod acme;
pub mod certificate;
pub mod console;
pub mod dispatcher;
pub mod persistence;
pub mod policy;
pub mod proxy;
pub mod routes;
pub mod shutdown;

pub use acme::{AcmeConfig, AcmeIssuer, ChallengeStore};
pub use certificate::{CertError, CertificateIssuer, CertificateManager, SelfSignedIssuer};
pub use console::{Command, Console};
pub use dispatcher::Dispatcher;
pub use persistence::{LoadedRoutes, PersistError};
pub use policy::{HostPolicy, PolicyError, RoutePolicy};
pub use proxy::{Listeners, ProxyConfig, ProxyServer};
pub use routes::{normalize_domain, Route, RouteError, RouteRecord, RouteStore};
pub use shutdown::{Shutdown, ShutdownSignal};
