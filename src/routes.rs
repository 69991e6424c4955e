//! Route store
//! Owns the domain -> backend mapping shared by the dispatcher, the console and the
//! certificate policy gate.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// Backend host every route forwards to.
pub const BACKEND_HOST: &str = "localhost";

/// Table of routes keyed by normalized domain.
pub type RouteTable = HashMap<String, Route>;

/// Validation failures for a route.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("domain is empty")]
    EmptyDomain,

    #[error("port is empty")]
    EmptyPort,

    #[error("invalid port '{0}': expected a number between 1 and 65535")]
    InvalidPort(String),
}

/// A domain bound to a backend port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub domain: String,
    pub port: String,
    pub target: Url,
}

impl Route {
    /// Build a route, normalizing the domain and validating the port.
    pub fn new(domain: &str, port: &str) -> Result<Self, RouteError> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Err(RouteError::EmptyDomain);
        }

        let port = port.trim();
        if port.is_empty() {
            return Err(RouteError::EmptyPort);
        }

        let target = backend_target(port)?;

        Ok(Self {
            domain,
            port: port.to_string(),
            target,
        })
    }

    /// Persisted form of this route
    pub fn record(&self) -> RouteRecord {
        RouteRecord {
            domain: self.domain.clone(),
            port: self.port.clone(),
        }
    }
}

/// On-disk form of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub domain: String,
    pub port: String,
}

/// Canonicalize a domain for use as a table key.
///
/// Lowercases, drops trailing dots and strips every leading `www.` label, so applying it
/// twice yields the same result as applying it once.
pub fn normalize_domain(domain: &str) -> String {
    let lowered = domain.trim().to_ascii_lowercase();
    let mut normalized = lowered.as_str();
    loop {
        let stripped = normalized
            .strip_prefix("www.")
            .unwrap_or(normalized)
            .trim_end_matches('.');
        if stripped.len() == normalized.len() {
            break;
        }
        normalized = stripped;
    }
    normalized.to_string()
}

fn backend_target(port: &str) -> Result<Url, RouteError> {
    if !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RouteError::InvalidPort(port.to_string()));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => return Err(RouteError::InvalidPort(port.to_string())),
        Ok(_) => {}
    }

    Url::parse(&format!("http://{}:{}", BACKEND_HOST, port))
        .map_err(|_| RouteError::InvalidPort(port.to_string()))
}

/// Thread-safe route store
/// Readers share the lock; `put`, `remove` and `replace_all` take it exclusively and
/// never do more than one map operation while holding it.
#[derive(Debug, Default)]
pub struct RouteStore {
    routes: RwLock<RouteTable>,
}

impl RouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with an already-built table
    pub fn with_table(table: RouteTable) -> Self {
        Self {
            routes: RwLock::new(table),
        }
    }

    /// Look up the route for a domain
    pub fn get(&self, domain: &str) -> Option<Route> {
        let domain = normalize_domain(domain);
        self.routes.read().get(&domain).cloned()
    }

    /// Check if a domain has a route
    pub fn contains(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        self.routes.read().contains_key(&domain)
    }

    /// Add or replace the route for a domain
    pub fn put(&self, domain: &str, port: &str) -> Result<Route, RouteError> {
        let route = Route::new(domain, port)?;
        self.routes
            .write()
            .insert(route.domain.clone(), route.clone());
        Ok(route)
    }

    /// Remove a route, returning whether it existed
    pub fn remove(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        self.routes.write().remove(&domain).is_some()
    }

    /// Swap in a whole new table at once
    pub fn replace_all(&self, table: RouteTable) {
        let previous = std::mem::replace(&mut *self.routes.write(), table);
        drop(previous);
    }

    /// Snapshot of `(domain, port)` pairs, sorted by domain
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .routes
            .read()
            .values()
            .map(|route| (route.domain.clone(), route.port.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Snapshot in persisted form, sorted by domain
    pub fn records(&self) -> Vec<RouteRecord> {
        self.list()
            .into_iter()
            .map(|(domain, port)| RouteRecord { domain, port })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
