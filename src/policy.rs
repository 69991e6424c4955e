//! Certificate policy gate
//! Certificates are only requested for hosts that currently have a route.

use crate::routes::RouteStore;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("no route for host '{0}', refusing to issue a certificate")]
    NotRouted(String),

    #[error("empty host name")]
    EmptyHost,
}

/// Decides whether a certificate may be issued or renewed for a host.
pub trait HostPolicy: Send + Sync {
    fn check(&self, host: &str) -> Result<(), PolicyError>;
}

/// Permits exactly the hosts present in the route store at the time of the check.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    routes: Arc<RouteStore>,
}

impl RoutePolicy {
    pub fn new(routes: Arc<RouteStore>) -> Self {
        Self { routes }
    }
}

impl HostPolicy for RoutePolicy {
    fn check(&self, host: &str) -> Result<(), PolicyError> {
        if host.trim().is_empty() {
            return Err(PolicyError::EmptyHost);
        }
        if self.routes.contains(host) {
            Ok(())
        } else {
            Err(PolicyError::NotRouted(host.to_string()))
        }
    }
}
