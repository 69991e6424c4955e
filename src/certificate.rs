//! Certificate manager for SSL/TLS certificate handling
//! Obtains certificates on demand for routed hosts, caches them on disk and renews them
//! in the background. Every issuance and renewal goes through the host policy first.

use crate::acme::ChallengeStore;
use crate::persistence::write_atomically;
use crate::policy::{HostPolicy, PolicyError};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rcgen::generate_simple_self_signed;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const META_SUFFIX: &str = ".meta.json";

/// Renew certificates this long before they expire.
pub const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

/// Self-signed certificates are treated as valid for ten years.
const SELF_SIGNED_LIFETIME_DAYS: i64 = 3650;

const ISSUE_COOLDOWN: Duration = Duration::from_secs(5 * 60);
const ISSUE_WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const ISSUES_PER_WEEK: u32 = 5;

#[derive(Debug, Error)]
pub enum CertError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("client did not send a server name")]
    MissingServerName,

    #[error("certificate issuance for '{0}' is rate limited")]
    RateLimited(String),

    #[error("certificate issuance failed: {0}")]
    Issue(String),

    #[error("invalid certificate material for '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("certificate cache I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A freshly issued certificate chain and its private key, both PEM encoded
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

/// Something that can produce a certificate for a single host name.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError>;
}

/// Issues self-signed certificates. Meant for local development and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
        let cert = generate_simple_self_signed(vec![domain.to_string()])
            .map_err(|e| CertError::Issue(e.to_string()))?;
        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| CertError::Issue(e.to_string()))?;

        info!("Generated self-signed certificate for: {}", domain);

        Ok(IssuedCertificate {
            cert_pem,
            key_pem: cert.serialize_private_key_pem(),
            not_after: Utc::now() + chrono::Duration::days(SELF_SIGNED_LIFETIME_DAYS),
        })
    }
}

/// Sidecar stored next to each cached certificate
#[derive(Debug, Serialize, Deserialize)]
struct CertificateMeta {
    domain: String,
    /// Unix timestamp, seconds
    not_after: i64,
}

struct CachedConfig {
    config: Arc<ServerConfig>,
    not_after: DateTime<Utc>,
}

/// Issuance attempt bookkeeping for a host
struct RateLimitState {
    last_request: Instant,
    weekly_count: u32,
    week_start: Instant,
}

/// Outcome of one renewal pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenewalReport {
    pub renewed: usize,
    /// Due, but the host no longer has a route.
    pub skipped: usize,
    pub failed: usize,
}

/// Certificate manager for handling SSL certificates
pub struct CertificateManager {
    certs_dir: PathBuf,
    policy: Arc<dyn HostPolicy>,
    issuer: Arc<dyn CertificateIssuer>,
    challenges: Arc<ChallengeStore>,
    configs: DashMap<String, CachedConfig>,
    rate_limits: DashMap<String, RateLimitState>,
    issue_lock: TokioMutex<()>,
    renew_before: chrono::Duration,
}

impl CertificateManager {
    /// Create a new certificate manager
    pub fn new<P: AsRef<Path>>(
        certs_dir: P,
        policy: Arc<dyn HostPolicy>,
        issuer: Arc<dyn CertificateIssuer>,
        challenges: Arc<ChallengeStore>,
    ) -> Result<Self, CertError> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir)?;

        Ok(Self {
            certs_dir,
            policy,
            issuer,
            challenges,
            configs: DashMap::new(),
            rate_limits: DashMap::new(),
            issue_lock: TokioMutex::new(()),
            renew_before: chrono::Duration::days(DEFAULT_RENEW_BEFORE_DAYS),
        })
    }

    /// Override how long before expiry a certificate is renewed
    pub fn with_renew_before(mut self, renew_before: chrono::Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    /// Get certs directory path
    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// Key authorization for a pending HTTP-01 challenge
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.get(token)
    }

    /// TLS configuration for the server name a client asked for.
    ///
    /// Served from memory, then from the certs directory, and only issued when neither
    /// holds a valid certificate. The host policy is consulted before anything else.
    pub async fn tls_config_for(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<ServerConfig>, CertError> {
        let name = server_name
            .map(|n| n.trim_end_matches('.').to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .ok_or(CertError::MissingServerName)?;

        if let Err(e) = self.policy.check(&name) {
            warn!("Certificate request denied: {}", e);
            return Err(e.into());
        }

        if let Some(config) = self.cached(&name) {
            return Ok(config);
        }
        if let Some(config) = self.load_from_disk(&name)? {
            return Ok(config);
        }

        let _guard = self.issue_lock.lock().await;
        // Another handshake may have finished issuing while we waited.
        if let Some(config) = self.cached(&name) {
            return Ok(config);
        }
        self.issue_and_store(&name).await
    }

    /// Renew every cached certificate that is inside its renewal window.
    pub async fn renew_due(&self) -> RenewalReport {
        let mut report = RenewalReport::default();
        let renew_at = Utc::now() + self.renew_before;

        for meta in self.cached_metadata() {
            let Some(not_after) = timestamp(meta.not_after) else {
                warn!("Ignoring certificate metadata for {} with bad expiry", meta.domain);
                continue;
            };
            if not_after > renew_at {
                continue;
            }

            if let Err(e) = self.policy.check(&meta.domain) {
                info!("Not renewing certificate: {}", e);
                self.configs.remove(&meta.domain);
                report.skipped += 1;
                continue;
            }

            let _guard = self.issue_lock.lock().await;
            match self.issue_and_store(&meta.domain).await {
                Ok(_) => {
                    info!("Renewed certificate for {}", meta.domain);
                    report.renewed += 1;
                }
                Err(e) => {
                    error!("Failed to renew certificate for {}: {}", meta.domain, e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Run `renew_due` every `interval` until shutdown.
    ///
    /// Shutdown also cancels a pass that is still in progress.
    pub fn spawn_renewal(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Certificate renewal task started (interval: {:?})", interval);
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Shutdown cancels a pass still waiting on the issuer.
                        let report = tokio::select! {
                            report = self.renew_due() => report,
                            _ = shutdown.recv() => {
                                info!("Certificate renewal pass interrupted by shutdown");
                                break;
                            }
                        };
                        if report != RenewalReport::default() {
                            info!(
                                "Renewal pass: {} renewed, {} skipped, {} failed",
                                report.renewed, report.skipped, report.failed
                            );
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Certificate renewal task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn cached(&self, name: &str) -> Option<Arc<ServerConfig>> {
        let entry = self.configs.get(name)?;
        if entry.not_after > Utc::now() {
            Some(entry.config.clone())
        } else {
            None
        }
    }

    fn load_from_disk(&self, name: &str) -> Result<Option<Arc<ServerConfig>>, CertError> {
        let (cert_path, key_path, meta_path) = self.paths(name);
        if !cert_path.exists() || !key_path.exists() || !meta_path.exists() {
            return Ok(None);
        }

        let meta: CertificateMeta = match serde_json::from_slice(&fs::read(&meta_path)?) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", meta_path.display(), e);
                return Ok(None);
            }
        };
        let not_after = match timestamp(meta.not_after) {
            Some(t) if t > Utc::now() => t,
            _ => return Ok(None),
        };

        let config = build_server_config(
            name,
            &fs::read_to_string(&cert_path)?,
            &fs::read_to_string(&key_path)?,
        )?;
        debug!("Loaded cached certificate for {}", name);

        self.configs.insert(
            name.to_string(),
            CachedConfig {
                config: config.clone(),
                not_after,
            },
        );
        Ok(Some(config))
    }

    /// Issue, persist and cache a certificate. Callers hold `issue_lock`.
    async fn issue_and_store(&self, name: &str) -> Result<Arc<ServerConfig>, CertError> {
        self.policy.check(name)?;

        if self.is_rate_limited(name) {
            warn!("Certificate issuance for {} is rate limited", name);
            return Err(CertError::RateLimited(name.to_string()));
        }
        self.update_rate_limit(name);

        info!("Obtaining certificate for {}", name);
        let issued = self.issuer.issue(name).await?;
        let config = build_server_config(name, &issued.cert_pem, &issued.key_pem)?;

        let (cert_path, key_path, meta_path) = self.paths(name);
        let meta = serde_json::to_vec_pretty(&CertificateMeta {
            domain: name.to_string(),
            not_after: issued.not_after.timestamp(),
        })
        .map_err(|e| CertError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        write_atomically(&key_path, |w| w.write_all(issued.key_pem.as_bytes()))?;
        write_atomically(&cert_path, |w| w.write_all(issued.cert_pem.as_bytes()))?;
        write_atomically(&meta_path, |w| w.write_all(&meta))?;

        self.configs.insert(
            name.to_string(),
            CachedConfig {
                config: config.clone(),
                not_after: issued.not_after,
            },
        );
        Ok(config)
    }

    fn cached_metadata(&self) -> Vec<CertificateMeta> {
        let entries = match fs::read_dir(&self.certs_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Cannot scan {}: {}", self.certs_dir.display(), e);
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(META_SUFFIX))
            .filter_map(|entry| {
                let bytes = fs::read(entry.path()).ok()?;
                match serde_json::from_slice::<CertificateMeta>(&bytes) {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        warn!("Ignoring unreadable {}: {}", entry.path().display(), e);
                        None
                    }
                }
            })
            .collect()
    }

    fn paths(&self, name: &str) -> (PathBuf, PathBuf, PathBuf) {
        let base = Self::sanitize_domain(name);
        (
            self.certs_dir.join(format!("{}.crt", base)),
            self.certs_dir.join(format!("{}.key", base)),
            self.certs_dir.join(format!("{}{}", base, META_SUFFIX)),
        )
    }

    /// Sanitize domain name for filesystem
    fn sanitize_domain(domain: &str) -> String {
        domain
            .replace('*', "wildcard")
            .replace(&['/', '\\'][..], "_")
    }

    /// Check if domain is rate limited
    fn is_rate_limited(&self, domain: &str) -> bool {
        if let Some(state) = self.rate_limits.get(domain) {
            let now = Instant::now();

            if now.duration_since(state.last_request) < ISSUE_COOLDOWN {
                return true;
            }

            if now.duration_since(state.week_start) < ISSUE_WEEK
                && state.weekly_count >= ISSUES_PER_WEEK
            {
                return true;
            }
        }
        false
    }

    /// Update rate limit state
    fn update_rate_limit(&self, domain: &str) {
        let now = Instant::now();
        self.rate_limits
            .entry(domain.to_string())
            .and_modify(|state| {
                // Reset weekly count if week has passed
                if now.duration_since(state.week_start) >= ISSUE_WEEK {
                    state.week_start = now;
                    state.weekly_count = 1;
                } else {
                    state.weekly_count += 1;
                }
                state.last_request = now;
            })
            .or_insert(RateLimitState {
                last_request: now,
                weekly_count: 1,
                week_start: now,
            });
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Build a rustls server configuration from PEM material
pub fn build_server_config(
    name: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<ServerConfig>, CertError> {
    let invalid = |reason: String| CertError::Invalid {
        name: name.to_string(),
        reason,
    };

    let mut cert_reader = cert_pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;
    if certs.is_empty() {
        return Err(invalid("no certificates in PEM".to_string()));
    }

    let mut key_reader = key_pem.as_bytes();
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("no private key in PEM".to_string()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| invalid(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RoutePolicy;
    use crate::routes::RouteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Self-signed issuer that counts calls and can be told to fail
    #[derive(Default)]
    struct CountingIssuer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CertificateIssuer for CountingIssuer {
        async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CertError::Issue("CA unavailable".to_string()));
            }
            SelfSignedIssuer.issue(domain).await
        }
    }

    fn manager(
        dir: &Path,
        routes: &Arc<RouteStore>,
        issuer: Arc<CountingIssuer>,
    ) -> CertificateManager {
        CertificateManager::new(
            dir,
            Arc::new(RoutePolicy::new(routes.clone())),
            issuer,
            Arc::new(ChallengeStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_sanitize_domain() {
        assert_eq!(CertificateManager::sanitize_domain("example.com"), "example.com");
        assert_eq!(CertificateManager::sanitize_domain("*.example.com"), "wildcard.example.com");
        assert_eq!(CertificateManager::sanitize_domain("../etc"), ".._etc");
    }

    #[tokio::test]
    async fn test_self_signed_issuer_builds_config() {
        let issued = SelfSignedIssuer.issue("example.com").await.unwrap();
        assert!(issued.not_after > Utc::now() + chrono::Duration::days(365));

        let config = build_server_config("example.com", &issued.cert_pem, &issued.key_pem).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_build_server_config_rejects_garbage() {
        let err = build_server_config("a.com", "not a cert", "not a key").unwrap_err();
        assert!(matches!(err, CertError::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_unrouted_host_is_denied() {
        let dir = tempdir().unwrap();
        let routes = Arc::new(RouteStore::new());
        routes.put("a.com", "9000").unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let certs = manager(dir.path(), &routes, issuer.clone());

        let err = certs.tls_config_for(Some("b.com")).await.unwrap_err();
        assert!(matches!(err, CertError::Policy(PolicyError::NotRouted(_))));

        let err = certs.tls_config_for(None).await.unwrap_err();
        assert!(matches!(err, CertError::MissingServerName));

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_issues_once_then_serves_from_cache() {
        let dir = tempdir().unwrap();
        let routes = Arc::new(RouteStore::new());
        routes.put("a.com", "9000").unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let certs = manager(dir.path(), &routes, issuer.clone());

        certs.tls_config_for(Some("a.com")).await.unwrap();
        certs.tls_config_for(Some("A.COM.")).await.unwrap();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("a.com.crt").exists());
        assert!(dir.path().join("a.com.key").exists());
        assert!(dir.path().join("a.com.meta.json").exists());
    }

    #[tokio::test]
    async fn test_route_added_later_becomes_eligible() {
        let dir = tempdir().unwrap();
        let routes = Arc::new(RouteStore::new());
        let issuer = Arc::new(CountingIssuer::default());
        let certs = manager(dir.path(), &routes, issuer.clone());

        assert!(certs.tls_config_for(Some("late.com")).await.is_err());

        routes.put("late.com", "9000").unwrap();
        assert!(certs.tls_config_for(Some("late.com")).await.is_ok());
    }

    #[tokio::test]
    async fn test_disk_cache_survives_restart() {
        let dir = tempdir().unwrap();
        let routes = Arc::new(RouteStore::new());
        routes.put("a.com", "9000").unwrap();

        let first = Arc::new(CountingIssuer::default());
        manager(dir.path(), &routes, first.clone())
            .tls_config_for(Some("a.com"))
            .await
            .unwrap();

        let second = Arc::new(CountingIssuer::default());
        manager(dir.path(), &routes, second.clone())
            .tls_config_for(Some("a.com"))
            .await
            .unwrap();

        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_issuance_is_rate_limited() {
        let dir = tempdir().unwrap();
        let routes = Arc::new(RouteStore::new());
        routes.put("a.com", "9000").unwrap();
        let issuer = Arc::new(CountingIssuer {
            fail: true,
            ..Default::default()
        });
        let certs = manager(dir.path(), &routes, issuer.clone());

        let err = certs.tls_config_for(Some("a.com")).await.unwrap_err();
        assert!(matches!(err, CertError::Issue(_)));

        let err = certs.tls_config_for(Some("a.com")).await.unwrap_err();
        assert!(matches!(err, CertError::RateLimited(_)));

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renewal_skips_unrouted_hosts() {
        let dir = tempdir().unwrap();
        let routes = Arc::new(RouteStore::new());
        routes.put("keep.com", "9000").unwrap();
        routes.put("drop.com", "9001").unwrap();

        let issuer = Arc::new(CountingIssuer::default());
        manager(dir.path(), &routes, issuer.clone())
            .tls_config_for(Some("keep.com"))
            .await
            .unwrap();
        manager(dir.path(), &routes, issuer.clone())
            .tls_config_for(Some("drop.com"))
            .await
            .unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);

        routes.remove("drop.com");

        // Everything is inside a twenty-year renewal window.
        let certs = manager(dir.path(), &routes, issuer.clone())
            .with_renew_before(chrono::Duration::days(20 * 365));
        let report = certs.renew_due().await;

        assert_eq!(
            report,
            RenewalReport {
                renewed: 1,
                skipped: 1,
                failed: 0,
            }
        );
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 3);
    }

    /// Issuer that never answers in time
    struct StalledIssuer;

    #[async_trait]
    impl CertificateIssuer for StalledIssuer {
        async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            SelfSignedIssuer.issue(domain).await
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_running_renewal() {
        let dir = tempdir().unwrap();
        let routes = Arc::new(RouteStore::new());
        routes.put("a.com", "9000").unwrap();
        manager(dir.path(), &routes, Arc::new(CountingIssuer::default()))
            .tls_config_for(Some("a.com"))
            .await
            .unwrap();

        let certs = CertificateManager::new(
            dir.path(),
            Arc::new(RoutePolicy::new(routes.clone())),
            Arc::new(StalledIssuer),
            Arc::new(ChallengeStore::new()),
        )
        .unwrap()
        .with_renew_before(chrono::Duration::days(20 * 365));

        let shutdown = crate::shutdown::Shutdown::new();
        let certs = Arc::new(certs);
        let handle = certs.spawn_renewal(Duration::from_secs(3600), shutdown.subscribe());

        // Let the first tick start the pass and block inside the issuer.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("renewal task ignored shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_nothing_due_means_no_renewal() {
        let dir = tempdir().unwrap();
        let routes = Arc::new(RouteStore::new());
        routes.put("a.com", "9000").unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let certs = manager(dir.path(), &routes, issuer.clone());

        certs.tls_config_for(Some("a.com")).await.unwrap();
        assert_eq!(certs.renew_due().await, RenewalReport::default());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_challenge_response() {
        let dir = tempdir().unwrap();
        let challenges = Arc::new(ChallengeStore::new());
        let certs = CertificateManager::new(
            dir.path(),
            Arc::new(RoutePolicy::new(Arc::new(RouteStore::new()))),
            Arc::new(SelfSignedIssuer),
            challenges.clone(),
        )
        .unwrap();

        challenges.insert("token123", "key_auth_value");
        assert_eq!(certs.challenge_response("token123"), Some("key_auth_value".to_string()));
        assert!(certs.challenge_response("other").is_none());
    }
}
