//! ACME (Let's Encrypt) certificate issuance over HTTP-01
//!
//! The issuer publishes key authorizations in a [`ChallengeStore`] that the plain HTTP
//! listener serves under `/.well-known/acme-challenge/`.

use crate::certificate::{CertError, CertificateIssuer, IssuedCertificate};
use crate::persistence::write_atomically;
use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const ACCOUNT_FILE: &str = "acme_account.json";

/// Let's Encrypt certificates are valid for 90 days.
const CERTIFICATE_LIFETIME_DAYS: i64 = 90;

const POLL_ATTEMPTS: u32 = 20;
const POLL_INITIAL_DELAY: Duration = Duration::from_millis(500);
const POLL_MAX_DELAY: Duration = Duration::from_secs(10);

/// Pending HTTP-01 challenge tokens
#[derive(Debug, Default)]
pub struct ChallengeStore {
    tokens: DashMap<String, String>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store ACME challenge token
    pub fn insert(&self, token: &str, key_authorization: &str) {
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Get ACME challenge response
    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|entry| entry.value().clone())
    }

    /// Remove ACME challenge
    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// ACME account settings
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    pub contact_email: Option<String>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETSENCRYPT_PRODUCTION.to_string(),
            contact_email: None,
        }
    }
}

/// Issues certificates from an ACME directory using HTTP-01 challenges.
pub struct AcmeIssuer {
    config: AcmeConfig,
    account_path: PathBuf,
    challenges: Arc<ChallengeStore>,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    /// Account credentials are kept in `certs_dir` and reused across restarts.
    pub fn new<P: AsRef<Path>>(
        config: AcmeConfig,
        certs_dir: P,
        challenges: Arc<ChallengeStore>,
    ) -> Self {
        Self {
            config,
            account_path: certs_dir.as_ref().join(ACCOUNT_FILE),
            challenges,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account, CertError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account, CertError> {
        if self.account_path.exists() {
            info!("Using ACME account from {}", self.account_path.display());
            let json = tokio::fs::read_to_string(&self.account_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&json)
                .map_err(|e| CertError::Issue(format!("invalid ACME account file: {}", e)))?;
            return Account::from_credentials(credentials)
                .await
                .map_err(acme_error);
        }

        info!("Creating ACME account at {}", self.config.directory_url);
        let contact = self
            .config
            .contact_email
            .as_ref()
            .map(|email| format!("mailto:{}", email));
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.config.directory_url,
            None,
        )
        .await
        .map_err(acme_error)?;

        let json = serde_json::to_vec_pretty(&credentials)
            .map_err(|e| CertError::Issue(format!("failed to encode ACME account: {}", e)))?;
        write_atomically(&self.account_path, |writer| writer.write_all(&json))?;
        info!("ACME account saved to {}", self.account_path.display());

        Ok(account)
    }

    /// Publish HTTP-01 tokens for every pending authorization and mark them ready.
    async fn publish_challenges(
        &self,
        order: &mut Order,
        published: &mut Vec<String>,
    ) -> Result<(), CertError> {
        let authorizations = order.authorizations().await.map_err(acme_error)?;

        for authz in &authorizations {
            match &authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(CertError::Issue(format!(
                        "authorization for {:?} is {:?}",
                        authz.identifier, status
                    )))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    CertError::Issue(format!(
                        "no http-01 challenge offered for {:?}",
                        authz.identifier
                    ))
                })?;

            let key_authorization = order.key_authorization(challenge);
            self.challenges
                .insert(&challenge.token, key_authorization.as_str());
            published.push(challenge.token.clone());
            debug!("Published http-01 token for {:?}", authz.identifier);

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(acme_error)?;
        }

        Ok(())
    }

    async fn run_order(
        &self,
        domain: &str,
        published: &mut Vec<String>,
    ) -> Result<IssuedCertificate, CertError> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(acme_error)?;

        if order.state().status == OrderStatus::Pending {
            self.publish_challenges(&mut order, published).await?;
        }

        let mut backoff = Backoff::new();
        let status = loop {
            let state = order.refresh().await.map_err(acme_error)?;
            match &state.status {
                OrderStatus::Pending | OrderStatus::Processing => backoff.wait().await?,
                status => break status.clone(),
            }
        };

        if status == OrderStatus::Invalid {
            return Err(CertError::Issue(format!("order for {} became invalid", domain)));
        }

        let (csr, key_pem) = certificate_request(domain)?;

        if status == OrderStatus::Ready {
            order.finalize(&csr).await.map_err(acme_error)?;
        }

        let mut backoff = Backoff::new();
        let cert_pem = loop {
            match order.certificate().await.map_err(acme_error)? {
                Some(pem) => break pem,
                None => backoff.wait().await?,
            }
        };

        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            not_after: chrono::Utc::now() + chrono::Duration::days(CERTIFICATE_LIFETIME_DAYS),
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
        info!("Requesting ACME certificate for {}", domain);

        let mut published = Vec::new();
        let result = self.run_order(domain, &mut published).await;

        for token in &published {
            self.challenges.remove(token);
        }

        match &result {
            Ok(_) => info!("ACME certificate issued for {}", domain),
            Err(e) => warn!("ACME certificate request for {} failed: {}", domain, e),
        }
        result
    }
}

/// Fresh key pair and DER-encoded CSR for `domain`.
fn certificate_request(domain: &str) -> Result<(Vec<u8>, String), CertError> {
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]);
    params.distinguished_name = rcgen::DistinguishedName::new();
    let cert =
        rcgen::Certificate::from_params(params).map_err(|e| CertError::Issue(e.to_string()))?;
    let csr = cert
        .serialize_request_der()
        .map_err(|e| CertError::Issue(e.to_string()))?;
    Ok((csr, cert.serialize_private_key_pem()))
}

/// Bounded exponential backoff for polling the ACME server.
struct Backoff {
    remaining: u32,
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            remaining: POLL_ATTEMPTS,
            delay: POLL_INITIAL_DELAY,
        }
    }

    /// Sleep before the next attempt, or fail once the attempts are used up.
    async fn wait(&mut self) -> Result<(), CertError> {
        if self.remaining == 0 {
            return Err(CertError::Issue(
                "timed out waiting for the ACME server".to_string(),
            ));
        }
        self.remaining -= 1;
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(POLL_MAX_DELAY);
        Ok(())
    }
}

fn acme_error(e: instant_acme::Error) -> CertError {
    CertError::Issue(format!("ACME protocol error: {}", e))
}
