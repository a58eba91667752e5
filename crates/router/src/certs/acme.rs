//! Automated certificates from an ACME certificate authority
//!
//! Certificates are obtained with HTTP-01 challenges answered by the plain
//! HTTP listener. Account credentials and issued certificates persist in the
//! [`Cache`] so restarts and sibling routers reuse them.

use super::{CertificateProvisioner, certified_key};
use crate::cache::Cache;
use crate::common::error::{Result, RouterError};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

/// Cache key of the ACME account credentials
pub const ACCOUNT_CACHE_KEY: &str = "acme_account+key";

/// Certificates expiring sooner than this are re-issued
const RENEW_BEFORE_SECS: i64 = 30 * 24 * 60 * 60;

/// Order polling attempts and interval while the CA validates challenges
const ORDER_POLL_ATTEMPTS: u32 = 30;
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A usable certificate and when it stops being valid
#[derive(Clone)]
struct IssuedCertificate {
    key: Arc<CertifiedKey>,
    /// Unix timestamp of the leaf's notAfter
    not_after: i64,
}

impl IssuedCertificate {
    fn needs_renewal(&self, now: i64) -> bool {
        self.not_after - now < RENEW_BEFORE_SECS
    }
}

/// Provisioner backed by an ACME certificate authority
pub struct AcmeProvisioner {
    cache: Arc<dyn Cache>,
    directory_url: String,
    contact: Option<String>,
    account: RwLock<Option<Arc<Account>>>,
    /// Key: lowercase hostname
    issued: DashMap<String, IssuedCertificate>,
    /// One in-flight order per hostname
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Pending HTTP-01 challenges, token to key authorization
    challenges: DashMap<String, String>,
    fallback: Arc<CertifiedKey>,
}

impl AcmeProvisioner {
    pub fn new(
        cache: Arc<dyn Cache>,
        directory_url: String,
        contact: Option<String>,
        fallback: Arc<CertifiedKey>,
    ) -> Self {
        Self {
            cache,
            directory_url,
            contact,
            account: RwLock::new(None),
            issued: DashMap::new(),
            locks: DashMap::new(),
            challenges: DashMap::new(),
            fallback,
        }
    }

    /// Get or create the ACME account
    async fn account(&self) -> Result<Arc<Account>> {
        {
            let account_lock = self.account.read().await;
            if let Some(account) = account_lock.as_ref() {
                return Ok(account.clone());
            }
        }

        let mut account_lock = self.account.write().await;
        if let Some(account) = account_lock.as_ref() {
            return Ok(account.clone());
        }

        let account = match self.cache.get(ACCOUNT_CACHE_KEY).await? {
            Some(creds_json) => {
                debug!("Loading ACME account from cache");
                let creds: AccountCredentials = serde_json::from_slice(&creds_json)?;
                Account::builder()?.from_credentials(creds).await?
            }
            None => {
                info!(directory = %self.directory_url, "Creating new ACME account");
                let contacts: Vec<String> = self
                    .contact
                    .iter()
                    .map(|email| format!("mailto:{email}"))
                    .collect();
                let contact_refs: Vec<&str> = contacts.iter().map(String::as_str).collect();

                let (account, creds) = Account::builder()?
                    .create(
                        &NewAccount {
                            contact: &contact_refs,
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        self.directory_url.clone(),
                        None,
                    )
                    .await?;

                self.cache
                    .put(ACCOUNT_CACHE_KEY, serde_json::to_vec(&creds)?)
                    .await?;

                account
            }
        };

        let account = Arc::new(account);
        *account_lock = Some(account.clone());

        Ok(account)
    }

    /// Certificate for `host` from the hot table or the cache, if still fresh
    async fn lookup(&self, host: &str, now: i64) -> Result<Option<IssuedCertificate>> {
        if let Some(issued) = self.issued.get(host) {
            let issued = issued.value().clone();
            if !issued.needs_renewal(now) {
                return Ok(Some(issued));
            }
        }

        let Some(bundle) = self.cache.get(host).await? else {
            return Ok(None);
        };

        match parse_bundle(&bundle) {
            Ok(issued) if !issued.needs_renewal(now) => {
                self.issued.insert(host.to_string(), issued.clone());
                Ok(Some(issued))
            }
            Ok(_) => {
                info!("Cached certificate for {} is due for renewal", host);
                Ok(None)
            }
            Err(e) => {
                warn!("Discarding unreadable cached certificate for {}: {}", host, e);
                self.cache.delete(host).await?;
                Ok(None)
            }
        }
    }

    /// Run an ACME order for `host` and store the result
    #[instrument(skip(self))]
    async fn issue(&self, host: &str) -> Result<IssuedCertificate> {
        info!("Requesting certificate for domain: {}", host);

        let account = self.account().await?;

        let identifier = Identifier::Dns(host.to_string());
        let mut order = account.new_order(&NewOrder::new(&[identifier])).await?;
        debug!("Order created: {:?}", order.state().status);

        let mut tokens = Vec::new();
        let result = self.complete_order(&mut order, &mut tokens).await;

        for token in tokens {
            self.challenges.remove(&token);
        }
        result?;

        let private_key_pem = order.finalize().await?;
        let cert_chain_pem = loop {
            match order.certificate().await? {
                Some(cert_chain_pem) => break cert_chain_pem,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        let bundle = format!("{private_key_pem}{cert_chain_pem}").into_bytes();
        let issued = parse_bundle(&bundle)?;
        self.cache.put(host, bundle).await?;

        info!("Certificate issued for {}", host);
        Ok(issued)
    }

    /// Issue for `host` unless another handshake finished the order while we
    /// waited for the host lock
    async fn lookup_or_issue(&self, host: &str, now: i64) -> Result<Arc<CertifiedKey>> {
        if let Some(issued) = self.lookup(host, now).await? {
            return Ok(issued.key);
        }

        let issued = self.issue(host).await?;
        self.issued.insert(host.to_string(), issued.clone());

        Ok(issued.key)
    }

    /// Answer the order's HTTP-01 challenges and wait until it is ready
    async fn complete_order(
        &self,
        order: &mut instant_acme::Order,
        tokens: &mut Vec<String>,
    ) -> Result<()> {
        let mut authorizations = order.authorizations();
        while let Some(authz) = authorizations.next().await {
            let mut authz = authz?;
            if matches!(authz.status, AuthorizationStatus::Valid) {
                continue;
            }

            let mut challenge = authz
                .challenge(ChallengeType::Http01)
                .ok_or_else(|| RouterError::Acme("no HTTP-01 challenge offered".into()))?;

            let token = challenge.token.clone();
            let key_authorization = challenge.key_authorization().as_str().to_string();
            self.challenges.insert(token.clone(), key_authorization);
            tokens.push(token);

            challenge.set_ready().await?;
        }

        for _ in 0..ORDER_POLL_ATTEMPTS {
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;

            order.refresh().await?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => {
                    debug!("Order is ready for finalization");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    error!("Order validation failed. Order state: {:?}", order.state());
                    return Err(RouterError::Acme("order validation failed".into()));
                }
                status => debug!("Order status: {:?}", status),
            }
        }

        Err(RouterError::Timeout("ACME challenge validation".into()))
    }
}

#[async_trait::async_trait]
impl CertificateProvisioner for AcmeProvisioner {
    async fn certificate(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>> {
        let Some(host) = server_name.filter(|name| !name.is_empty()) else {
            return Ok(self.fallback.clone());
        };
        let host = host.to_ascii_lowercase();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        if let Some(issued) = self.lookup(&host, now).await? {
            return Ok(issued.key);
        }

        let lock = self
            .locks
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = lock.lock().await;
        let result = self.lookup_or_issue(&host, now).await;

        // later handshakes find the certificate in `issued` or the cache
        self.locks.remove_if(&host, |_, held| Arc::ptr_eq(held, &lock));
        drop(guard);

        result
    }

    fn serves_challenges(&self) -> bool {
        true
    }

    fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|auth| auth.value().clone())
    }
}

/// Parse a cached PEM bundle: private key followed by the certificate chain
fn parse_bundle(bundle: &[u8]) -> Result<IssuedCertificate> {
    let key = PrivateKeyDer::from_pem_slice(bundle)
        .map_err(|e| RouterError::Certificate(format!("invalid private key: {e}")))?;

    let chain = CertificateDer::pem_slice_iter(bundle)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RouterError::Certificate(format!("invalid certificate chain: {e}")))?;

    let leaf = chain
        .first()
        .ok_or_else(|| RouterError::Certificate("bundle has no certificate".into()))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| RouterError::Certificate(format!("invalid leaf certificate: {e}")))?;
    let not_after = cert.validity().not_after.timestamp();

    Ok(IssuedCertificate {
        key: certified_key(chain, &key)?,
        not_after,
    })
}
