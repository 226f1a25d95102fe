//! Certificate authority client
//!
//! [`AcmeClient`] wraps `instant-acme` and drives one single-domain order at
//! a time through the DNS-01 challenge flow:
//!
//! 1. Create an order for the domain
//! 2. Publish the `_acme-challenge` TXT record through the challenge provider
//! 3. Optionally wait until the record is visible in DNS
//! 4. Tell the CA the challenge is ready and poll the order
//! 5. Finalize with a freshly generated key and CSR
//! 6. Download the certificate chain
//!
//! Published records are withdrawn on every exit path once they were
//! presented.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::challenge::{ChallengeProvider, ChallengeSession, Dns01Record, PropagationCheck};
use super::error::AcmeError;
use crate::identity::{AccountKey, IdentityRecord, KeyKind, Registration};

/// Shortest interval between order status polls
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Longest interval between order status polls
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Time kept back from an issuance bound for withdrawing challenge records
pub const CLEANUP_MARGIN: Duration = Duration::from_secs(30);

/// Default bound on an order, the budget of a 10 minute issuance
pub const DEFAULT_ORDER_TIMEOUT: Duration = Duration::from_secs(570);

/// Order bound for an issuance limited to `issue_timeout`
///
/// Always strictly below `issue_timeout`, leaving room to withdraw the
/// challenge records before the caller gives up.
pub fn order_budget(issue_timeout: Duration) -> Duration {
    if issue_timeout > CLEANUP_MARGIN * 2 {
        issue_timeout - CLEANUP_MARGIN
    } else {
        issue_timeout / 2
    }
}

/// A certificate freshly issued for one domain
#[derive(Clone)]
pub struct IssuedCertificate {
    pub domain: String,
    /// PEM private key of the certificate
    pub private_key_pem: Vec<u8>,
    /// PEM chain, leaf first
    pub certificate_pem: Vec<u8>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("domain", &self.domain)
            .field("private_key_pem", &"<redacted>")
            .field("certificate_pem_len", &self.certificate_pem.len())
            .finish()
    }
}

/// Outcome of a successful registration
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub registration: Registration,
    /// Key the account was registered with
    pub account_key: AccountKey,
}

/// An ACME-speaking certificate authority
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Register the account described by `identity`
    async fn register(&self, identity: &IdentityRecord) -> Result<Enrollment, AcmeError>;

    /// Continue using the registration `identity` carries
    async fn resume(&self, _identity: &IdentityRecord) -> Result<(), AcmeError> {
        Ok(())
    }

    /// Obtain a certificate for a single domain
    async fn obtain(&self, domain: &str) -> Result<IssuedCertificate, AcmeError>;
}

/// Account key held in serialized `instant-acme` credentials
fn credentials_key(credentials: &serde_json::Value) -> Result<AccountKey, AcmeError> {
    let encoded = credentials
        .get("key_pkcs8")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| AcmeError::Credentials("account credentials carry no key".to_string()))?;
    let der = URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| STANDARD.decode(encoded))
        .map_err(|e| AcmeError::Credentials(format!("account key encoding: {e}")))?;
    AccountKey::decode(KeyKind::Ecdsa, &der).map_err(|e| AcmeError::Credentials(e.to_string()))
}

/// `instant-acme` backed certificate authority using DNS-01 challenges
pub struct AcmeClient {
    directory_url: String,
    provider: Arc<dyn ChallengeProvider>,
    propagation: Option<PropagationCheck>,
    order_timeout: Duration,
    account: RwLock<Option<Account>>,
}

impl AcmeClient {
    pub fn new(directory_url: impl Into<String>, provider: Arc<dyn ChallengeProvider>) -> Self {
        Self {
            directory_url: directory_url.into(),
            provider,
            propagation: None,
            order_timeout: DEFAULT_ORDER_TIMEOUT,
            account: RwLock::new(None),
        }
    }

    /// Wait for challenge records to show up in DNS before answering
    pub fn with_propagation_check(mut self, check: PropagationCheck) -> Self {
        self.propagation = Some(check);
        self
    }

    /// Bound each order, from creation to chain download
    pub fn with_order_timeout(mut self, timeout: Duration) -> Self {
        self.order_timeout = timeout;
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub fn is_registered(&self) -> bool {
        self.account.read().is_some()
    }

    fn account(&self) -> Result<Account, AcmeError> {
        self.account.read().clone().ok_or(AcmeError::NotRegistered)
    }

    fn timed_out(&self, domain: &str, stage: &'static str, start: Instant) -> Option<AcmeError> {
        (start.elapsed() >= self.order_timeout).then(|| AcmeError::Timeout {
            domain: domain.to_string(),
            stage,
            elapsed: start.elapsed(),
        })
    }

    /// Publish the DNS-01 records of every pending authorization and mark
    /// them ready
    async fn answer_challenges(
        &self,
        domain: &str,
        order: &mut Order,
        session: &ChallengeSession,
    ) -> Result<(), AcmeError> {
        let authorizations = order.authorizations().await?;
        let mut ready = Vec::new();

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                trace!(domain = %domain, "Authorization already valid");
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::NoDnsChallenge(domain.to_string()))?;

            let record = Dns01Record::new(domain, order.key_authorization(challenge).dns_value());
            let fqdn = record.fqdn.clone();
            session.present(domain, record).await?;
            debug!(
                domain = %domain,
                fqdn = %fqdn,
                provider = session.provider_name(),
                "Presented DNS-01 challenge record"
            );
            ready.push(challenge.url.clone());
        }

        if let Some(check) = &self.propagation {
            for (name, record) in session.records() {
                check.wait_for(&name, &record).await?;
            }
        }

        for url in &ready {
            order.set_challenge_ready(url).await?;
        }

        Ok(())
    }

    /// Poll until the order leaves the pending and processing states
    async fn wait_for_order(
        &self,
        domain: &str,
        order: &mut Order,
        start: Instant,
    ) -> Result<OrderStatus, AcmeError> {
        let mut delay = MIN_POLL_INTERVAL;

        loop {
            let state = order.refresh().await?;
            trace!(domain = %domain, status = ?state.status, "Order status");

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(state.status),
                OrderStatus::Invalid => {
                    let reason = state
                        .error
                        .as_ref()
                        .map(|problem| format!("{problem:?}"))
                        .unwrap_or_else(|| "no problem document".to_string());
                    return Err(AcmeError::OrderInvalid {
                        domain: domain.to_string(),
                        reason,
                    });
                }
                OrderStatus::Pending | OrderStatus::Processing => {}
            }

            if let Some(e) = self.timed_out(domain, "challenge validation", start) {
                return Err(e);
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Create the order and drive it to a downloaded chain
    async fn run_order(
        &self,
        domain: &str,
        account: &Account,
        session: &ChallengeSession,
        start: Instant,
    ) -> Result<IssuedCertificate, AcmeError> {
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        debug!(domain = %domain, status = ?order.state().status, "Created ACME order");

        if order.state().status == OrderStatus::Pending {
            self.answer_challenges(domain, &mut order, session).await?;
        }
        let status = self.wait_for_order(domain, &mut order, start).await?;

        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key_pair)?;

        if status != OrderStatus::Valid {
            order.finalize(csr.der()).await?;
            debug!(domain = %domain, "Order finalized, waiting for certificate");
        }

        let mut delay = MIN_POLL_INTERVAL;
        let chain = loop {
            if let Some(chain) = order.certificate().await? {
                break chain;
            }
            if let Some(e) = self.timed_out(domain, "certificate download", start) {
                return Err(e);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        };

        Ok(IssuedCertificate {
            domain: domain.to_string(),
            private_key_pem: key_pair.serialize_pem().into_bytes(),
            certificate_pem: chain.into_bytes(),
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    async fn register(&self, identity: &IdentityRecord) -> Result<Enrollment, AcmeError> {
        let contact = format!("mailto:{}", identity.email());
        let contact_refs: &[&str] = &[&contact];
        let new_account = NewAccount {
            contact: contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        info!(
            email = %identity.email(),
            directory = %self.directory_url,
            "Registering ACME account"
        );

        let (account, credentials) =
            Account::create(&new_account, &self.directory_url, None).await?;

        let uri = account.id().to_string();
        let credentials = serde_json::to_value(&credentials)
            .map_err(|e| AcmeError::Credentials(e.to_string()))?;
        let account_key = credentials_key(&credentials)?;
        *self.account.write() = Some(account);

        info!(account = %uri, "ACME account registered");
        Ok(Enrollment {
            registration: Registration {
                uri,
                body: serde_json::json!({
                    "status": "valid",
                    "contact": [contact],
                    "termsOfServiceAgreed": true,
                }),
                credentials: Some(credentials),
            },
            account_key,
        })
    }

    async fn resume(&self, identity: &IdentityRecord) -> Result<(), AcmeError> {
        let registration = identity.registration().ok_or(AcmeError::NotRegistered)?;
        let value = registration.credentials.clone().ok_or_else(|| {
            AcmeError::Credentials(format!(
                "registration {} carries no account credentials",
                registration.uri
            ))
        })?;

        if &credentials_key(&value)? != identity.key() {
            return Err(AcmeError::Credentials(format!(
                "registration {} was made with a different account key",
                registration.uri
            )));
        }

        let credentials: AccountCredentials = serde_json::from_value(value)
            .map_err(|e| AcmeError::Credentials(e.to_string()))?;

        let account = Account::from_credentials(credentials).await?;
        *self.account.write() = Some(account);

        debug!(account = %registration.uri, "Resumed ACME account");
        Ok(())
    }

    async fn obtain(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        let account = self.account()?;
        let start = Instant::now();
        let session = ChallengeSession::new(self.provider.clone());

        let result = session
            .settle(
                domain,
                self.order_timeout,
                self.run_order(domain, &account, &session, start),
            )
            .await;

        if result.is_ok() {
            info!(domain = %domain, "Certificate issued");
        }
        result
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("provider", &self.provider.name())
            .field("propagation", &self.propagation)
            .field("order_timeout", &self.order_timeout)
            .field("registered", &self.is_registered())
            .finish()
    }
}
