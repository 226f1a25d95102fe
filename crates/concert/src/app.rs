//! Application wiring
//!
//! [`Concert`] connects the backend, settles the account identity and
//! registration, and assembles the reconcile engine and its triggers.

use std::sync::Arc;

use concert_config::ConcertConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::acme::{
    order_budget, provider_by_name, AcmeClient, AcmeError, CertificateAuthority, CertificateStore,
    IdentityStore, PropagationCheck, StorageError,
};
use crate::identity::IdentityRecord;
use crate::kv::{ConsulClient, KeyValueStore, KvError, ServiceCatalog};
use crate::reconcile::ReconcileEngine;
use crate::scheduler::ReconcileScheduler;

/// Failures that prevent the process from starting
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to set up the Consul client: {0}")]
    Backend(#[from] KvError),

    #[error("failed to load or create the account identity: {0}")]
    Identity(#[source] StorageError),

    #[error("failed to persist the account registration: {0}")]
    Persist(#[source] StorageError),

    #[error("failed to set up the challenge provider: {0}")]
    Provider(#[source] AcmeError),

    #[error("account registration failed: {0}")]
    Registration(#[source] AcmeError),
}

/// Make sure `identity` is registered with the certificate authority
///
/// An unregistered identity is registered, and the handle and the key the
/// account was registered with are attached and persisted. A registered one
/// is handed back to the authority to resume.
pub async fn ensure_registered(
    identities: &IdentityStore,
    authority: &dyn CertificateAuthority,
    mut identity: IdentityRecord,
) -> Result<IdentityRecord, StartupError> {
    if let Some(registration) = identity.registration() {
        debug!(account = %registration.uri, "Account already registered");
        authority
            .resume(&identity)
            .await
            .map_err(StartupError::Registration)?;
        return Ok(identity);
    }

    let enrollment = authority
        .register(&identity)
        .await
        .map_err(StartupError::Registration)?;
    info!(
        account = %enrollment.registration.uri,
        email = %identity.email(),
        "Account registered"
    );

    identity.attach_registration(enrollment.registration, enrollment.account_key);
    identities
        .save(&identity)
        .await
        .map_err(StartupError::Persist)?;
    Ok(identity)
}

/// A fully assembled reconciler
pub struct Concert {
    identity: IdentityRecord,
    engine: Arc<ReconcileEngine>,
    scheduler: Arc<ReconcileScheduler>,
    shutdown: CancellationToken,
}

impl Concert {
    /// Build everything from configuration, talking to Consul and the CA
    pub async fn bootstrap(
        config: &ConcertConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, StartupError> {
        let consul = Arc::new(
            ConsulClient::new(&config.consul_address, config.effective_consul_token())?
                .with_wait(config.watch_wait),
        );
        info!(address = %consul.address(), "Using Consul backend");

        let provider = provider_by_name(
            &config.dns01_provider_name,
            config.challenge_command.as_deref(),
        )
        .map_err(StartupError::Provider)?;

        let mut client = AcmeClient::new(config.ca_dir.as_str(), provider)
            .with_order_timeout(order_budget(config.issue_timeout));
        if !config.propagation_timeout.is_zero() {
            client = client.with_propagation_check(PropagationCheck::new(config.propagation_timeout));
        }

        Self::assemble(config, consul.clone(), consul, Arc::new(client), shutdown).await
    }

    /// Build from explicit backends and authority
    pub async fn assemble(
        config: &ConcertConfig,
        kv: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn ServiceCatalog>,
        authority: Arc<dyn CertificateAuthority>,
        shutdown: CancellationToken,
    ) -> Result<Self, StartupError> {
        let identities = IdentityStore::new(kv.clone(), config.account_store_key.as_str());
        let identity = identities
            .load_or_create(&config.account_email)
            .await
            .map_err(StartupError::Identity)?;
        let identity = ensure_registered(&identities, authority.as_ref(), identity).await?;

        let engine = Arc::new(ReconcileEngine::new(
            authority,
            CertificateStore::new(kv, &config.cert_store_key),
            config.renewal_ttl,
            config.issue_timeout,
        ));
        let scheduler = Arc::new(ReconcileScheduler::new(
            engine.clone(),
            catalog,
            config.reconcile_interval,
            shutdown.clone(),
        ));

        info!(
            email = %identity.email(),
            directory = %config.ca_dir,
            cert_prefix = %config.cert_store_key,
            renewal_ttl_hours = config.renewal_ttl.as_secs() / 3600,
            "Concert assembled"
        );

        Ok(Self {
            identity,
            engine,
            scheduler,
            shutdown,
        })
    }

    pub fn identity(&self) -> &IdentityRecord {
        &self.identity
    }

    pub fn engine(&self) -> &Arc<ReconcileEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<ReconcileScheduler> {
        &self.scheduler
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the reconcile triggers until the shutdown token fires
    pub async fn run(self) {
        self.scheduler.clone().run().await;
    }
}

impl std::fmt::Debug for Concert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Concert")
            .field("email", &self.identity.email())
            .field("engine", &self.engine)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
