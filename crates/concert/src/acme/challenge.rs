//! DNS-01 ACME challenge providers
//!
//! A provider publishes the `_acme-challenge` TXT record the certificate
//! authority looks up, and removes it once the order is settled.
//!
//! Providers are selected by name:
//!
//! - `exec`: runs a hook program as `<program> present|cleanup <fqdn> <value>`
//! - `manual`: logs the record so an operator can publish it

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::error::AcmeError;

/// Environment variable naming the `exec` hook when none is configured
pub const EXEC_PATH_ENV: &str = "EXEC_PATH";

/// Label prepended to the domain for DNS-01 TXT records
pub const DNS01_LABEL: &str = "_acme-challenge";

/// Interval between TXT lookups while waiting for propagation
const PROPAGATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A DNS-01 TXT record to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dns01Record {
    /// Fully qualified record name, with trailing dot
    pub fqdn: String,
    /// Record value (base64url digest of the key authorization)
    pub value: String,
}

impl Dns01Record {
    /// Record for `domain`; wildcard domains share the base name's record
    pub fn new(domain: &str, value: impl Into<String>) -> Self {
        let base = domain.trim_start_matches("*.").trim_end_matches('.');
        Self {
            fqdn: format!("{DNS01_LABEL}.{base}."),
            value: value.into(),
        }
    }
}

/// Publishes and withdraws DNS-01 challenge records
#[async_trait]
pub trait ChallengeProvider: Send + Sync + std::fmt::Debug {
    /// Provider name used in configuration
    fn name(&self) -> &'static str;

    /// Publish the record
    async fn present(&self, domain: &str, record: &Dns01Record) -> Result<(), AcmeError>;

    /// Withdraw the record
    async fn cleanup(&self, domain: &str, record: &Dns01Record) -> Result<(), AcmeError>;
}

/// Look up a provider by its configured name
pub fn provider_by_name(
    name: &str,
    command: Option<&Path>,
) -> Result<Arc<dyn ChallengeProvider>, AcmeError> {
    match name {
        "exec" => {
            let program = command
                .map(Path::to_path_buf)
                .or_else(|| std::env::var_os(EXEC_PATH_ENV).map(PathBuf::from))
                .ok_or_else(|| {
                    AcmeError::Challenge(format!(
                        "exec provider needs challengeCommand or {EXEC_PATH_ENV}"
                    ))
                })?;
            Ok(Arc::new(ExecProvider::new(program)))
        }
        "manual" => Ok(Arc::new(ManualProvider)),
        other => Err(AcmeError::UnknownProvider(other.to_string())),
    }
}

// =========================================================================
// Session
// =========================================================================

/// Records presented for one order, withdrawn together once it settles
///
/// A record is tracked before the provider is asked to publish it, so a
/// publication cut short by the deadline is still withdrawn.
pub struct ChallengeSession {
    provider: Arc<dyn ChallengeProvider>,
    presented: Mutex<Vec<(String, Dns01Record)>>,
}

impl ChallengeSession {
    pub fn new(provider: Arc<dyn ChallengeProvider>) -> Self {
        Self {
            provider,
            presented: Mutex::new(Vec::new()),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Publish a record through the provider
    pub async fn present(&self, domain: &str, record: Dns01Record) -> Result<(), AcmeError> {
        self.presented
            .lock()
            .push((domain.to_string(), record.clone()));
        self.provider.present(domain, &record).await
    }

    /// Records tracked so far
    pub fn records(&self) -> Vec<(String, Dns01Record)> {
        self.presented.lock().clone()
    }

    /// Withdraw every tracked record; failures are logged
    pub async fn cleanup(&self) {
        let records = std::mem::take(&mut *self.presented.lock());
        for (domain, record) in &records {
            if let Err(e) = self.provider.cleanup(domain, record).await {
                warn!(
                    domain = %domain,
                    fqdn = %record.fqdn,
                    error = %e,
                    "Failed to withdraw DNS-01 challenge record"
                );
            }
        }
    }

    /// Run `work` for at most `limit`, then withdraw what it presented
    pub async fn settle<T, F>(&self, domain: &str, limit: Duration, work: F) -> Result<T, AcmeError>
    where
        F: Future<Output = Result<T, AcmeError>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(AcmeError::Timeout {
                domain: domain.to_string(),
                stage: "order",
                elapsed: start.elapsed(),
            }),
        };
        self.cleanup().await;
        result
    }
}

impl std::fmt::Debug for ChallengeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeSession")
            .field("provider", &self.provider.name())
            .field("presented", &self.presented.lock().len())
            .finish()
    }
}

// =========================================================================
// exec
// =========================================================================

/// Delegates record changes to an external program
#[derive(Debug, Clone)]
pub struct ExecProvider {
    program: PathBuf,
}

impl ExecProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, action: &str, record: &Dns01Record) -> Result<(), AcmeError> {
        debug!(
            program = %self.program.display(),
            action = %action,
            fqdn = %record.fqdn,
            "Running challenge hook"
        );

        let output = Command::new(&self.program)
            .arg(action)
            .arg(&record.fqdn)
            .arg(&record.value)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AcmeError::Challenge(format!(
                    "failed to run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(AcmeError::Challenge(format!(
                "{} {} exited with {}: {}",
                self.program.display(),
                action,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        trace!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "Challenge hook finished"
        );
        Ok(())
    }
}

#[async_trait]
impl ChallengeProvider for ExecProvider {
    fn name(&self) -> &'static str {
        "exec"
    }

    async fn present(&self, _domain: &str, record: &Dns01Record) -> Result<(), AcmeError> {
        self.run("present", record).await
    }

    async fn cleanup(&self, _domain: &str, record: &Dns01Record) -> Result<(), AcmeError> {
        self.run("cleanup", record).await
    }
}

// =========================================================================
// manual
// =========================================================================

/// Asks an operator to publish the record
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualProvider;

#[async_trait]
impl ChallengeProvider for ManualProvider {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn present(&self, domain: &str, record: &Dns01Record) -> Result<(), AcmeError> {
        warn!(
            domain = %domain,
            fqdn = %record.fqdn,
            value = %record.value,
            "Publish this TXT record to complete the DNS-01 challenge"
        );
        Ok(())
    }

    async fn cleanup(&self, domain: &str, record: &Dns01Record) -> Result<(), AcmeError> {
        info!(
            domain = %domain,
            fqdn = %record.fqdn,
            "DNS-01 challenge settled, the TXT record can be removed"
        );
        Ok(())
    }
}

// =========================================================================
// Propagation
// =========================================================================

/// Waits until a published TXT record is visible in DNS
pub struct PropagationCheck {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl PropagationCheck {
    pub fn new(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        // Negative answers must not stick while we poll
        opts.cache_size = 0;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            timeout,
        }
    }

    /// Poll until the record carries the expected value or the timeout elapses
    pub async fn wait_for(&self, domain: &str, record: &Dns01Record) -> Result<(), AcmeError> {
        let start = Instant::now();

        loop {
            if self.is_visible(record).await {
                debug!(
                    fqdn = %record.fqdn,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Challenge record propagated"
                );
                return Ok(());
            }

            if start.elapsed() >= self.timeout {
                return Err(AcmeError::Timeout {
                    domain: domain.to_string(),
                    stage: "DNS propagation",
                    elapsed: start.elapsed(),
                });
            }

            trace!(fqdn = %record.fqdn, "Challenge record not visible yet");
            tokio::time::sleep(PROPAGATION_POLL_INTERVAL.min(self.timeout)).await;
        }
    }

    async fn is_visible(&self, record: &Dns01Record) -> bool {
        match self.resolver.txt_lookup(record.fqdn.as_str()).await {
            Ok(lookup) => lookup.iter().any(|txt| {
                txt.txt_data()
                    .iter()
                    .any(|data| data.as_ref() == record.value.as_bytes())
            }),
            Err(e) => {
                trace!(fqdn = %record.fqdn, error = %e, "TXT lookup failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for PropagationCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationCheck")
            .field("timeout", &self.timeout)
            .finish()
    }
}
