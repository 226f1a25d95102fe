//! Configuration for the Concert certificate reconciler
//!
//! Concert reads a single YAML file. Key names follow the camel-cased layout of
//! existing deployments (`consulAddress`, `CADir`, `renewalTTL`, ...), and all
//! durations are human-readable strings such as `720h`, `1h30m` or `90s`.
//!
//! # Example
//!
//! ```yaml
//! consulAddress: 127.0.0.1:8500
//! accountStoreKey: concert/account
//! accountEmail: ops@example.com
//! CADir: https://acme-staging-v02.api.letsencrypt.org/directory
//! DNS01ProviderName: exec
//! challengeCommand: /usr/local/bin/update-dns
//! certStoreKey: concert/certs
//! renewalTTL: 720h
//! reconcileInterval: 1h
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use validator::{Validate, ValidationError, ValidationErrors};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Environment variable consulted when no Consul ACL token is configured
pub const CONSUL_TOKEN_ENV: &str = "CONSUL_HTTP_TOKEN";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
}

/// Root configuration of the reconciler
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConcertConfig {
    /// Consul HTTP address, with or without scheme
    #[serde(default = "default_consul_address")]
    #[validate(length(min = 1))]
    pub consul_address: String,

    /// Consul ACL token; falls back to `CONSUL_HTTP_TOKEN`
    #[serde(default)]
    pub consul_token: Option<String>,

    /// KV key holding the serialized ACME account
    #[serde(default = "default_account_store_key")]
    #[validate(length(min = 1))]
    pub account_store_key: String,

    /// Contact email registered with the certificate authority
    #[validate(email)]
    pub account_email: String,

    /// ACME directory URL
    #[serde(rename = "CADir", default = "default_ca_dir")]
    #[validate(url)]
    pub ca_dir: String,

    /// Name of the DNS-01 challenge provider
    #[serde(rename = "DNS01ProviderName")]
    #[validate(length(min = 1))]
    pub dns01_provider_name: String,

    /// Hook program for the `exec` challenge provider
    #[serde(default)]
    pub challenge_command: Option<PathBuf>,

    /// KV prefix under which certificates and keys are stored
    #[serde(default = "default_cert_store_key")]
    #[validate(length(min = 1))]
    pub cert_store_key: String,

    /// Renew once less than this much validity remains
    #[serde(rename = "renewalTTL", default = "default_renewal_ttl", with = "duration_str")]
    pub renewal_ttl: Duration,

    /// Period of the timer-driven reconcile pass
    #[serde(default = "default_reconcile_interval", with = "duration_str")]
    #[validate(custom(function = "validate_positive"))]
    pub reconcile_interval: Duration,

    /// Upper bound for a single certificate issuance
    #[serde(default = "default_issue_timeout", with = "duration_str")]
    #[validate(custom(function = "validate_positive"))]
    pub issue_timeout: Duration,

    /// How long to wait for the challenge TXT record to become visible; zero disables the check
    #[serde(default = "default_propagation_timeout", with = "duration_str")]
    pub propagation_timeout: Duration,

    /// Maximum duration of one blocking catalog query
    #[serde(default = "default_watch_wait", with = "duration_str")]
    #[validate(custom(function = "validate_positive"))]
    pub watch_wait: Duration,
}

fn default_consul_address() -> String {
    "127.0.0.1:8500".to_string()
}

fn default_account_store_key() -> String {
    "concert/account".to_string()
}

fn default_ca_dir() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_cert_store_key() -> String {
    "concert/certs".to_string()
}

fn default_renewal_ttl() -> Duration {
    Duration::from_secs(720 * 3600)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_issue_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_propagation_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_watch_wait() -> Duration {
    Duration::from_secs(300)
}

fn validate_positive(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

impl ConcertConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML document
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;

        trace!(
            consul_address = %config.consul_address,
            ca_dir = %config.ca_dir,
            provider = %config.dns01_provider_name,
            renewal_ttl = %humantime::format_duration(config.renewal_ttl),
            reconcile_interval = %humantime::format_duration(config.reconcile_interval),
            "Parsed configuration"
        );

        Ok(config)
    }

    /// Consul ACL token from the file or, failing that, the environment
    pub fn effective_consul_token(&self) -> Option<String> {
        self.consul_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var(CONSUL_TOKEN_ENV).ok().filter(|t| !t.is_empty()))
    }
}

/// Serde adapter for human-readable durations
mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(de::Error::custom)
    }
}
