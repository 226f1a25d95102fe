//! Domain demand derived from catalog tags
//!
//! A service asks for a certificate by carrying a `concert-<domain>` tag.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::kv::ServiceMap;

/// Tag prefix marking a demanded domain
pub const TAG_PREFIX: &str = "concert-";

/// Set of domains that currently need a valid certificate
pub type DomainSet = BTreeSet<String>;

/// Extract the demanded domain from a single tag
pub fn domain_from_tag(tag: &str) -> Option<&str> {
    tag.strip_prefix(TAG_PREFIX).filter(|domain| !domain.is_empty())
}

/// Collect the domains demanded by all services
///
/// Domains requested by several services collapse into one entry; which
/// service asked for a domain is not retained.
pub fn select_domains<'a, I, T>(services: I) -> DomainSet
where
    I: IntoIterator<Item = (&'a String, T)>,
    T: IntoIterator<Item = &'a String>,
{
    let mut domains = DomainSet::new();

    for (service, tags) in services {
        for tag in tags {
            match domain_from_tag(tag) {
                Some(domain) => {
                    trace!(service = %service, domain = %domain, "Service demands domain");
                    domains.insert(domain.to_string());
                }
                None if tag.starts_with(TAG_PREFIX) => {
                    debug!(service = %service, tag = %tag, "Ignoring tag without a domain");
                }
                None => {}
            }
        }
    }

    domains
}

/// Convenience wrapper over a catalog snapshot
pub fn select_from_catalog(services: &ServiceMap) -> DomainSet {
    select_domains(services.iter())
}
