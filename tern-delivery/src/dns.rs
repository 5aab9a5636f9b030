//! DNS lookups for mail delivery.
//!
//! Delivery only needs three questions answered: the MX set of a domain
//! (with its TTL and whether the answer was authenticated), the TLSA
//! records of a host, and the addresses of a host. [`MxLookup`] is that
//! contract; [`HickoryLookup`] answers it from the network and
//! [`StaticLookup`] from a fixed table.
//!
//! Caching happens one level up, on whole host signatures.

use std::{
    net::{IpAddr, Ipv6Addr},
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use hickory_resolver::{
    TokioResolver,
    config::ResolverOpts,
    name_server::TokioConnectionProvider,
    proto::rr::{RData, RecordType},
};
use serde::Deserialize;
use tern_security::TlsaRecord;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

impl DnsError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }
}

/// Configuration for DNS resolution and the signature cache.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Cache TTL override in seconds.
    /// If set, overrides the DNS record's TTL for all cached signatures
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Minimum cache TTL in seconds (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,

    /// Zones whose answers are trusted as DNSSEC authenticated, making
    /// their hosts eligible for DANE
    #[serde(default)]
    pub authenticated_zones: Vec<String>,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
            authenticated_zones: Vec::new(),
        }
    }
}

impl DnsConfig {
    /// How long a lookup result stays cached
    pub fn cache_ttl(&self, dns_ttl: u32) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(self.min_cache_ttl_secs, self.max_cache_ttl_secs)
        }))
    }

    fn is_authenticated(&self, domain: &str) -> bool {
        in_zones(&self.authenticated_zones, domain)
    }
}

fn in_zones<'a>(zones: impl IntoIterator<Item = &'a String>, domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    zones.into_iter().any(|zone| {
        let zone = zone.trim_end_matches('.');
        domain.eq_ignore_ascii_case(zone)
            || domain
                .len()
                .checked_sub(zone.len() + 1)
                .and_then(|at| domain.get(at..))
                .is_some_and(|tail| {
                    tail.starts_with('.') && tail[1..].eq_ignore_ascii_case(zone)
                })
    })
}

/// One exchanger of an MX set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    /// Lower values are tried first
    pub preference: u16,
}

impl MxRecord {
    pub fn new(host: impl Into<String>, preference: u16) -> Self {
        Self {
            host: host.into(),
            preference,
        }
    }
}

/// The answer to an MX query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxAnswer {
    /// Exchangers, unsorted
    pub records: Vec<MxRecord>,
    /// Smallest TTL of the answer
    pub ttl: u32,
    /// Whether the answer was DNSSEC authenticated
    pub authenticated: bool,
}

/// The DNS questions delivery asks.
#[async_trait]
pub trait MxLookup: Send + Sync {
    /// The MX set of `domain`.
    ///
    /// A domain without MX records but with an address answers with an
    /// implicit MX naming itself at preference 0.
    async fn mx(&self, domain: &str) -> Result<MxAnswer, DnsError>;

    /// The TLSA records published for `host` on `port`
    async fn tlsa(&self, host: &str, port: u16) -> Result<Vec<TlsaRecord>, DnsError>;

    /// The addresses of `host`, in the order they should be tried
    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Parses an address literal such as `[192.0.2.1]` or `[IPv6:2001:db8::1]`
pub fn literal_address(host: &str) -> Option<IpAddr> {
    let inner = host.strip_prefix('[')?.strip_suffix(']')?;
    match inner.get(..5) {
        Some(tag) if tag.eq_ignore_ascii_case("IPv6:") => {
            inner[5..].parse::<Ipv6Addr>().ok().map(IpAddr::V6)
        }
        _ => inner.parse().ok(),
    }
}

/// Lookups over the system's configured name servers.
#[derive(Debug)]
pub struct HickoryLookup {
    resolver: TokioResolver,
    config: DnsConfig,
}

impl HickoryLookup {
    /// Creates a lookup using the system resolver configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver, config })
    }

    /// Checks for A/AAAA records when there is no MX (RFC 5321 section 5.1)
    async fn implicit_mx(&self, domain: &str) -> Result<MxAnswer, DnsError> {
        debug!("No MX records for {domain}, trying A/AAAA");

        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                #[allow(clippy::redundant_closure_for_method_calls)]
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(|r| r.ttl())
                    .min()
                    .unwrap_or(300);

                if lookup.iter().next().is_none() {
                    return Err(DnsError::NoMailServers(domain.to_string()));
                }

                Ok(MxAnswer {
                    records: vec![MxRecord::new(domain, 0)],
                    ttl,
                    authenticated: self.config.is_authenticated(domain),
                })
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                warn!("A/AAAA lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }
}

#[async_trait]
impl MxLookup for HickoryLookup {
    async fn mx(&self, domain: &str) -> Result<MxAnswer, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                #[allow(clippy::redundant_closure_for_method_calls)]
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(|r| r.ttl())
                    .min()
                    .unwrap_or(300);

                let records = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        MxRecord::new(host.trim_end_matches('.'), mx.preference())
                    })
                    .collect::<Vec<_>>();

                if records.is_empty() {
                    return self.implicit_mx(domain).await;
                }

                debug!("Resolved {} MX record(s) for {domain} with TTL {ttl}s", records.len());
                Ok(MxAnswer {
                    records,
                    ttl,
                    authenticated: self.config.is_authenticated(domain),
                })
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => self.implicit_mx(domain).await,
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    async fn tlsa(&self, host: &str, port: u16) -> Result<Vec<TlsaRecord>, DnsError> {
        let name = format!("_{port}._tcp.{host}");

        match self.resolver.lookup(name.as_str(), RecordType::TLSA).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|data| match data {
                    RData::TLSA(tlsa) => Some(TlsaRecord::new(
                        u8::from(tlsa.cert_usage()),
                        u8::from(tlsa.selector()),
                        u8::from(tlsa.matching()),
                        tlsa.cert_data().to_vec(),
                    )),
                    _ => None,
                })
                .collect()),
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => Ok(Vec::new()),
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Some(address) = literal_address(host).or_else(|| host.parse().ok()) {
            return Ok(vec![address]);
        }

        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let addresses = lookup.iter().collect::<Vec<_>>();
                if addresses.is_empty() {
                    Err(DnsError::NoMailServers(host.to_string()))
                } else {
                    Ok(addresses)
                }
            }
            Err(err) if err.is_nx_domain() || err.is_no_records_found() => {
                Err(DnsError::DomainNotFound(host.to_string()))
            }
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}

/// How a [`StaticLookup`] entry fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticFailure {
    NotFound,
    Timeout,
}

impl StaticFailure {
    fn error(self, name: &str) -> DnsError {
        match self {
            Self::NotFound => DnsError::DomainNotFound(name.to_string()),
            Self::Timeout => DnsError::Timeout(name.to_string()),
        }
    }
}

/// A fixed table of answers.
///
/// Names that are not in the table do not exist. Useful for tests and for
/// deployments that route everything through known hosts.
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    mx: AHashMap<String, Vec<MxRecord>>,
    addresses: AHashMap<String, Vec<IpAddr>>,
    tlsa: AHashMap<String, Vec<TlsaRecord>>,
    failures: AHashMap<String, StaticFailure>,
    authenticated: AHashSet<String>,
    ttl: u32,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self {
            ttl: 300,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mx(mut self, domain: &str, records: &[(&str, u16)]) -> Self {
        self.mx.insert(
            domain.to_ascii_lowercase(),
            records
                .iter()
                .map(|(host, preference)| MxRecord::new(*host, *preference))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn with_address(mut self, host: &str, address: IpAddr) -> Self {
        self.addresses
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(address);
        self
    }

    #[must_use]
    pub fn with_tlsa(mut self, host: &str, records: Vec<TlsaRecord>) -> Self {
        self.tlsa.insert(host.to_ascii_lowercase(), records);
        self
    }

    #[must_use]
    pub fn with_failure(mut self, name: &str, failure: StaticFailure) -> Self {
        self.failures.insert(name.to_ascii_lowercase(), failure);
        self
    }

    /// Marks the MX answer for `domain` as authenticated
    #[must_use]
    pub fn authenticated(mut self, domain: &str) -> Self {
        self.authenticated.insert(domain.to_ascii_lowercase());
        self
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl MxLookup for StaticLookup {
    async fn mx(&self, domain: &str) -> Result<MxAnswer, DnsError> {
        let key = domain.to_ascii_lowercase();
        if let Some(failure) = self.failures.get(&key) {
            return Err(failure.error(domain));
        }

        let records = match self.mx.get(&key) {
            Some(records) => records.clone(),
            None if self.addresses.contains_key(&key) => vec![MxRecord::new(domain, 0)],
            None => return Err(DnsError::DomainNotFound(domain.to_string())),
        };

        Ok(MxAnswer {
            records,
            ttl: self.ttl,
            authenticated: self.authenticated.contains(&key),
        })
    }

    async fn tlsa(&self, host: &str, _port: u16) -> Result<Vec<TlsaRecord>, DnsError> {
        Ok(self
            .tlsa
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Some(address) = literal_address(host).or_else(|| host.parse().ok()) {
            return Ok(vec![address]);
        }

        let key = host.to_ascii_lowercase();
        if let Some(failure) = self.failures.get(&key) {
            return Err(failure.error(host));
        }

        self.addresses
            .get(&key)
            .cloned()
            .ok_or_else(|| DnsError::DomainNotFound(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn mx_lookup_gmail() {
        let lookup = HickoryLookup::new(DnsConfig::default()).unwrap();
        let answer = lookup.mx("gmail.com").await.unwrap();

        assert!(!answer.records.is_empty());
        assert!(!answer.authenticated);
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn domain_not_found() {
        let lookup = HickoryLookup::new(DnsConfig::default()).unwrap();
        let result = lookup
            .mx("this-domain-definitely-does-not-exist-12345.com")
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn dns_error_is_temporary() {
        assert!(DnsError::Timeout("example.com".to_string()).is_temporary());
        assert!(!DnsError::NoMailServers("example.com".to_string()).is_temporary());
        assert!(!DnsError::DomainNotFound("example.com".to_string()).is_temporary());
    }

    #[test]
    fn cache_ttl_is_bounded() {
        let config = DnsConfig::default();
        assert_eq!(config.cache_ttl(5), Duration::from_secs(60));
        assert_eq!(config.cache_ttl(600), Duration::from_secs(600));
        assert_eq!(config.cache_ttl(86_400), Duration::from_secs(3600));

        let config = DnsConfig {
            cache_ttl_secs: Some(1),
            ..DnsConfig::default()
        };
        assert_eq!(config.cache_ttl(600), Duration::from_secs(1));
    }

    #[test]
    fn authenticated_zones_match_subdomains() {
        let config = DnsConfig {
            authenticated_zones: vec!["secure.test.".to_string()],
            ..DnsConfig::default()
        };
        assert!(config.is_authenticated("secure.test"));
        assert!(config.is_authenticated("mx.SECURE.test"));
        assert!(!config.is_authenticated("insecure.test"));
        assert!(!config.is_authenticated("test"));
    }

    #[test]
    fn address_literals() {
        assert_eq!(
            literal_address("[192.0.2.1]"),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
        assert_eq!(
            literal_address("[IPv6:::1]"),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(literal_address("192.0.2.1"), None);
        assert_eq!(literal_address("[mx.example.com]"), None);
    }

    #[tokio::test]
    async fn static_answers() {
        let lookup = StaticLookup::new()
            .with_mx("example.com", &[("mx2.example.com", 20), ("mx1.example.com", 10)])
            .with_address("bare.example.com", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_failure("flaky.example.com", StaticFailure::Timeout)
            .authenticated("example.com");

        let answer = lookup.mx("Example.COM").await.unwrap();
        assert_eq!(answer.records.len(), 2);
        assert!(answer.authenticated);

        let implicit = lookup.mx("bare.example.com").await.unwrap();
        assert_eq!(implicit.records, vec![MxRecord::new("bare.example.com", 0)]);
        assert!(!implicit.authenticated);

        assert!(lookup.mx("flaky.example.com").await.unwrap_err().is_temporary());
        assert!(matches!(
            lookup.mx("nx.example.com").await,
            Err(DnsError::DomainNotFound(_))
        ));
        assert_eq!(
            lookup.addresses("[127.0.0.1]").await.unwrap(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );
    }
}
