//! Host signatures.
//!
//! A signature is the failover plan for one destination, written as a
//! string: hosts of equal preference are separated by `,` and each change
//! to a less preferred group by `:`. `mx1,mx2:mx3` means "try `mx1` and
//! `mx2` in some order, then `mx3`". Two recipients with the same
//! signature can share a connection.
//!
//! Signatures are cached per host field for as long as the DNS answers
//! they were built from; the order inside a group is only decided when a
//! signature is [parsed](HostSignature::parse), so that load spreads over
//! equally preferred exchangers.

use core::fmt::{self, Display, Formatter};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use rand::Rng;
use tern_common::mailer::MailerDescriptor;
use tokio::time::Instant;

use crate::{
    dns::{DnsConfig, DnsError, MxLookup, literal_address},
    error::{DeliveryError, PermanentError, TemporaryError},
};

/// Why no MX set could be found for a host, kept for the final disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFailure {
    /// The name does not exist
    NotFound,
    /// The lookup may succeed later
    Temporary,
}

impl LookupFailure {
    pub fn error(self, host: &str) -> DeliveryError {
        match self {
            Self::NotFound => PermanentError::HostUnknown(host.to_string()).into(),
            Self::Temporary => TemporaryError::DnsLookupFailed(host.to_string()).into(),
        }
    }
}

/// One host to try, with the preference group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    /// Position of the host's preference group, `0` being most preferred
    pub group: usize,
}

/// An ordered candidate list for one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSignature {
    encoded: String,
    /// Hosts whose MX answer was authenticated
    authenticated: AHashSet<String>,
    /// Hosts of the host field whose lookup failed
    failures: AHashMap<String, LookupFailure>,
}

/// Splits `text` at `:` and `,`, leaving bracketed address literals whole.
///
/// Each host comes with the separator that follows it, `None` for the last.
fn tokens(text: &str) -> Vec<(&str, Option<char>)> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut bracketed = false;

    for (at, c) in text.char_indices() {
        match c {
            '[' => bracketed = true,
            ']' => bracketed = false,
            ':' | ',' if !bracketed => {
                tokens.push((text[start..at].trim(), Some(c)));
                start = at + 1;
            }
            _ => {}
        }
    }
    tokens.push((text[start..].trim(), None));

    tokens
}

impl HostSignature {
    /// A signature taken as written, without any lookups
    pub fn literal(text: &str) -> Self {
        Self {
            encoded: text.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Whether the MX answer that named `host` was authenticated, which
    /// makes the host eligible for DANE
    pub fn is_authenticated(&self, host: &str) -> bool {
        self.authenticated.contains(&host.to_ascii_lowercase())
    }

    /// The lookup failure recorded for `host`, if its MX lookup failed
    pub fn failure(&self, host: &str) -> Option<LookupFailure> {
        self.failures.get(&host.to_ascii_lowercase()).copied()
    }

    /// Hosts grouped by preference, most preferred first
    pub fn groups(&self) -> Vec<Vec<&str>> {
        let mut groups = vec![Vec::new()];

        for (host, separator) in tokens(&self.encoded) {
            if !host.is_empty()
                && let Some(group) = groups.last_mut()
            {
                group.push(host);
            }
            if separator == Some(':') {
                groups.push(Vec::new());
            }
        }

        groups.retain(|group| !group.is_empty());
        groups
    }

    /// Derives the order in which to try the hosts.
    ///
    /// Groups keep their order. Inside a group the order is random on
    /// every call, except that hosts for which `prefer` holds (a host with
    /// an open connection, say) always come first.
    pub fn parse(&self, prefer: impl Fn(&str) -> bool) -> Vec<Candidate> {
        let mut rng = rand::rng();
        let mut ranked = self
            .groups()
            .into_iter()
            .enumerate()
            .flat_map(|(group, hosts)| hosts.into_iter().map(move |host| (group, host)))
            .map(|(group, host)| {
                let factor = if prefer(host) {
                    0
                } else {
                    rng.random_range(1..=u32::MAX)
                };
                (group, factor, host)
            })
            .collect::<Vec<_>>();

        ranked.sort_by_key(|(group, factor, _)| (*group, *factor));

        ranked
            .into_iter()
            .map(|(group, _, host)| Candidate {
                host: host.to_string(),
                group,
            })
            .collect()
    }

    /// The part of the plan two signatures agree on.
    ///
    /// Returns the shorter signature when its groups are a prefix of the
    /// other's, so that both destinations can be served by trying just
    /// those hosts; `None` when the plans diverge.
    pub fn common_prefix(&self, other: &Self) -> Option<Self> {
        if self.encoded == other.encoded {
            return Some(self.clone());
        }

        let (ours, theirs) = (self.groups(), other.groups());
        let (shorter, longer, source) = if ours.len() <= theirs.len() {
            (&ours, &theirs, self)
        } else {
            (&theirs, &ours, other)
        };

        let agrees = !shorter.is_empty()
            && shorter.iter().zip(longer.iter()).all(|(a, b)| {
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort_unstable();
                b.sort_unstable();
                a == b
            });

        agrees.then(|| source.clone())
    }
}

impl Display for HostSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

/// `signature` without its authenticated bits unless the caller asked for them
fn hinted(signature: Arc<HostSignature>, auth_hint: bool) -> Arc<HostSignature> {
    if auth_hint || signature.authenticated.is_empty() {
        return signature;
    }

    let mut plain = HostSignature::clone(&signature);
    plain.authenticated.clear();
    Arc::new(plain)
}

#[derive(Debug, Clone)]
struct Cached {
    signature: Arc<HostSignature>,
    expires_at: Instant,
}

/// Builds and caches host signatures.
///
/// Each delivery worker owns its own resolver, so the cache is only kept
/// consistent by TTL.
pub struct HostSignatureResolver {
    lookup: Arc<dyn MxLookup>,
    config: DnsConfig,
    cache: DashMap<(String, String), Cached>,
}

impl core::fmt::Debug for HostSignatureResolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSignatureResolver")
            .field("config", &self.config)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl HostSignatureResolver {
    pub fn new(lookup: Arc<dyn MxLookup>, config: DnsConfig) -> Self {
        Self {
            lookup,
            config,
            cache: DashMap::new(),
        }
    }

    pub fn lookup(&self) -> &Arc<dyn MxLookup> {
        &self.lookup
    }

    /// Number of cached signatures, expired ones included
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// The signature for `host_field` as reached through `mailer`.
    ///
    /// The host field may name several hosts separated by `,` (equally
    /// preferred) or `:` (in order). Each host's MX set is spliced in its
    /// place. A host whose lookup fails stands for itself, with the
    /// failure recorded so that the final disposition can say whether the
    /// host is unknown or only temporarily unresolvable.
    ///
    /// The cache keeps every host's authenticated bit; `auth_hint` decides
    /// whether the returned signature carries them, so a lookup without the
    /// hint never hides them from a later one with it.
    #[tracing::instrument(level = "debug", skip(self, mailer), fields(mailer = %mailer.name))]
    pub async fn resolve(
        &self,
        mailer: &MailerDescriptor,
        host_field: &str,
        auth_hint: bool,
    ) -> Arc<HostSignature> {
        if !mailer.is_network() {
            let host = if host_field.is_empty() {
                "localhost"
            } else {
                host_field
            };
            return Arc::new(HostSignature::literal(host));
        }

        let key = (mailer.name.clone(), host_field.to_ascii_lowercase());
        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Instant::now() {
                tracing::trace!(signature = %cached.signature, "Signature cache hit");
                return hinted(Arc::clone(&cached.signature), auth_hint);
            }
            tracing::trace!("Signature cache entry expired");
        }

        let (signature, ttl) = self.build(mailer, host_field).await;
        let signature = Arc::new(signature);

        let expires_at = Instant::now() + self.config.cache_ttl(ttl);
        self.cache.insert(
            key,
            Cached {
                signature: Arc::clone(&signature),
                expires_at,
            },
        );

        tracing::debug!(%signature, ttl, "Resolved host signature");
        hinted(signature, auth_hint)
    }

    async fn build(&self, mailer: &MailerDescriptor, host_field: &str) -> (HostSignature, u32) {
        let mut signature = HostSignature::default();
        let mut ttl = u32::MAX;
        let mut previous = None;

        for (host, separator) in tokens(host_field) {
            if host.is_empty() {
                continue;
            }
            let host = host.to_ascii_lowercase();

            let piece = if mailer.flags.no_mx || literal_address(&host).is_some() {
                host.clone()
            } else {
                match self.lookup.mx(&host).await {
                    Ok(mut answer) => {
                        ttl = ttl.min(answer.ttl);
                        answer.records.sort_by_key(|record| record.preference);

                        let mut piece = String::new();
                        let mut last = None;
                        for record in &answer.records {
                            let exchanger = record.host.to_ascii_lowercase();
                            match last {
                                None => {}
                                Some(preference) if preference == record.preference => {
                                    piece.push(',');
                                }
                                Some(_) => piece.push(':'),
                            }
                            if answer.authenticated {
                                signature.authenticated.insert(exchanger.clone());
                            }
                            piece.push_str(&exchanger);
                            last = Some(record.preference);
                        }
                        piece
                    }
                    Err(err) => {
                        let failure = if matches!(
                            err,
                            DnsError::DomainNotFound(_) | DnsError::NoMailServers(_)
                        ) {
                            LookupFailure::NotFound
                        } else {
                            LookupFailure::Temporary
                        };
                        tracing::debug!(%host, %err, ?failure, "MX lookup failed, using the host itself");

                        ttl = 0;
                        signature.failures.insert(host.clone(), failure);
                        host.clone()
                    }
                }
            };

            if let Some(separator) = previous {
                signature.encoded.push(separator);
            }
            signature.encoded.push_str(&piece);
            previous = separator;
        }

        if ttl == u32::MAX {
            ttl = 0;
        }

        (signature, ttl)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dns::{StaticFailure, StaticLookup};

    fn resolver(lookup: StaticLookup) -> HostSignatureResolver {
        HostSignatureResolver::new(Arc::new(lookup), DnsConfig::default())
    }

    fn esmtp() -> MailerDescriptor {
        MailerDescriptor::esmtp("esmtp")
    }

    #[test]
    fn groups_respect_brackets() {
        let signature = HostSignature::literal("a,b:[IPv6:2001:db8::1]:c");
        assert_eq!(
            signature.groups(),
            vec![vec!["a", "b"], vec!["[ipv6:2001:db8::1]"], vec!["c"]]
        );
    }

    #[tokio::test]
    async fn mx_sets_are_ordered_by_preference() {
        let resolver = resolver(StaticLookup::new().with_mx(
            "example.com",
            &[("mx3.example.com", 30), ("mx1.example.com", 10), ("mx2.example.com", 10)],
        ));

        let signature = resolver.resolve(&esmtp(), "example.com", false).await;
        assert_eq!(signature.as_str(), "mx1.example.com,mx2.example.com:mx3.example.com");
        assert_eq!(signature.failure("example.com"), None);
    }

    #[tokio::test]
    async fn host_fields_keep_their_separators() {
        let resolver = resolver(
            StaticLookup::new()
                .with_mx("a.test", &[("mx.a.test", 5)])
                .with_mx("b.test", &[("mx1.b.test", 1), ("mx2.b.test", 2)]),
        );

        let signature = resolver.resolve(&esmtp(), "a.test:b.test", false).await;
        assert_eq!(signature.as_str(), "mx.a.test:mx1.b.test:mx2.b.test");

        let signature = resolver.resolve(&esmtp(), "a.test,b.test", false).await;
        assert_eq!(signature.as_str(), "mx.a.test,mx1.b.test:mx2.b.test");
    }

    #[tokio::test]
    async fn failed_lookups_fall_back_to_the_name() {
        let resolver = resolver(
            StaticLookup::new().with_failure("flaky.test", StaticFailure::Timeout),
        );

        let signature = resolver.resolve(&esmtp(), "Nowhere.test", false).await;
        assert_eq!(signature.as_str(), "nowhere.test");
        assert_eq!(signature.failure("nowhere.test"), Some(LookupFailure::NotFound));
        assert_eq!(
            signature.parse(|_| false),
            vec![Candidate {
                host: "nowhere.test".to_string(),
                group: 0,
            }]
        );

        let signature = resolver.resolve(&esmtp(), "flaky.test", false).await;
        assert_eq!(signature.failure("flaky.test"), Some(LookupFailure::Temporary));
        assert!(
            signature
                .failure("flaky.test")
                .unwrap()
                .error("flaky.test")
                .is_temporary()
        );
    }

    #[tokio::test]
    async fn non_mx_mailers_skip_lookups() {
        let resolver = resolver(StaticLookup::new());

        let mut relay = esmtp();
        relay.flags.no_mx = true;
        let signature = resolver.resolve(&relay, "smart.test", false).await;
        assert_eq!(signature.as_str(), "smart.test");
        assert_eq!(signature.failure("smart.test"), None);

        let local = MailerDescriptor::local("local", "/bin/cat", vec![]);
        assert_eq!(resolver.resolve(&local, "", false).await.as_str(), "localhost");
    }

    #[tokio::test]
    async fn authenticated_bits_follow_the_hint() {
        let resolver = resolver(
            StaticLookup::new()
                .with_mx("secure.test", &[("mx.secure.test", 10)])
                .authenticated("secure.test"),
        );

        let signature = resolver.resolve(&esmtp(), "secure.test", true).await;
        assert!(signature.is_authenticated("MX.secure.test"));

        let mut other = esmtp();
        other.name = "other".to_string();
        let signature = resolver.resolve(&other, "secure.test", false).await;
        assert!(!signature.is_authenticated("mx.secure.test"));
    }

    #[tokio::test]
    async fn cached_signatures_keep_authenticated_bits_for_later_hints() {
        let resolver = resolver(
            StaticLookup::new()
                .with_mx("secure.test", &[("mx.secure.test", 10)])
                .authenticated("secure.test"),
        );

        let plain = resolver.resolve(&esmtp(), "secure.test", false).await;
        assert!(!plain.is_authenticated("mx.secure.test"));

        let hinted = resolver.resolve(&esmtp(), "secure.test", true).await;
        assert_eq!(resolver.cached(), 1);
        assert!(hinted.is_authenticated("mx.secure.test"));

        let plain = resolver.resolve(&esmtp(), "secure.test", false).await;
        assert!(!plain.is_authenticated("mx.secure.test"));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let resolver = resolver(
            StaticLookup::new()
                .with_mx("example.com", &[("mx.example.com", 10)])
                .with_ttl(120),
        );

        let first = resolver.resolve(&esmtp(), "example.com", false).await;
        let second = resolver.resolve(&esmtp(), "EXAMPLE.com", false).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.cached(), 1);

        tokio::time::advance(Duration::from_secs(121)).await;
        let third = resolver.resolve(&esmtp(), "example.com", false).await;
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first, third);
    }

    #[test]
    fn preferred_hosts_lead_their_group() {
        let signature = HostSignature::literal("a,b,c:d,e");
        for _ in 0..20 {
            let order = signature.parse(|host| host == "c" || host == "e");
            assert_eq!(order[0].host, "c");
            assert_eq!(order[3].host, "e");
            assert_eq!(order[4].group, 1);
        }
    }

    #[test]
    fn equal_preference_order_varies() {
        let signature = HostSignature::literal("a,b");
        let firsts = (0..200)
            .map(|_| signature.parse(|_| false)[0].host.clone())
            .collect::<AHashSet<_>>();
        assert_eq!(firsts.len(), 2);
    }

    #[test]
    fn prefixes() {
        let full = HostSignature::literal("a,b:c");
        let head = HostSignature::literal("b,a");
        let other = HostSignature::literal("a:c");

        assert_eq!(full.common_prefix(&full), Some(full.clone()));
        assert_eq!(full.common_prefix(&head), Some(head.clone()));
        assert_eq!(head.common_prefix(&full), Some(head));
        assert_eq!(full.common_prefix(&other), None);
        assert_eq!(full.common_prefix(&HostSignature::literal("")), None);
    }

    proptest::proptest! {
        #[test]
        fn parsing_keeps_every_host_in_group_order(
            groups in proptest::collection::vec(
                proptest::collection::btree_set("[a-z]{1,8}", 1..4),
                1..5,
            )
        ) {
            let text = groups
                .iter()
                .map(|group| group.iter().cloned().collect::<Vec<_>>().join(","))
                .collect::<Vec<_>>()
                .join(":");
            let signature = HostSignature::literal(&text);

            let order = signature.parse(|_| false);
            proptest::prop_assert!(order.windows(2).all(|pair| pair[0].group <= pair[1].group));

            let mut seen = order
                .iter()
                .map(|candidate| (candidate.group, candidate.host.clone()))
                .collect::<Vec<_>>();
            seen.sort_unstable();
            let mut expected = groups
                .iter()
                .enumerate()
                .flat_map(|(group, hosts)| hosts.iter().map(move |host| (group, host.clone())))
                .collect::<Vec<_>>();
            expected.sort_unstable();
            proptest::prop_assert_eq!(seen, expected);
        }
    }
}
