//! Delivery configuration.

use std::sync::Arc;

use serde::Deserialize;
use tern_common::{
    MailerDescriptor,
    config::{ClientTimeouts, TlsConfig},
};
use tern_security::sasl::Credentials;

use crate::dns::DnsConfig;

const fn default_max_hops() -> usize {
    25
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

const fn default_max_connections() -> usize {
    16
}

const fn default_max_deliveries() -> usize {
    100
}

const fn default_queue_interval_secs() -> u64 {
    30
}

const fn default_queue_batch() -> usize {
    100
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_mailers() -> Vec<MailerDescriptor> {
    vec![MailerDescriptor::esmtp("esmtp")]
}

/// Limits of the per-worker connection cache
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Open connections kept per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Transactions after which a connection is retired
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Name used in `EHLO`/`LHLO`
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_mailers")]
    pub mailers: Vec<MailerDescriptor>,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub timeouts: ClientTimeouts,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Credentials offered to peers that advertise `AUTH`
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Tried once after every host of a destination has failed
    #[serde(default)]
    pub fallback_host: Option<String>,

    /// Envelopes that have seen more `Received` headers are bounced
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    /// Concurrent delivery workers; defaults to the number of CPUs
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub cache: CacheConfig,

    /// How often the background loop runs the queue
    #[serde(default = "default_queue_interval_secs")]
    pub queue_interval_secs: u64,

    /// Envelopes claimed per queue run
    #[serde(default = "default_queue_batch")]
    pub queue_batch: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            mailers: default_mailers(),
            dns: DnsConfig::default(),
            timeouts: ClientTimeouts::default(),
            tls: TlsConfig::default(),
            credentials: None,
            fallback_host: None,
            max_hops: default_max_hops(),
            workers: default_workers(),
            cache: CacheConfig::default(),
            queue_interval_secs: default_queue_interval_secs(),
            queue_batch: default_queue_batch(),
        }
    }
}

impl DeliveryConfig {
    /// The configured mailers, shared with the router
    pub fn mailers(&self) -> Vec<Arc<MailerDescriptor>> {
        self.mailers.iter().cloned().map(Arc::new).collect()
    }
}
