//! Outbound delivery for tern.
//!
//! This crate provides:
//! - Host signatures: the ordered MX host list of a destination, cached with
//!   its DNS TTL
//! - The delivery engine: recipient batching, MX failover, SMTP/LMTP
//!   transactions, local program and file mailers
//! - A connection cache reusing open sessions between transactions
//! - Recipient dispositions with enhanced status codes
//! - A worker pool running the queue, one task per destination

pub mod config;
pub mod connection_cache;
pub mod dns;
mod engine;
pub mod error;
pub mod formatter;
pub mod signature;
pub mod worker;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tern_common::{
    Envelope, Signal, internal,
    traits::{DeliveryHandoff, QueueRunner, QueueStore},
};
use tern_security::ClientTlsContext;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};

pub use self::{
    config::{CacheConfig, DeliveryConfig},
    connection_cache::{CachedConnection, ConnectionCache, ConnectionContext, Phase},
    dns::{DnsConfig, DnsError, HickoryLookup, MxLookup, StaticLookup},
    engine::{Batch, DeliveryEngine},
    error::{DeliveryError, PermanentError, SystemError, TemporaryError},
    formatter::ErrorResponseFormatter,
    signature::{HostSignature, HostSignatureResolver},
    worker::{RunSummary, WorkerPool},
};

/// Pending `ETRN` requests beyond this are refused
const RUN_REQUESTS: usize = 32;

/// The delivery side of the MTA.
///
/// Hands accepted envelopes straight to an engine ([`DeliveryHandoff`]),
/// runs the queue on a timer and on request ([`QueueRunner`]).
pub struct Delivery {
    config: Arc<DeliveryConfig>,
    pool: WorkerPool,
    /// Engines not currently delivering, with their warm caches
    idle: tokio::sync::Mutex<Vec<DeliveryEngine>>,
    requests: mpsc::Sender<String>,
    pending: Mutex<Option<mpsc::Receiver<String>>>,
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(
        config: DeliveryConfig,
        lookup: Arc<dyn MxLookup>,
        formatter: ErrorResponseFormatter,
    ) -> Self {
        let config = Arc::new(config);
        let tls = Arc::new(ClientTlsContext::new(&config.tls));
        let pool = WorkerPool::new(Arc::clone(&config), lookup, tls, formatter);
        let (requests, pending) = mpsc::channel(RUN_REQUESTS);

        Self {
            config,
            pool,
            idle: tokio::sync::Mutex::new(Vec::new()),
            requests,
            pending: Mutex::new(Some(pending)),
        }
    }

    /// Delivery through the system resolver
    ///
    /// # Errors
    /// If the system DNS configuration cannot be loaded
    pub fn from_config(
        config: DeliveryConfig,
        formatter: ErrorResponseFormatter,
    ) -> Result<Self, DnsError> {
        let lookup = HickoryLookup::new(config.dns.clone())?;
        Ok(Self::new(config, Arc::new(lookup), formatter))
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Closes every connection held by an idle engine
    pub async fn flush(&self) -> usize {
        let mut idle = self.idle.lock().await;
        let mut closed = 0;
        for engine in idle.iter_mut() {
            closed += engine.flush().await;
        }
        closed
    }

    /// The connections held by idle engines
    pub async fn snapshot(&self) -> Vec<CachedConnection> {
        self.idle
            .lock()
            .await
            .iter()
            .flat_map(DeliveryEngine::snapshot)
            .collect()
    }

    /// One queue run, optionally restricted to a domain
    ///
    /// # Errors
    /// If the queue cannot be read or written
    pub async fn run_queue(
        &self,
        queue: &dyn QueueStore,
        domain: Option<&str>,
    ) -> Result<RunSummary, tern_common::error::QueueError> {
        self.pool
            .run_queue(queue, self.config.queue_batch, domain)
            .await
    }

    /// Runs the queue every `queue_interval_secs` and whenever a run is
    /// requested, until shutdown.
    ///
    /// # Errors
    /// If called more than once
    pub async fn serve(
        &self,
        queue: Arc<dyn QueueStore>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        let Some(mut requests) = self.pending.lock().take() else {
            return Err(SystemError::Configuration(
                "the delivery queue is already being served".to_string(),
            )
            .into());
        };

        internal!(level = INFO, "Delivery starting");
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.queue_interval_secs.max(1)));
        // The first tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(err) = self.run_queue(queue.as_ref(), None).await {
                        error!(%err, "Queue run failed");
                    }
                    self.expire().await;
                }
                Some(domain) = requests.recv() => {
                    internal!(level = INFO, "Running the queue for {domain}");
                    if let Err(err) = self.run_queue(queue.as_ref(), Some(&domain)).await {
                        error!(%err, %domain, "Queue run failed");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Delivery shutting down");
                        }
                        Err(err) => error!(%err, "Delivery shutdown channel error"),
                    }
                    break;
                }
            }
        }

        let closed = self.flush().await;
        internal!(level = INFO, "Delivery stopped, closed {closed} connections");
        Ok(())
    }

    async fn expire(&self) {
        for engine in self.idle.lock().await.iter_mut() {
            engine.expire().await;
        }
    }
}

#[async_trait]
impl DeliveryHandoff for Delivery {
    async fn deliver(&self, mut envelope: Envelope) -> Envelope {
        let engine = self.idle.lock().await.pop();
        let mut engine = engine.unwrap_or_else(|| self.pool.engine());

        engine.deliver(&mut envelope).await;
        engine.expire().await;

        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.workers.max(1) {
            idle.push(engine);
        } else {
            drop(idle);
            engine.flush().await;
        }
        envelope
    }
}

impl QueueRunner for Delivery {
    fn request_run(&self, domain: &str) -> bool {
        match self.requests.try_send(domain.to_string()) {
            Ok(()) => true,
            Err(err) => {
                warn!(%domain, %err, "Cannot queue a run");
                false
            }
        }
    }
}
