//! Fanning envelopes out over isolated delivery tasks.
//!
//! Envelopes are partitioned by the destination of their first pending
//! recipient. Each partition runs on its own task with its own
//! [`DeliveryEngine`], so one destination's signature cache, connections and
//! failures never touch another's. The coordinator only reaps the tasks.

use std::sync::Arc;

use ahash::AHashMap;
use tern_common::{Envelope, error::QueueError, traits::QueueStore};
use tern_security::ClientTlsContext;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::DeliveryConfig, dns::MxLookup, engine::DeliveryEngine,
    formatter::ErrorResponseFormatter,
};

/// Envelopes that share a destination, delivered by one task
type Partition = Vec<Envelope>;

/// Outcome of one queue run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    /// Envelopes with nothing left to deliver, removed from the queue
    pub completed: usize,
    /// Envelopes put back with recipients still pending
    pub deferred: usize,
}

#[derive(Clone)]
pub struct WorkerPool {
    config: Arc<DeliveryConfig>,
    lookup: Arc<dyn MxLookup>,
    tls: Arc<ClientTlsContext>,
    formatter: ErrorResponseFormatter,
    permits: Arc<Semaphore>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.config.workers)
            .field("idle", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

/// The destination key of an envelope: mailer and host of its first
/// pending recipient
fn destination(envelope: &Envelope) -> Option<(String, String)> {
    envelope
        .recipients()
        .iter()
        .find(|recipient| recipient.state().is_pending())
        .map(|recipient| {
            (
                recipient.mailer.name.clone(),
                recipient.host.to_ascii_lowercase(),
            )
        })
}

/// Groups envelopes by destination, keeping their order within a group.
///
/// Envelopes without pending recipients come back in `idle`.
fn partition(envelopes: Vec<Envelope>) -> (Vec<Partition>, Vec<Envelope>) {
    let mut order = Vec::new();
    let mut groups: AHashMap<(String, String), Partition> = AHashMap::new();
    let mut idle = Vec::new();

    for envelope in envelopes {
        match destination(&envelope) {
            Some(key) => {
                let group = groups.entry(key.clone()).or_default();
                if group.is_empty() {
                    order.push(key);
                }
                group.push(envelope);
            }
            None => idle.push(envelope),
        }
    }

    let partitions = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect();
    (partitions, idle)
}

impl WorkerPool {
    pub fn new(
        config: Arc<DeliveryConfig>,
        lookup: Arc<dyn MxLookup>,
        tls: Arc<ClientTlsContext>,
        formatter: ErrorResponseFormatter,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            config,
            lookup,
            tls,
            formatter,
            permits,
        }
    }

    /// A fresh engine with empty caches
    pub fn engine(&self) -> DeliveryEngine {
        DeliveryEngine::new(
            Arc::clone(&self.config),
            Arc::clone(&self.lookup),
            Arc::clone(&self.tls),
            self.formatter.clone(),
        )
    }

    /// Attempts every envelope and returns them with updated recipients.
    ///
    /// At most `workers` partitions run at once. A partition whose task
    /// fails comes back as it went in.
    pub async fn run(&self, envelopes: Vec<Envelope>) -> Vec<Envelope> {
        let (partitions, mut done) = partition(envelopes);
        if partitions.is_empty() {
            return done;
        }

        debug!(partitions = partitions.len(), "Starting delivery workers");

        let tasks: Vec<(JoinHandle<Partition>, Partition)> = partitions
            .into_iter()
            .map(|partition| {
                let originals = partition.clone();
                (self.spawn(partition), originals)
            })
            .collect();

        for (task, originals) in tasks {
            match task.await {
                Ok(delivered) => done.extend(delivered),
                Err(err) => {
                    error!(%err, envelopes = originals.len(), "Delivery worker failed");
                    done.extend(originals);
                }
            }
        }

        done
    }

    fn spawn(&self, mut partition: Partition) -> JoinHandle<Partition> {
        let permits = Arc::clone(&self.permits);
        let mut engine = self.engine();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return partition;
            };

            for envelope in &mut partition {
                engine.deliver(envelope).await;
            }

            let closed = engine.flush().await;
            debug!(closed, "Delivery worker finished");
            partition
        })
    }

    /// Claims up to `limit` queued envelopes, attempts them and stores the
    /// outcome: finished envelopes are removed, the rest released.
    ///
    /// With `domain` set, only envelopes with a pending recipient at that
    /// domain are attempted; the others are released untouched.
    ///
    /// # Errors
    /// If the queue cannot be read or written
    pub async fn run_queue(
        &self,
        queue: &dyn QueueStore,
        limit: usize,
        domain: Option<&str>,
    ) -> Result<RunSummary, QueueError> {
        let claimed = queue.claim(limit).await?;
        if claimed.is_empty() {
            return Ok(RunSummary::default());
        }

        let (wanted, skipped): (Vec<_>, Vec<_>) = claimed
            .into_iter()
            .partition(|envelope| domain.is_none_or(|domain| wants(envelope, domain)));
        for envelope in &skipped {
            queue.update(envelope).await?;
        }

        let mut summary = RunSummary {
            attempted: wanted.len(),
            ..RunSummary::default()
        };

        for envelope in self.run(wanted).await {
            if envelope.has_pending() {
                queue.update(&envelope).await?;
                summary.deferred += 1;
            } else {
                queue.remove(envelope.id()).await?;
                summary.completed += 1;
            }
        }

        if summary.deferred > 0 {
            warn!(?summary, "Queue run left envelopes deferred");
        } else {
            info!(?summary, "Queue run finished");
        }
        Ok(summary)
    }
}

/// Whether `envelope` has a pending recipient at `domain` or below it
fn wants(envelope: &Envelope, domain: &str) -> bool {
    let domain = domain
        .trim_start_matches('@')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    envelope.recipients().iter().any(|recipient| {
        let host = recipient.host.trim_end_matches('.').to_ascii_lowercase();
        recipient.state().is_pending()
            && host
                .strip_suffix(domain.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'))
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tern_common::{
        Address, MailerDescriptor, Recipient, RecipientState, config::TlsConfig,
        queue::MemoryQueue,
    };

    use super::*;
    use crate::dns::StaticLookup;

    fn to(addresses: &[&str]) -> Envelope {
        let mailer = Arc::new(MailerDescriptor::esmtp("esmtp"));
        let mut envelope = Envelope::new(Some(Address::parse("sender@tern.test").unwrap()));
        for address in addresses {
            let address = Address::parse(address).unwrap();
            let host = address.domain().unwrap_or_default().to_string();
            envelope.add_recipient(Recipient::new(address, Arc::clone(&mailer), host));
        }
        envelope.set_body(Arc::from(&b"hello\r\n"[..]));
        envelope
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(
            Arc::new(DeliveryConfig::default()),
            Arc::new(StaticLookup::new()),
            Arc::new(ClientTlsContext::new(&TlsConfig::disabled())),
            ErrorResponseFormatter::new(),
        )
    }

    #[test]
    fn partitions_follow_the_first_pending_recipient() {
        let mut done = to(&["a@one.test"]);
        done.recipients_mut()[0].transition(RecipientState::Sent);

        let envelopes = vec![
            to(&["a@one.test", "b@two.test"]),
            to(&["c@two.test"]),
            to(&["d@ONE.test"]),
            done,
        ];
        let (partitions, idle) = partition(envelopes);

        let sizes = partitions.iter().map(Vec::len).collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(idle.len(), 1);
        assert_eq!(
            destination(&partitions[1][0]),
            Some(("esmtp".to_string(), "two.test".to_string()))
        );
    }

    #[test]
    fn domains_match_subdomains() {
        let envelope = to(&["a@mail.example.com"]);
        assert!(wants(&envelope, "example.com"));
        assert!(wants(&envelope, "MAIL.example.com"));
        assert!(wants(&envelope, "@example.com"));
        assert!(!wants(&envelope, "ample.com"));
        assert!(!wants(&envelope, "other.test"));
    }

    #[tokio::test]
    async fn every_envelope_comes_back() {
        let pool = pool();
        let envelopes = vec![to(&["a@one.test"]), to(&["b@two.test"]), to(&["c@one.test"])];
        let ids = {
            let mut ids = envelopes.iter().map(Envelope::id).collect::<Vec<_>>();
            ids.sort_unstable();
            ids
        };

        let delivered = pool.run(envelopes).await;

        let mut seen = delivered.iter().map(Envelope::id).collect::<Vec<_>>();
        seen.sort_unstable();
        assert_eq!(seen, ids);
        // No such domains: every recipient bounced
        for envelope in &delivered {
            assert_eq!(envelope.count_in(RecipientState::Bad), 1);
        }
    }

    #[tokio::test]
    async fn queue_runs_remove_finished_envelopes() {
        let pool = pool();
        let queue = MemoryQueue::new();
        let first = to(&["a@one.test"]);
        let second = to(&["b@two.test"]);
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let summary = pool.run_queue(&queue, 10, Some("two.test")).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                attempted: 1,
                completed: 1,
                deferred: 0,
            }
        );
        assert!(queue.get(second.id()).is_none());
        assert!(queue.get(first.id()).is_some());

        let summary = pool.run_queue(&queue, 10, None).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(queue.is_empty());
    }
}
