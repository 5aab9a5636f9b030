//! Interfaces to the parts of the MTA that live outside the delivery and
//! protocol engine: queue persistence, address expansion, the hand-off from
//! the server to delivery, and the per-recipient disposition callback.

use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use crate::{
    address::Address,
    dsn::DsnNotify,
    envelope::Envelope,
    error::QueueError,
    recipient::{Recipient, RecipientState},
    status::{EnhancedStatus, Reply},
};

/// Durable storage for envelopes awaiting delivery.
///
/// `claim` takes an advisory lock on the returned envelopes so that no two
/// workers ever attempt the same envelope; the lock is released by `update`
/// or `remove`.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Stores an envelope, replacing an unclaimed copy with the same id
    async fn enqueue(&self, envelope: &Envelope) -> Result<Ulid, QueueError>;

    /// Stores an envelope already claimed by the caller, for delivery that
    /// starts straight away but must survive the attempt failing
    async fn enqueue_claimed(&self, envelope: &Envelope) -> Result<Ulid, QueueError>;

    /// Claims up to `limit` unclaimed envelopes
    async fn claim(&self, limit: usize) -> Result<Vec<Envelope>, QueueError>;

    /// Stores the outcome of an attempt and releases the claim
    async fn update(&self, envelope: &Envelope) -> Result<(), QueueError>;

    /// Removes a fully delivered envelope
    async fn remove(&self, id: Ulid) -> Result<(), QueueError>;
}

/// Turns an accepted `RCPT TO` address into concrete recipients.
///
/// An alias may expand to several recipients, each already bound to a
/// mailer and host. A rejection is returned as the reply to send.
#[async_trait]
pub trait AliasExpander: Send + Sync {
    async fn expand(&self, address: &Address, notify: DsnNotify) -> Result<Vec<Recipient>, Reply>;
}

/// Immediate delivery of an accepted envelope.
#[async_trait]
pub trait DeliveryHandoff: Send + Sync {
    /// Attempts every pending recipient and returns the envelope with
    /// updated recipient states.
    async fn deliver(&self, envelope: Envelope) -> Envelope;
}

/// Runs the queue for one destination (`ETRN`).
pub trait QueueRunner: Send + Sync {
    /// Returns `false` if no run could be started for the domain
    fn request_run(&self, domain: &str) -> bool;
}

/// The terminal outcome of one recipient in one attempt.
#[derive(Debug, Clone)]
pub struct Disposition {
    pub envelope: Ulid,
    pub recipient: String,
    pub mailer: String,
    /// Host that produced the reply, if any was contacted
    pub relay: Option<String>,
    pub state: RecipientState,
    pub reply: Reply,
    pub status: EnhancedStatus,
    pub elapsed: Duration,
    pub relayed: bool,
}

/// Receives every recipient disposition, for logging or queue updates.
pub trait DispositionSink: Send + Sync {
    fn disposition(&self, disposition: &Disposition);
}
