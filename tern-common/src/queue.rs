//! In-memory [`QueueStore`].
//!
//! Used by tests and by deployments that do not persist the queue. Claims
//! behave like the advisory locks of an on-disk queue: a claimed envelope is
//! invisible to other claimers until it is updated or removed.

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use ulid::Ulid;

use crate::{envelope::Envelope, error::QueueError, traits::QueueStore};

#[derive(Debug)]
struct Entry {
    envelope: Envelope,
    claimed: bool,
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<AHashMap<Ulid, Entry>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// A copy of a queued envelope, claimed or not
    pub fn get(&self, id: Ulid) -> Option<Envelope> {
        self.entries.lock().get(&id).map(|e| e.envelope.clone())
    }

    /// Whether a worker currently holds the claim on `id`
    pub fn is_claimed(&self, id: Ulid) -> bool {
        self.entries.lock().get(&id).is_some_and(|e| e.claimed)
    }

    fn insert(&self, envelope: &Envelope, claimed: bool) -> Result<Ulid, QueueError> {
        let id = envelope.id();
        let mut entries = self.entries.lock();
        if entries.get(&id).is_some_and(|entry| entry.claimed) {
            return Err(QueueError::Claimed(id));
        }
        entries.insert(
            id,
            Entry {
                envelope: envelope.clone(),
                claimed,
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn enqueue(&self, envelope: &Envelope) -> Result<Ulid, QueueError> {
        self.insert(envelope, false)
    }

    async fn enqueue_claimed(&self, envelope: &Envelope) -> Result<Ulid, QueueError> {
        self.insert(envelope, true)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<Envelope>, QueueError> {
        let mut entries = self.entries.lock();
        let mut ids = entries
            .iter()
            .filter(|(_, entry)| !entry.claimed && entry.envelope.has_pending())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        // ULIDs sort by creation time, oldest first
        ids.sort_unstable();
        ids.truncate(limit);

        Ok(ids
            .into_iter()
            .filter_map(|id| {
                entries.get_mut(&id).map(|entry| {
                    entry.claimed = true;
                    entry.envelope.clone()
                })
            })
            .collect())
    }

    async fn update(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&envelope.id())
            .ok_or(QueueError::NotFound(envelope.id()))?;
        entry.envelope = envelope.clone();
        entry.claimed = false;
        Ok(())
    }

    async fn remove(&self, id: Ulid) -> Result<(), QueueError> {
        self.entries
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{address::Address, mailer::MailerDescriptor, recipient::Recipient};

    fn envelope() -> Envelope {
        let mut envelope = Envelope::new(None);
        envelope.add_recipient(Recipient::new(
            Address::parse("a@example.com").unwrap(),
            Arc::new(MailerDescriptor::esmtp("esmtp")),
            "example.com",
        ));
        envelope
    }

    #[tokio::test]
    async fn claims_are_exclusive() {
        let queue = MemoryQueue::new();
        let first = envelope();
        let second = envelope();
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let claimed = queue.claim(1).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let rest = queue.claim(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_ne!(rest[0].id(), claimed[0].id());

        assert!(queue.claim(10).await.unwrap().is_empty());

        queue.update(&claimed[0]).await.unwrap();
        assert_eq!(queue.claim(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claimed_entries_cannot_be_replaced() {
        let queue = MemoryQueue::new();
        let held = envelope();
        queue.enqueue_claimed(&held).await.unwrap();

        assert!(queue.is_claimed(held.id()));
        assert!(queue.claim(10).await.unwrap().is_empty());
        assert!(matches!(
            queue.enqueue(&held).await,
            Err(QueueError::Claimed(id)) if id == held.id()
        ));

        queue.update(&held).await.unwrap();
        assert!(!queue.is_claimed(held.id()));
        queue.enqueue(&held).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn remove_unknown() {
        let queue = MemoryQueue::new();
        assert!(matches!(
            queue.remove(Ulid::new()).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
