//! The delivery engine.
//!
//! One attempt on an envelope walks its pending recipients batch by batch:
//! gather the recipients that can share a transaction, reach their
//! destination (MX failover for network mailers, a spawned program for
//! local ones, a file append for the file mailer) and record a disposition
//! for every recipient. A failure only ever affects the recipients of the
//! batch it happened in.

mod batch;
mod file;
mod local;
mod network;
mod smtp;

use std::sync::Arc;

use tern_common::{
    Envelope, ExitCode, RecipientState, Reply,
    envelope::BodyType,
    mailer::MailerKind,
};
use tern_security::ClientTlsContext;
use tokio::time::Instant;
use tracing::{debug, instrument};

pub use self::batch::Batch;
use crate::{
    config::DeliveryConfig,
    connection_cache::{CachedConnection, ConnectionCache},
    dns::MxLookup,
    error::{DeliveryError, PermanentError, TemporaryError},
    formatter::{Context, ErrorResponseFormatter},
    signature::HostSignatureResolver,
};

/// Drives recipients through their mailers.
///
/// An engine belongs to one worker at a time: its signature cache and its
/// connection cache are never shared.
#[derive(Debug)]
pub struct DeliveryEngine {
    config: Arc<DeliveryConfig>,
    resolver: HostSignatureResolver,
    cache: ConnectionCache,
    tls: Arc<ClientTlsContext>,
    formatter: ErrorResponseFormatter,
}

impl DeliveryEngine {
    pub fn new(
        config: Arc<DeliveryConfig>,
        lookup: Arc<dyn MxLookup>,
        tls: Arc<ClientTlsContext>,
        formatter: ErrorResponseFormatter,
    ) -> Self {
        Self {
            resolver: HostSignatureResolver::new(lookup, config.dns.clone()),
            cache: ConnectionCache::new(config.cache.clone(), config.timeouts.idle()),
            config,
            tls,
            formatter,
        }
    }

    pub const fn resolver(&self) -> &HostSignatureResolver {
        &self.resolver
    }

    /// Closes every cached connection
    pub async fn flush(&mut self) -> usize {
        self.cache.flush().await
    }

    /// Closes cached connections that idled too long
    pub async fn expire(&mut self) -> usize {
        self.cache.expire().await
    }

    pub fn snapshot(&self) -> Vec<CachedConnection> {
        self.cache.snapshot()
    }

    /// Makes one delivery attempt for every pending recipient of `envelope`.
    ///
    /// Recipients end up `Sent`, `Bad`, `Discarded` or `QueuedRetry`; the
    /// caller decides from that whether the envelope goes back to the
    /// queue.
    #[instrument(level = "debug", skip_all, fields(envelope = %envelope.id()))]
    pub async fn deliver(&mut self, envelope: &mut Envelope) {
        let started = Instant::now();
        let ctx = Context {
            envelope: envelope.id(),
            relay: None,
            started,
        };

        if envelope.hop_count > self.config.max_hops {
            let err = DeliveryError::from(PermanentError::TooManyHops {
                hops: envelope.hop_count,
                max: self.config.max_hops,
            });
            for recipient in envelope.recipients_mut() {
                if recipient.state().is_pending() {
                    self.formatter.fail(ctx, recipient, &err);
                }
            }
            return;
        }

        if envelope.flags.discard {
            for recipient in envelope.recipients_mut() {
                if recipient.state().is_pending() {
                    self.formatter.discard(ctx, recipient);
                }
            }
            return;
        }

        for recipient in envelope.recipients_mut() {
            recipient.reset_for_attempt();
        }

        while let Some(batch) = self.gather(envelope).await {
            debug!(
                mailer = %batch.mailer.name,
                signature = %batch.signature,
                recipients = batch.members.len(),
                "Delivering batch"
            );
            self.dispatch(envelope, &batch, started).await;

            // Whatever the mailer left untouched is tried again later
            let leftover = DeliveryError::from(TemporaryError::Deferred(Reply::from_parts(
                451,
                "4.3.0",
                "Delivery not attempted",
            )));
            self.fail_members(envelope, &batch.members, &leftover, None, started);
        }
    }

    async fn dispatch(&mut self, envelope: &mut Envelope, batch: &Batch, started: Instant) {
        let mailer = Arc::clone(&batch.mailer);

        if mailer.rejects_size(envelope.size) {
            let err = DeliveryError::from(PermanentError::MessageTooLarge {
                size: envelope.size,
                limit: mailer.max_message_size.unwrap_or_default(),
                local: mailer.flags.local,
            });
            self.fail_members(envelope, &batch.members, &err, None, started);
            return;
        }

        if mailer.flags.seven_bit && envelope.body_type == BodyType::EightBitMime {
            let err = DeliveryError::from(PermanentError::EightBitUnsupported(mailer.name.clone()));
            self.fail_members(envelope, &batch.members, &err, None, started);
            return;
        }

        match &mailer.kind {
            MailerKind::Network { .. } => self.deliver_network(envelope, batch, started).await,
            MailerKind::Local { program, argv } => {
                self.deliver_local(envelope, batch, program, argv, started)
                    .await;
            }
            MailerKind::File => self.deliver_file(envelope, batch, started).await,
        }
    }

    /// Records `err` against every member still waiting for an outcome
    fn fail_members(
        &self,
        envelope: &mut Envelope,
        members: &[usize],
        err: &DeliveryError,
        relay: Option<&str>,
        started: Instant,
    ) {
        let ctx = Context {
            envelope: envelope.id(),
            relay,
            started,
        };
        for &idx in members {
            if let Some(recipient) = envelope.recipients_mut().get_mut(idx)
                && recipient.state() == RecipientState::Ok
            {
                self.formatter.fail(ctx, recipient, err);
            }
        }
    }

    /// Records `exit` with `reply` against one member
    fn settle(
        &self,
        envelope: &mut Envelope,
        idx: usize,
        exit: ExitCode,
        reply: &Reply,
        relay: Option<&str>,
        started: Instant,
    ) {
        let ctx = Context {
            envelope: envelope.id(),
            relay,
            started,
        };
        if let Some(recipient) = envelope.recipients_mut().get_mut(idx) {
            self.formatter.mark(ctx, recipient, exit, reply);
        }
    }
}

/// Members that have not been dealt with yet
fn pending(envelope: &Envelope, members: &[usize]) -> Vec<usize> {
    members
        .iter()
        .copied()
        .filter(|&idx| {
            envelope
                .recipients()
                .get(idx)
                .is_some_and(|recipient| recipient.state() == RecipientState::Ok)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tern_common::{Address, MailerDescriptor, Recipient, config::TlsConfig};

    use super::*;
    use crate::dns::StaticLookup;

    fn engine(config: DeliveryConfig) -> DeliveryEngine {
        DeliveryEngine::new(
            Arc::new(config),
            Arc::new(StaticLookup::new()),
            Arc::new(ClientTlsContext::new(&TlsConfig::disabled())),
            ErrorResponseFormatter::new(),
        )
    }

    fn envelope(mailer: &Arc<MailerDescriptor>, count: usize) -> Envelope {
        let mut envelope = Envelope::new(Some(Address::parse("sender@tern.test").unwrap()));
        for n in 0..count {
            envelope.add_recipient(Recipient::new(
                Address::parse(&format!("user{n}@example.com")).unwrap(),
                Arc::clone(mailer),
                "example.com",
            ));
        }
        envelope.set_body(Arc::from(&b"Subject: hi\r\n\r\nhello\r\n"[..]));
        envelope
    }

    #[tokio::test]
    async fn too_many_hops_bounces_everything() {
        let mut engine = engine(DeliveryConfig::default());
        let mailer = Arc::new(MailerDescriptor::esmtp("esmtp"));
        let mut envelope = envelope(&mailer, 2);
        envelope.hop_count = 26;

        engine.deliver(&mut envelope).await;

        for recipient in envelope.recipients() {
            assert_eq!(recipient.state(), RecipientState::Bad);
            assert_eq!(recipient.exit(), Some(ExitCode::Unavailable));
            assert_eq!(recipient.diagnostic(), Some("554 5.4.6 Too many hops 26 (25 max)"));
        }
    }

    #[tokio::test]
    async fn discarded_envelopes_are_not_delivered() {
        let mut engine = engine(DeliveryConfig::default());
        let mailer = Arc::new(MailerDescriptor::esmtp("esmtp"));
        let mut envelope = envelope(&mailer, 2);
        envelope.flags.discard = true;

        engine.deliver(&mut envelope).await;

        assert_eq!(envelope.count_in(RecipientState::Discarded), 2);
        assert!(engine.snapshot().is_empty());
    }

    #[tokio::test]
    async fn oversized_messages_fail_per_mailer() {
        let mut engine = engine(DeliveryConfig::default());
        let mut descriptor = MailerDescriptor::esmtp("esmtp");
        descriptor.max_message_size = Some(10);
        let mailer = Arc::new(descriptor);
        let mut envelope = envelope(&mailer, 1);
        envelope.size = 11;

        engine.deliver(&mut envelope).await;

        let recipient = &envelope.recipients()[0];
        assert_eq!(recipient.state(), RecipientState::Bad);
        assert_eq!(
            recipient.diagnostic(),
            Some("552 5.3.4 Message is too large; 10 bytes max")
        );
    }

    #[tokio::test]
    async fn eight_bit_to_seven_bit_mailer() {
        let mut engine = engine(DeliveryConfig::default());
        let mut descriptor = MailerDescriptor::esmtp("esmtp");
        descriptor.flags.seven_bit = true;
        let mailer = Arc::new(descriptor);
        let mut envelope = envelope(&mailer, 1);
        envelope.body_type = BodyType::EightBitMime;

        engine.deliver(&mut envelope).await;

        let recipient = &envelope.recipients()[0];
        assert_eq!(recipient.state(), RecipientState::Bad);
        assert_eq!(recipient.exit(), Some(ExitCode::DataErr));
        assert_eq!(recipient.status().map(|s| s.to_string()).as_deref(), Some("5.6.3"));
    }

    #[tokio::test]
    async fn unknown_domains_bounce() {
        let mut engine = engine(DeliveryConfig::default());
        let mailer = Arc::new(MailerDescriptor::esmtp("esmtp"));
        let mut envelope = envelope(&mailer, 1);

        engine.deliver(&mut envelope).await;

        let recipient = &envelope.recipients()[0];
        assert_eq!(recipient.state(), RecipientState::Bad);
        assert_eq!(recipient.exit(), Some(ExitCode::NoHost));
        assert_eq!(recipient.diagnostic(), Some("550 5.1.2 Host unknown (example.com)"));
    }

    #[tokio::test]
    async fn sent_recipients_are_left_alone() {
        let mut engine = engine(DeliveryConfig::default());
        let mailer = Arc::new(MailerDescriptor::esmtp("esmtp"));
        let mut envelope = envelope(&mailer, 1);
        envelope.recipients_mut()[0].transition(RecipientState::Sent);

        engine.deliver(&mut envelope).await;

        assert_eq!(envelope.recipients()[0].state(), RecipientState::Sent);
        assert_eq!(envelope.recipients()[0].diagnostic(), None);
    }
}
