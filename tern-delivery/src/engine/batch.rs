use std::sync::Arc;

use tern_common::{Envelope, MailerDescriptor, RecipientState, config::DaneMode};

use super::DeliveryEngine;
use crate::signature::HostSignature;

/// Recipients that share one transaction.
#[derive(Debug, Clone)]
pub struct Batch {
    pub mailer: Arc<MailerDescriptor>,
    /// Hosts to try, common to every member
    pub signature: Arc<HostSignature>,
    /// Indices into the envelope's recipient list, in chain order
    pub members: Vec<usize>,
}

fn same_mailer(a: &Arc<MailerDescriptor>, b: &Arc<MailerDescriptor>) -> bool {
    Arc::ptr_eq(a, b) || a == b
}

impl DeliveryEngine {
    /// Chains pending recipients onto the first one ("piggybacking").
    ///
    /// A recipient joins when it uses the same mailer and its signature
    /// agrees with the batch's: identical signatures join outright, and a
    /// signature that only shares a leading run of preference groups
    /// narrows the batch to that run. Joining stops at the mailer's
    /// recipient limit and, for mailers that receive names as one argument
    /// list, at the name list limit.
    pub(super) async fn gather(&self, envelope: &Envelope) -> Option<Batch> {
        let recipients = envelope.recipients();
        let head = recipients
            .iter()
            .position(|recipient| recipient.state() == RecipientState::Ok)?;
        let first = recipients.get(head)?;

        let auth_hint = self.config.tls.dane == DaneMode::Opportunistic;
        let signature = self
            .resolver
            .resolve(&first.mailer, &first.host, auth_hint)
            .await;

        let mut batch = Batch {
            mailer: Arc::clone(&first.mailer),
            signature,
            members: vec![head],
        };

        let mailer = Arc::clone(&batch.mailer);
        if !mailer.batches() {
            return Some(batch);
        }

        let limit = mailer.max_recipients.unwrap_or(usize::MAX).max(1);
        let capped_names = !mailer.is_network() && !mailer.flags.expands_names;
        let mut names = first.user.len();

        for (idx, recipient) in recipients.iter().enumerate().skip(head + 1) {
            if batch.members.len() >= limit {
                break;
            }
            if recipient.state() != RecipientState::Ok || !same_mailer(&recipient.mailer, &mailer)
            {
                continue;
            }
            if capped_names && names + 1 + recipient.user.len() > mailer.max_name_list {
                break;
            }

            let theirs = self
                .resolver
                .resolve(&recipient.mailer, &recipient.host, auth_hint)
                .await;
            let Some(common) = batch.signature.common_prefix(&theirs) else {
                continue;
            };
            if common != *batch.signature {
                batch.signature = Arc::new(common);
            }

            names += 1 + recipient.user.len();
            batch.members.push(idx);
        }

        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tern_common::{Address, Recipient, config::TlsConfig};
    use tern_security::ClientTlsContext;

    use super::*;
    use crate::{
        config::DeliveryConfig,
        dns::StaticLookup,
        formatter::ErrorResponseFormatter,
    };

    fn engine() -> DeliveryEngine {
        let lookup = StaticLookup::new()
            .with_mx("a.test", &[("mx1.shared.test", 10), ("mx2.shared.test", 20)])
            .with_mx("b.test", &[("mx1.shared.test", 10), ("mx2.shared.test", 20)])
            .with_mx("c.test", &[("mx1.shared.test", 10)])
            .with_mx("d.test", &[("mx.other.test", 10)]);

        DeliveryEngine::new(
            Arc::new(DeliveryConfig::default()),
            Arc::new(lookup),
            Arc::new(ClientTlsContext::new(&TlsConfig::disabled())),
            ErrorResponseFormatter::new(),
        )
    }

    fn with_recipients(recipients: &[(&str, &Arc<MailerDescriptor>)]) -> Envelope {
        let mut envelope = Envelope::new(None);
        for (address, mailer) in recipients {
            let address = Address::parse(address).unwrap();
            let host = address.domain().unwrap_or_default().to_string();
            envelope.add_recipient(Recipient::new(address, Arc::clone(mailer), host));
        }
        for recipient in envelope.recipients_mut() {
            recipient.reset_for_attempt();
        }
        envelope
    }

    #[tokio::test]
    async fn shared_signatures_share_a_batch() {
        let engine = engine();
        let esmtp = Arc::new(MailerDescriptor::esmtp("esmtp"));
        let envelope = with_recipients(&[
            ("one@a.test", &esmtp),
            ("two@d.test", &esmtp),
            ("three@b.test", &esmtp),
        ]);

        let batch = engine.gather(&envelope).await.unwrap();
        assert_eq!(batch.members, vec![0, 2]);
        assert_eq!(batch.signature.as_str(), "mx1.shared.test:mx2.shared.test");
    }

    #[tokio::test]
    async fn prefixes_narrow_the_batch() {
        let engine = engine();
        let esmtp = Arc::new(MailerDescriptor::esmtp("esmtp"));
        let envelope = with_recipients(&[("one@a.test", &esmtp), ("two@c.test", &esmtp)]);

        let batch = engine.gather(&envelope).await.unwrap();
        assert_eq!(batch.members, vec![0, 1]);
        assert_eq!(batch.signature.as_str(), "mx1.shared.test");
    }

    #[tokio::test]
    async fn limits_apply() {
        let engine = engine();
        let mut descriptor = MailerDescriptor::esmtp("esmtp");
        descriptor.max_recipients = Some(2);
        let esmtp = Arc::new(descriptor);
        let envelope = with_recipients(&[
            ("one@a.test", &esmtp),
            ("two@a.test", &esmtp),
            ("three@a.test", &esmtp),
        ]);
        assert_eq!(engine.gather(&envelope).await.unwrap().members, vec![0, 1]);

        let mut descriptor = MailerDescriptor::esmtp("single");
        descriptor.flags.multi_user = false;
        let single = Arc::new(descriptor);
        let envelope = with_recipients(&[("one@a.test", &single), ("two@a.test", &single)]);
        assert_eq!(engine.gather(&envelope).await.unwrap().members, vec![0]);
    }

    #[tokio::test]
    async fn name_lists_are_capped_for_local_mailers() {
        let engine = engine();
        let mut descriptor = MailerDescriptor::local("local", "/bin/cat", vec![]);
        descriptor.flags.multi_user = true;
        descriptor.max_name_list = 10;
        let local = Arc::new(descriptor);

        let mut envelope = Envelope::new(None);
        for user in ["alice", "bob", "carol"] {
            envelope.add_recipient(
                Recipient::new(
                    Address::parse(&format!("{user}@tern.test")).unwrap(),
                    Arc::clone(&local),
                    "localhost",
                )
                .with_user(user),
            );
        }
        for recipient in envelope.recipients_mut() {
            recipient.reset_for_attempt();
        }

        // "alice bob" fits, "alice bob carol" does not
        assert_eq!(engine.gather(&envelope).await.unwrap().members, vec![0, 1]);
    }

    #[tokio::test]
    async fn only_ok_recipients_are_gathered() {
        let engine = engine();
        let esmtp = Arc::new(MailerDescriptor::esmtp("esmtp"));
        let mut envelope = with_recipients(&[("one@a.test", &esmtp), ("two@a.test", &esmtp)]);
        envelope.recipients_mut()[0].transition(RecipientState::Sent);

        assert_eq!(engine.gather(&envelope).await.unwrap().members, vec![1]);

        envelope.recipients_mut()[1].transition(RecipientState::Bad);
        assert!(engine.gather(&envelope).await.is_none());
    }
}
