use std::{sync::Arc, time::Duration};

use tern_common::{
    Address, Envelope, RecipientState, Reply, Status,
    envelope::BodyType,
    error::SessionError,
    internal,
    load::DeliveryMode,
    traits::{DeliveryHandoff, QueueStore},
    tracing,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, MAX_DATA_LINE, Session};
use crate::{
    body::{BodyCollector, Progress},
    checkpoint::{Phase, Verdict},
    command::{Command, MailParameters, RcptParameters},
    error::ConnectionError,
};

/// Priority penalty per recipient, so wide fan-outs queue first under load
const RECIPIENT_PRIORITY: u64 = 30_000;

fn queue_failure(err: &impl std::fmt::Display) -> Reply {
    tracing::error!("Unable to queue message: {err}");
    Reply::from_parts(451, "4.3.0", "Mail system temporarily unavailable")
}

fn too_large(size: usize, limit: usize) -> Reply {
    Reply::from_parts(
        552,
        "5.3.4",
        format!("Message size {size} exceeds fixed maximum message size {limit}"),
    )
}

async fn persist(queue: Option<&Arc<dyn QueueStore>>, envelope: &Envelope) -> Result<(), Reply> {
    let Some(queue) = queue else {
        return Err(queue_failure(&"no queue configured"));
    };

    let id = queue
        .enqueue(envelope)
        .await
        .map_err(|err| queue_failure(&err))?;
    internal!(level = DEBUG, "Queued {id}");
    Ok(())
}

/// Delivers now, then queues whatever is still pending.
///
/// Once any recipient has reached a final state the message counts as
/// accepted, since a retry by the client would deliver it twice; a queue
/// failure past that point loses the pending recipients and is only logged.
async fn deliver(
    handoff: Arc<dyn DeliveryHandoff>,
    queue: Option<&Arc<dyn QueueStore>>,
    envelope: Envelope,
) -> Result<(), Reply> {
    let delivered = handoff.deliver(envelope).await;
    if !delivered.has_pending() {
        return Ok(());
    }

    match persist(queue, &delivered).await {
        Err(reply)
            if delivered
                .recipients()
                .iter()
                .any(|recipient| recipient.state().is_final()) =>
        {
            let lost = delivered
                .recipients()
                .iter()
                .filter(|recipient| recipient.state().is_pending())
                .map(|recipient| recipient.address.to_string())
                .collect::<Vec<_>>();
            tracing::error!(
                envelope = %delivered.id(),
                %reply,
                ?lost,
                "Message partly delivered, pending recipients could not be queued"
            );
            Ok(())
        }
        result => result,
    }
}

/// Stores the envelope under a claim, then delivers it in a task of its own
/// which records the outcome and releases the claim
async fn deliver_in_background(
    handoff: Arc<dyn DeliveryHandoff>,
    queue: Option<&Arc<dyn QueueStore>>,
    envelope: Envelope,
) -> Result<(), Reply> {
    let Some(queue) = queue.cloned() else {
        return Err(queue_failure(&"no queue configured"));
    };
    let id = queue
        .enqueue_claimed(&envelope)
        .await
        .map_err(|err| queue_failure(&err))?;

    tokio::spawn(async move {
        let delivered = handoff.deliver(envelope).await;
        let recorded = if delivered.has_pending() {
            queue.update(&delivered).await
        } else {
            queue.remove(id).await
        };
        if let Err(err) = recorded {
            tracing::error!(envelope = %id, %err, "Unable to record background delivery");
        }
    });

    Ok(())
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn mail(
        &mut self,
        command: &Command,
        sender: Option<&Address>,
        params: &MailParameters,
    ) -> Result<Flow, SessionError> {
        let limit = self.args.max_message_size();
        if let Some(size) = params.size
            && limit > 0
            && size > limit
        {
            return self.reply(&too_large(size, limit)).await;
        }

        let path = sender.map_or_else(|| "<>".to_string(), |s| format!("<{s}>"));
        let discard = match self.checkpoint(Phase::Mail, Some(&path)).await {
            Verdict::Reject(reply) | Verdict::TempFail(reply) => return self.reply(&reply).await,
            Verdict::Discard => true,
            Verdict::Accept => false,
        };

        let mut envelope = Envelope::new(sender.cloned());
        envelope.size = params.size.unwrap_or_default();
        envelope.body_type = params.body.unwrap_or_default();
        envelope.envid.clone_from(&params.envid);
        envelope.ret = params.ret;
        envelope.flags.discard = discard;

        envelope
            .macros
            .extend(self.context.iter().map(|(k, v)| (k.clone(), v.clone())));
        envelope
            .macros
            .insert("client_addr".to_string(), self.peer.ip().to_string());
        if let Some(helo) = &self.helo {
            envelope.macros.insert("helo".to_string(), helo.clone());
        }
        envelope.macros.extend(
            self.security
                .macros()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v)),
        );
        if let Some(author) = &params.auth
            && self.security.authenticated().is_some()
        {
            envelope
                .macros
                .insert("auth_author".to_string(), author.clone());
        }
        if let Some(by) = params.by {
            envelope
                .macros
                .insert("deliver_by".to_string(), by.seconds.to_string());
        }

        tracing::debug!(peer = %self.peer, envelope = %envelope.id(), sender = %path, "Transaction started");
        self.envelope = Some(envelope);
        self.advance(command);

        self.reply(&Reply::from_parts(
            250,
            "2.1.0",
            format!("{path}... Sender ok"),
        ))
        .await
    }

    pub(super) async fn rcpt(
        &mut self,
        command: &Command,
        recipient: &Address,
        params: &RcptParameters,
    ) -> Result<Flow, SessionError> {
        if self.flags.recipients >= self.args.max_recipients {
            return self
                .reply(&Reply::from_parts(452, "4.5.3", "Too many recipients"))
                .await;
        }

        if let Some(delay) = self.throttle.recipient() {
            tracing::debug!(peer = %self.peer, ?delay, "Slowing down recipients");
            tokio::time::sleep(delay).await;
        }

        let path = format!("<{recipient}>");
        match self.checkpoint(Phase::Rcpt, Some(&path)).await {
            Verdict::Reject(reply) | Verdict::TempFail(reply) => return self.reply(&reply).await,
            Verdict::Discard => {
                if let Some(envelope) = self.envelope.as_mut() {
                    envelope.flags.discard = true;
                }
            }
            Verdict::Accept => {}
        }

        let Some(expander) = self.args.expander.clone() else {
            return self
                .reply(&Reply::from_parts(550, "5.1.1", format!("{path}... User unknown")))
                .await;
        };

        let notify = params.notify.unwrap_or_default();
        let expanded = match expander.expand(recipient, notify).await {
            Ok(expanded) => expanded,
            Err(reply) => return self.reply(&reply).await,
        };

        let Some(envelope) = self.envelope.as_mut() else {
            return self
                .reject(&Reply::from_parts(503, "5.0.0", "Need MAIL before RCPT"))
                .await;
        };

        for mut expanded in expanded {
            expanded.original.clone_from(&params.orcpt);
            envelope.add_recipient(expanded);
        }
        envelope
            .macros
            .insert("dsn_notify".to_string(), notify.to_string());

        self.advance(command);
        self.reply(&Reply::from_parts(
            250,
            "2.1.5",
            format!("{path}... Recipient ok"),
        ))
        .await
    }

    pub(super) async fn data(&mut self, command: &Command) -> Result<Flow, SessionError> {
        match self.checkpoint(Phase::Data, None).await {
            Verdict::Reject(reply) | Verdict::TempFail(reply) => return self.reply(&reply).await,
            Verdict::Discard => {
                if let Some(envelope) = self.envelope.as_mut() {
                    envelope.flags.discard = true;
                }
            }
            Verdict::Accept => {}
        }

        self.advance(command);
        self.send(&Reply::new(
            Status::StartMailInput,
            None,
            "Enter mail, end with \".\" on a line by itself",
        ))
        .await?;

        let limit = self.args.max_message_size();
        let mut collector = BodyCollector::new(limit);
        let mut overlong = false;
        let mut timeout = Duration::from_secs(self.args.timeouts.data_init_secs);

        loop {
            let waited = timeout;
            let read = tokio::time::timeout(waited, self.connection.read_line(MAX_DATA_LINE)).await;
            timeout = Duration::from_secs(self.args.timeouts.data_block_secs);

            match read {
                Err(_) => {
                    self.abandon("timeout waiting for message data");
                    self.send(&Reply::from_parts(
                        421,
                        "4.4.2",
                        format!("{} Timeout waiting for input during message collect", self.args.hostname),
                    ))
                    .await?;
                    return Err(SessionError::Timeout(waited.as_secs()));
                }
                Ok(Ok(Some(line))) => {
                    if collector.push_line(&line) == Progress::Complete {
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    self.abandon("connection closed during message collect");
                    return Ok(Flow::Close);
                }
                Ok(Err(ConnectionError::LineTooLong(_))) => overlong = true,
                Ok(Err(err)) => return Err(SessionError::Protocol(err.to_string())),
            }
        }

        self.advance(&Command::Rset);
        self.throttle.reset_transaction();

        let Some(mut envelope) = self.envelope.take() else {
            return self
                .reply(&Reply::from_parts(503, "5.0.0", "Need MAIL command"))
                .await;
        };

        if overlong {
            return self
                .reply(&Reply::from_parts(500, "5.5.2", "Line too long in message"))
                .await;
        }

        let body = match collector.finish() {
            Ok(body) => body,
            Err(size) => {
                tracing::info!(envelope = %envelope.id(), size, limit, "Message too large");
                return self.reply(&too_large(size, limit)).await;
            }
        };

        if body.hops > self.args.max_hops {
            tracing::warn!(envelope = %envelope.id(), hops = body.hops, "Too many hops");
            return self
                .reply(&Reply::from_parts(
                    554,
                    "5.4.6",
                    format!("Too many hops {} ({} max)", body.hops, self.args.max_hops),
                ))
                .await;
        }

        envelope.size = body.data.len();
        envelope.hop_count = body.hops;
        if body.eight_bit && envelope.body_type == BodyType::SevenBit {
            tracing::debug!(envelope = %envelope.id(), "8-bit data in a 7BIT message");
        }
        envelope.set_body(body.data);
        self.envelope = Some(envelope);

        let verdict = self.checkpoint(Phase::PreEnqueue, None).await;
        let Some(mut envelope) = self.envelope.take() else {
            return Ok(Flow::Continue);
        };
        match verdict {
            Verdict::Reject(reply) | Verdict::TempFail(reply) => return self.reply(&reply).await,
            Verdict::Discard => envelope.flags.discard = true,
            Verdict::Accept => {}
        }

        let id = envelope.id();
        match self.handoff(envelope).await {
            Ok(()) => {
                tracing::info!(peer = %self.peer, envelope = %id, "Message accepted");
                self.reply(&Reply::from_parts(
                    250,
                    "2.0.0",
                    format!("{id} Message accepted for delivery"),
                ))
                .await
            }
            Err(reply) => self.reply(&reply).await,
        }
    }

    /// Passes an accepted envelope on according to the delivery mode and
    /// the current load
    async fn handoff(&self, mut envelope: Envelope) -> Result<(), Reply> {
        if envelope.flags.discard {
            for recipient in envelope.recipients_mut() {
                recipient.transition(RecipientState::Discarded);
            }
            tracing::info!(envelope = %envelope.id(), "Discarded");
            return Ok(());
        }

        let recipients = u64::try_from(envelope.recipients().len()).unwrap_or(u64::MAX);
        envelope.priority = u64::try_from(envelope.size)
            .unwrap_or(u64::MAX)
            .saturating_add(recipients.saturating_mul(RECIPIENT_PRIORITY));

        let mut envelopes = envelope.split_by_owner();
        if !envelope.recipients().is_empty() {
            envelopes.insert(0, envelope);
        }

        let mode = if self.verbose {
            DeliveryMode::Interactive
        } else {
            self.args.mode
        };
        let load = self
            .args
            .load_source
            .as_ref()
            .map_or(0, |source| source.load());

        let mut accepted = false;
        for envelope in envelopes {
            let id = envelope.id();
            match self.pass_on(envelope, mode, load).await {
                Ok(()) => accepted = true,
                Err(reply) if accepted => {
                    tracing::error!(
                        envelope = %id,
                        %reply,
                        "Split envelope lost after part of the message was accepted"
                    );
                }
                Err(reply) => return Err(reply),
            }
        }

        Ok(())
    }

    async fn pass_on(&self, envelope: Envelope, mode: DeliveryMode, load: u32) -> Result<(), Reply> {
        let queue = self.args.queue.as_ref();
        let handoff = match self.args.handoff.clone() {
            Some(handoff)
                if mode.delivers_now() && !self.args.load.should_queue(envelope.priority, load) =>
            {
                handoff
            }
            _ => return persist(queue, &envelope).await,
        };

        if mode == DeliveryMode::Interactive {
            deliver(handoff, queue, envelope).await
        } else {
            deliver_in_background(handoff, queue, envelope).await
        }
    }
}
