//! One SMTP/LMTP mail transaction over a ready connection.

use std::collections::VecDeque;

use tern_common::{Envelope, ExitCode, MailerDescriptor, Recipient, envelope::BodyType};
use tern_smtp::{
    client::{Capabilities, Response, Step, mail_command, rcpt_command},
    error::ClientError,
};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::DeliveryEngine;
use crate::{
    connection_cache::{ConnectionContext, Phase},
    error::{DeliveryError, PermanentError, SystemError, TemporaryError},
};

/// Why a transaction stopped early
enum Abort {
    /// The peer refused; the connection is still in a known state
    Refused(DeliveryError),
    /// The channel broke or is out of step and must not be used again
    Broken(DeliveryError),
}

impl From<ClientError> for Abort {
    fn from(err: ClientError) -> Self {
        Self::Broken(err.into())
    }
}

/// xtext encoding (RFC 3461) for `ENVID=` and `ORCPT=`
fn xtext(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if (b'!'..=b'~').contains(&byte) && byte != b'+' && byte != b'=' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("+{byte:02X}"));
        }
    }
    encoded
}

fn mail_params(envelope: &Envelope, capabilities: &Capabilities) -> Vec<String> {
    let mut params = Vec::new();

    if capabilities.size.is_some() && envelope.size > 0 {
        params.push(format!("SIZE={}", envelope.size));
    }
    if envelope.body_type == BodyType::EightBitMime && capabilities.eight_bit_mime {
        params.push("BODY=8BITMIME".to_string());
    }
    if capabilities.dsn {
        if let Some(envid) = &envelope.envid {
            params.push(format!("ENVID={}", xtext(envid)));
        }
        if let Some(ret) = envelope.ret {
            params.push(format!("RET={ret}"));
        }
    }

    params
}

fn rcpt_params(recipient: &Recipient, capabilities: &Capabilities) -> Vec<String> {
    let mut params = Vec::new();

    if capabilities.dsn {
        if recipient.notify.is_explicit() {
            params.push(format!("NOTIFY={}", recipient.notify));
        }
        if let Some(original) = &recipient.original {
            params.push(format!("ORCPT=rfc822;{}", xtext(original)));
        }
    }

    params
}

impl DeliveryEngine {
    /// Runs a transaction for `members` over `context`.
    ///
    /// Returns an error only while no member has an outcome yet, leaving
    /// the caller free to try another host. Once any member has one, a
    /// broken connection defers the members still waiting.
    pub(super) async fn transact(
        &self,
        context: &mut ConnectionContext,
        mailer: &MailerDescriptor,
        envelope: &mut Envelope,
        members: &[usize],
        started: Instant,
    ) -> Result<(), DeliveryError> {
        context.phase = Phase::Transaction;
        let result = self
            .run_transaction(context, mailer, envelope, members, started)
            .await;

        let err = match result {
            Ok(()) => {
                context.record_delivery();
                context.phase = Phase::Ready;
                return Ok(());
            }
            Err(Abort::Refused(err)) => {
                context.phase = if context.client.is_open() {
                    Phase::Ready
                } else {
                    Phase::Closed
                };
                err
            }
            Err(Abort::Broken(err)) => {
                context.client.close().await;
                context.phase = Phase::Closed;
                err
            }
        };

        let untouched = super::pending(envelope, members).len() == members.len();
        if untouched {
            return Err(err);
        }

        debug!(host = %context.host, %err, "Connection lost mid-transaction");
        let requeue = DeliveryError::from(TemporaryError::ConnectionFailed(format!(
            "Connection to {} lost: {err}",
            context.host
        )));
        self.fail_members(envelope, members, &requeue, Some(&context.host), started);
        Ok(())
    }

    async fn run_transaction(
        &self,
        context: &mut ConnectionContext,
        mailer: &MailerDescriptor,
        envelope: &mut Envelope,
        members: &[usize],
        started: Instant,
    ) -> Result<(), Abort> {
        let host = context.host.clone();
        let relay = Some(host.as_str());
        let capabilities = context.client.capabilities().cloned().unwrap_or_default();

        if !capabilities.accepts_size(envelope.size) {
            return Err(Abort::Refused(
                PermanentError::MessageTooLarge {
                    size: envelope.size,
                    limit: capabilities.size.unwrap_or_default(),
                    local: false,
                }
                .into(),
            ));
        }
        if envelope.body_type == BodyType::EightBitMime && !capabilities.eight_bit_mime {
            return Err(Abort::Refused(
                PermanentError::EightBitUnsupported(host.clone()).into(),
            ));
        }
        let Some(body) = envelope.body.clone() else {
            return Err(Abort::Refused(
                SystemError::Software("message body missing".to_string()).into(),
            ));
        };

        let mail = mail_command(
            &envelope.sender_path(),
            &mail_params(envelope, &capabilities),
        );
        let rcpts = members
            .iter()
            .filter_map(|&idx| {
                envelope.recipients().get(idx).map(|recipient| {
                    let path = format!("<{}>", recipient.user);
                    (idx, rcpt_command(&path, &rcpt_params(recipient, &capabilities)))
                })
            })
            .collect::<Vec<_>>();

        // Replies owed by the peer, in the order the commands went out
        let mut outstanding = VecDeque::with_capacity(rcpts.len());
        let mail_reply = if capabilities.pipelining {
            let mut commands = Vec::with_capacity(rcpts.len() + 1);
            commands.push(mail);
            commands.extend(rcpts.iter().map(|(_, command)| command.clone()));
            context.client.send_pipelined(&commands).await?;
            outstanding.extend(rcpts.iter().map(|(idx, _)| *idx));
            context.client.read_response(Step::Mail).await?
        } else {
            context.client.command(&mail, Step::Mail).await?
        };

        if !mail_reply.is_success() {
            for _ in outstanding.drain(..) {
                context.client.read_response(Step::Rcpt).await?;
            }
            context.last_reply = Some(mail_reply.to_reply());
            self.reset(context).await;
            return Err(Abort::Refused(DeliveryError::from_reply(
                mail_reply.to_reply(),
            )));
        }

        let mut accepted = Vec::with_capacity(rcpts.len());
        if capabilities.pipelining {
            while let Some(owner) = outstanding.pop_front() {
                let response = context.client.read_response(Step::Rcpt).await?;
                trace!(recipient = owner, code = response.code, "Correlated pipelined reply");
                if self.recipient_reply(envelope, owner, &response, relay, started) {
                    accepted.push(owner);
                }
            }
        } else {
            for (idx, command) in &rcpts {
                let response = context.client.command(command, Step::Rcpt).await?;
                if self.recipient_reply(envelope, *idx, &response, relay, started) {
                    accepted.push(*idx);
                }
            }
        }

        if accepted.is_empty() {
            self.reset(context).await;
            return Ok(());
        }

        let response = context.client.data().await?;
        if response.code != 354 {
            let err = DeliveryError::from_reply(response.to_reply());
            self.fail_members(envelope, &accepted, &err, relay, started);
            context.last_reply = Some(response.to_reply());
            self.reset(context).await;
            return Ok(());
        }

        context.client.send_body(&body).await?;

        if mailer.flags.lmtp {
            for &idx in &accepted {
                let response = context.client.read_response(Step::DataDone).await?;
                self.finish(envelope, idx, &response, &capabilities, relay, started);
                context.last_reply = Some(response.to_reply());
            }
        } else {
            let response = context.client.read_response(Step::DataDone).await?;
            for &idx in &accepted {
                self.finish(envelope, idx, &response, &capabilities, relay, started);
            }
            context.last_reply = Some(response.to_reply());
        }

        Ok(())
    }

    /// Fails the recipient at `idx` unless its `RCPT` was accepted
    fn recipient_reply(
        &self,
        envelope: &mut Envelope,
        idx: usize,
        response: &Response,
        relay: Option<&str>,
        started: Instant,
    ) -> bool {
        if response.is_success() {
            return true;
        }
        let err = DeliveryError::from_reply(response.to_reply());
        self.fail_members(envelope, &[idx], &err, relay, started);
        false
    }

    /// Records the reply to the end of data for one recipient
    fn finish(
        &self,
        envelope: &mut Envelope,
        idx: usize,
        response: &Response,
        capabilities: &Capabilities,
        relay: Option<&str>,
        started: Instant,
    ) {
        let reply = response.to_reply();
        if !response.is_success() {
            let err = DeliveryError::from_reply(reply);
            self.fail_members(envelope, &[idx], &err, relay, started);
            return;
        }

        if let Some(recipient) = envelope.recipients_mut().get_mut(idx)
            && !capabilities.dsn
            && recipient.notify.wants_any()
        {
            recipient.mark_relayed();
        }
        self.settle(envelope, idx, ExitCode::Ok, &reply, relay, started);
    }

    /// `RSET` so the connection can carry the next transaction, or `QUIT`
    /// if the peer will not have it
    async fn reset(&self, context: &mut ConnectionContext) {
        if !context.client.is_open() {
            return;
        }
        match context.client.rset().await {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                debug!(host = %context.host, %response, "RSET refused");
                context.client.quit().await;
            }
            Err(err) => {
                debug!(host = %context.host, %err, "RSET failed");
                context.client.close().await;
            }
        }
    }
}
