//! Turning delivery outcomes into recipient dispositions.
//!
//! Every outcome ends up as an [`ExitCode`] and a [`Reply`]. The formatter
//! applies them to the recipient (state, enhanced code, diagnostic), writes
//! one structured log record per terminal disposition and passes the
//! disposition on to the configured [`DispositionSink`].

use core::fmt;
use std::sync::Arc;

use tern_common::{
    EnhancedStatus, ExitCode, Recipient, RecipientState, Reply,
    traits::{Disposition, DispositionSink},
};
use tokio::time::Instant;
use tracing::{info, warn};
use ulid::Ulid;

use crate::error::DeliveryError;

/// The `stat` field of a disposition record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Sent,
    Deferred,
    Bounced,
    Discarded,
}

impl Stat {
    pub const fn of(state: RecipientState) -> Option<Self> {
        match state {
            RecipientState::Sent => Some(Self::Sent),
            RecipientState::QueuedRetry => Some(Self::Deferred),
            RecipientState::Bad => Some(Self::Bounced),
            RecipientState::Discarded => Some(Self::Discarded),
            RecipientState::Unprocessed | RecipientState::Ok => None,
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sent => "Sent",
            Self::Deferred => "Deferred",
            Self::Bounced => "Bounced",
            Self::Discarded => "Discarded",
        })
    }
}

/// Where a recipient's outcome came from.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub envelope: Ulid,
    /// Host that produced the reply, if one was contacted
    pub relay: Option<&'a str>,
    /// When the attempt on the envelope started
    pub started: Instant,
}

#[derive(Clone, Default)]
pub struct ErrorResponseFormatter {
    sink: Option<Arc<dyn DispositionSink>>,
}

impl fmt::Debug for ErrorResponseFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorResponseFormatter")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// The state an outcome moves a recipient to
pub const fn state_for(exit: ExitCode) -> RecipientState {
    match exit {
        ExitCode::Ok => RecipientState::Sent,
        exit if exit.should_requeue() => RecipientState::QueuedRetry,
        _ => RecipientState::Bad,
    }
}

impl ErrorResponseFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DispositionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Records `exit` and `reply` against `recipient`.
    ///
    /// Returns `false` when the recipient already reached a state the
    /// outcome may not replace, e.g. a `Sent` recipient being failed again;
    /// nothing is recorded or logged in that case.
    pub fn mark(
        &self,
        ctx: Context<'_>,
        recipient: &mut Recipient,
        exit: ExitCode,
        reply: &Reply,
    ) -> bool {
        if !recipient.transition(state_for(exit)) {
            return false;
        }

        let status = if exit == ExitCode::Ok
            && recipient.mailer.flags.local
            && recipient.notify.success
        {
            EnhancedStatus::DELIVERED_LOCALLY
        } else {
            match reply.enhanced {
                Some(status) if status.class == class_of(exit, reply) => status,
                _ => exit.default_status(),
            }
        };

        recipient.record(exit, status, Some(reply.to_string()), false);
        if let Some(relay) = ctx.relay {
            recipient.delivered_via = Some(relay.to_string());
        }

        self.emit(ctx, recipient, reply);
        true
    }

    /// Records a failed attempt
    pub fn fail(&self, ctx: Context<'_>, recipient: &mut Recipient, err: &DeliveryError) -> bool {
        self.mark(ctx, recipient, err.exit_code(), &err.reply())
    }

    /// Records a successful hand-off
    pub fn sent(&self, ctx: Context<'_>, recipient: &mut Recipient, reply: &Reply) -> bool {
        self.mark(ctx, recipient, ExitCode::Ok, reply)
    }

    /// Drops a recipient of a discarded envelope
    pub fn discard(&self, ctx: Context<'_>, recipient: &mut Recipient) -> bool {
        if !recipient.transition(RecipientState::Discarded) {
            return false;
        }
        let reply = Reply::from_parts(250, "2.0.0", "Discarded");
        recipient.record(ExitCode::Ok, EnhancedStatus::SENT, Some(reply.to_string()), true);
        self.emit(ctx, recipient, &reply);
        true
    }

    fn emit(&self, ctx: Context<'_>, recipient: &Recipient, reply: &Reply) {
        let state = recipient.state();
        let Some(stat) = Stat::of(state) else {
            return;
        };

        let elapsed = ctx.started.elapsed();
        let status = recipient
            .status()
            .unwrap_or_else(|| recipient.exit().unwrap_or(ExitCode::Ok).default_status());
        let relay = ctx.relay.unwrap_or(recipient.host.as_str());

        match stat {
            Stat::Sent | Stat::Discarded => info!(
                envelope = %ctx.envelope,
                recipient = %recipient.address,
                mailer = %recipient.mailer.name,
                relay,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                reply = %reply,
                dsn = %status,
                stat = %stat,
                relayed = recipient.relayed(),
                "Recipient disposition"
            ),
            Stat::Deferred | Stat::Bounced => warn!(
                envelope = %ctx.envelope,
                recipient = %recipient.address,
                mailer = %recipient.mailer.name,
                relay,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                reply = %reply,
                dsn = %status,
                stat = %stat,
                "Recipient disposition"
            ),
        }

        if let Some(sink) = &self.sink {
            sink.disposition(&Disposition {
                envelope: ctx.envelope,
                recipient: recipient.address.to_string(),
                mailer: recipient.mailer.name.clone(),
                relay: ctx.relay.map(ToString::to_string),
                state,
                reply: reply.clone(),
                status,
                elapsed,
                relayed: recipient.relayed(),
            });
        }
    }
}

/// The class digit an enhanced code must carry to describe `exit`
fn class_of(exit: ExitCode, reply: &Reply) -> u8 {
    match exit {
        ExitCode::Ok => 2,
        exit if exit.should_requeue() => 4,
        _ if reply.status.is_temporary() => 4,
        _ => 5,
    }
}
