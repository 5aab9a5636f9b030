use core::fmt::{self, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    address::Address, dsn::DsnNotify, exit::ExitCode, mailer::MailerDescriptor,
    status::EnhancedStatus,
};

/// Delivery state of a single recipient.
///
/// The ordering of the variants is the order in which a recipient normally
/// progresses; [`Recipient::transition`] refuses to move backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecipientState {
    #[default]
    Unprocessed,
    Ok,
    QueuedRetry,
    Sent,
    Bad,
    Discarded,
}

impl RecipientState {
    /// States that can never be left again
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Sent | Self::Bad | Self::Discarded)
    }

    /// States that still need a delivery attempt
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Unprocessed | Self::Ok | Self::QueuedRetry)
    }
}

impl Display for RecipientState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unprocessed => "unprocessed",
            Self::Ok => "ok",
            Self::QueuedRetry => "queued",
            Self::Sent => "sent",
            Self::Bad => "bad",
            Self::Discarded => "discarded",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub address: Address,
    pub mailer: Arc<MailerDescriptor>,
    /// Destination host field, possibly a `,` separated list of hosts
    pub host: String,
    /// Mailbox as passed to the mailer
    pub user: String,
    pub notify: DsnNotify,
    /// Original recipient (`ORCPT=`) if one was given
    pub original: Option<String>,
    /// Identity responsible for this recipient, used for envelope splitting
    /// and as the identity of local programs
    pub owner: Option<String>,
    state: RecipientState,
    status: Option<EnhancedStatus>,
    exit: Option<ExitCode>,
    diagnostic: Option<String>,
    relayed: bool,
    /// Host that accepted (or last refused) this recipient
    pub delivered_via: Option<String>,
}

impl Recipient {
    pub fn new(address: Address, mailer: Arc<MailerDescriptor>, host: impl Into<String>) -> Self {
        let user = address.to_string();

        Self {
            address,
            mailer,
            host: host.into(),
            user,
            notify: DsnNotify::default(),
            original: None,
            owner: None,
            state: RecipientState::Unprocessed,
            status: None,
            exit: None,
            diagnostic: None,
            relayed: false,
            delivered_via: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    #[must_use]
    pub const fn with_notify(mut self, notify: DsnNotify) -> Self {
        self.notify = notify;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub const fn state(&self) -> RecipientState {
        self.state
    }

    pub const fn status(&self) -> Option<EnhancedStatus> {
        self.status
    }

    pub const fn exit(&self) -> Option<ExitCode> {
        self.exit
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub const fn relayed(&self) -> bool {
        self.relayed
    }

    pub const fn mark_relayed(&mut self) {
        self.relayed = true;
    }

    /// Moves the recipient to `next`.
    ///
    /// Returns `false` (leaving the recipient untouched) when the move would
    /// leave a final state or go backwards, for example marking a `Sent`
    /// recipient as `Bad`.
    pub fn transition(&mut self, next: RecipientState) -> bool {
        let allowed = match (self.state, next) {
            (current, _) if current.is_final() => false,
            (RecipientState::QueuedRetry, RecipientState::Ok | RecipientState::Unprocessed) => {
                false
            }
            (current, next) => next >= current || next.is_final(),
        };

        if allowed {
            self.state = next;
        }

        allowed
    }

    /// Records the outcome that caused the last transition.
    ///
    /// The enhanced code is only replaced if [`EnhancedStatus::should_replace`]
    /// agrees, so a permanent code is never masked by a later temporary one.
    pub fn record(
        &mut self,
        exit: ExitCode,
        status: EnhancedStatus,
        diagnostic: Option<String>,
        force: bool,
    ) {
        if EnhancedStatus::should_replace(self.status, status, force) {
            self.status = Some(status);
        }
        self.exit = Some(exit);
        if diagnostic.is_some() {
            self.diagnostic = diagnostic;
        }
    }

    /// Starts a new attempt; recipients left over from an earlier deferred
    /// attempt are picked up again.
    pub fn reset_for_attempt(&mut self) {
        if matches!(
            self.state,
            RecipientState::Unprocessed | RecipientState::QueuedRetry
        ) {
            self.state = RecipientState::Ok;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn recipient() -> Recipient {
        Recipient::new(
            Address::parse("user@example.com").unwrap(),
            Arc::new(MailerDescriptor::esmtp("esmtp")),
            "example.com",
        )
    }

    #[test]
    fn sent_never_regresses() {
        let mut rcpt = recipient();
        assert!(rcpt.transition(RecipientState::Ok));
        assert!(rcpt.transition(RecipientState::Sent));

        assert!(!rcpt.transition(RecipientState::Bad));
        assert!(!rcpt.transition(RecipientState::QueuedRetry));
        assert!(!rcpt.transition(RecipientState::Ok));
        assert_eq!(rcpt.state(), RecipientState::Sent);
    }

    #[test]
    fn queued_may_still_succeed() {
        let mut rcpt = recipient();
        rcpt.reset_for_attempt();
        assert!(rcpt.transition(RecipientState::QueuedRetry));
        assert!(!rcpt.transition(RecipientState::Ok));
        assert!(rcpt.transition(RecipientState::Sent));
    }

    #[test]
    fn discarded_is_final() {
        let mut rcpt = recipient();
        assert!(rcpt.transition(RecipientState::Discarded));
        assert!(!rcpt.transition(RecipientState::Sent));
    }

    #[test]
    fn permanent_status_sticks() {
        let mut rcpt = recipient();
        rcpt.record(
            ExitCode::NoUser,
            EnhancedStatus::BAD_MAILBOX,
            Some("550 5.1.1 unknown".to_string()),
            false,
        );
        rcpt.record(ExitCode::TempFail, EnhancedStatus::TEMPFAIL, None, false);

        assert_eq!(rcpt.status(), Some(EnhancedStatus::BAD_MAILBOX));
        assert_eq!(rcpt.exit(), Some(ExitCode::TempFail));
        assert_eq!(rcpt.diagnostic(), Some("550 5.1.1 unknown"));
    }

    #[test]
    fn reset_only_touches_pending() {
        let mut rcpt = recipient();
        rcpt.transition(RecipientState::Bad);
        rcpt.reset_for_attempt();
        assert_eq!(rcpt.state(), RecipientState::Bad);
    }
}
