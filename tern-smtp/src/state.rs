use core::fmt::{self, Display, Formatter};

use tern_common::{EnhancedStatus, Reply, Status, traits::FiniteStateMachine};

use crate::command::Command;

/// Position of a session in the command sequence.
///
/// `STARTTLS` and `AUTH` are side transitions out of [`State::Ready`]; they
/// never start a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Init,
    Ready,
    Mail,
    Rcpt,
    Data,
}

impl State {
    pub const fn in_transaction(self) -> bool {
        matches!(self, Self::Mail | Self::Rcpt | Self::Data)
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Ready => "READY",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
        })
    }
}

/// What the sequence rules need to know about the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Each flag is an independent fact about the session"
)]
pub struct SessionFlags {
    pub greeted: bool,
    pub extended: bool,
    pub helo_required: bool,
    pub tls_active: bool,
    pub authenticated: bool,
    pub recipients: usize,
}

fn sequence(text: &str) -> Reply {
    Reply::new(
        Status::InvalidCommandSequence,
        Some(EnhancedStatus::new(5, 5, 1)),
        text,
    )
}

fn sequence_generic(text: &str) -> Reply {
    Reply::new(
        Status::InvalidCommandSequence,
        Some(EnhancedStatus::new(5, 0, 0)),
        text,
    )
}

impl FiniteStateMachine for State {
    type Input = Command;
    type Context = SessionFlags;
    type Error = Reply;

    fn check(&self, input: &Command, ctx: &SessionFlags) -> Result<(), Reply> {
        match (self, input) {
            (Self::Init, Command::Mail { .. }) if ctx.helo_required => {
                Err(sequence_generic("Polite people say HELO first"))
            }
            (Self::Init | Self::Ready, Command::Mail { .. }) => Ok(()),
            (Self::Mail | Self::Rcpt, Command::Mail { .. }) => {
                Err(sequence("Sender already specified"))
            }

            (Self::Mail | Self::Rcpt, Command::Rcpt { .. }) => Ok(()),
            (_, Command::Rcpt { .. }) => Err(sequence_generic("Need MAIL before RCPT")),

            (Self::Rcpt, Command::Data) if ctx.recipients > 0 => Ok(()),
            (Self::Mail | Self::Rcpt, Command::Data) => {
                Err(sequence_generic("Need RCPT (recipient)"))
            }
            (_, Command::Data) => Err(sequence_generic("Need MAIL command")),

            (_, Command::StartTls) if ctx.tls_active => {
                Err(sequence_generic("TLS already active"))
            }
            (Self::Ready, Command::StartTls) if ctx.extended => Ok(()),
            (_, Command::StartTls) => Err(sequence_generic("STARTTLS not permitted now")),

            (_, Command::Auth { .. }) if ctx.authenticated => {
                Err(sequence_generic("Already Authenticated"))
            }
            (Self::Ready, Command::Auth { .. }) if ctx.extended => Ok(()),
            (_, Command::Auth { .. }) => Err(sequence_generic("AUTH not permitted now")),

            (state, Command::Etrn(_)) if state.in_transaction() => {
                Err(sequence_generic("Transaction in progress"))
            }
            (Self::Init, Command::Etrn(_)) if ctx.helo_required => {
                Err(sequence_generic("Polite people say HELO first"))
            }

            _ => Ok(()),
        }
    }

    fn transition(self, input: &Command, ctx: &mut SessionFlags) -> Self {
        match input {
            Command::Helo(_) => {
                ctx.greeted = true;
                ctx.extended = false;
                ctx.recipients = 0;
                Self::Ready
            }
            Command::Ehlo(_) => {
                ctx.greeted = true;
                ctx.extended = true;
                ctx.recipients = 0;
                Self::Ready
            }
            Command::Mail { .. } => {
                ctx.recipients = 0;
                Self::Mail
            }
            Command::Rcpt { .. } => {
                ctx.recipients += 1;
                Self::Rcpt
            }
            Command::Data => Self::Data,
            Command::Rset => {
                ctx.recipients = 0;
                if ctx.greeted { Self::Ready } else { Self::Init }
            }
            Command::StartTls => {
                ctx.greeted = false;
                ctx.extended = false;
                ctx.tls_active = true;
                Self::Init
            }
            Command::Auth { .. } => {
                ctx.authenticated = true;
                self
            }
            _ => self,
        }
    }
}
