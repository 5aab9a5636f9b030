//! Content-filter checkpoints.
//!
//! An external filter is consulted at fixed phases of a session. Each
//! checkpoint may accept, reject, silently discard, or temporarily refuse
//! what it is shown.

use std::net::SocketAddr;

use async_trait::async_trait;
use tern_common::{Envelope, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Helo,
    Mail,
    Rcpt,
    Data,
    /// The complete message, just before it is handed off
    PreEnqueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Refuse with this permanent reply
    Reject(Reply),
    /// Accept, then deliver nowhere
    Discard,
    /// Refuse with this temporary reply
    TempFail(Reply),
}

/// What a checkpoint gets to inspect
#[derive(Debug)]
pub struct CheckpointContext<'a> {
    pub peer: SocketAddr,
    pub helo: Option<&'a str>,
    /// The command argument for the phase, for example the recipient
    pub argument: Option<&'a str>,
    pub envelope: Option<&'a Envelope>,
}

#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn check(&self, phase: Phase, context: CheckpointContext<'_>) -> Verdict;
}

/// A filter that has nothing to say
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl Checkpoint for AcceptAll {
    async fn check(&self, _phase: Phase, _context: CheckpointContext<'_>) -> Verdict {
        Verdict::Accept
    }
}
