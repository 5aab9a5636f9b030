use std::{net::SocketAddr, time::Duration};

use ahash::AHashMap;
use tern_common::{
    Envelope, Reply, Signal, Status,
    error::SessionError,
    incoming, internal,
    traits::FiniteStateMachine,
    tracing,
};
use tern_security::{SecuritySession, sasl::AttemptLimiter};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Instant,
};

use crate::{
    SmtpArgs, State,
    checkpoint::{CheckpointContext, Phase, Verdict},
    command::Command,
    connection::Connection,
    error::ConnectionError,
    state::SessionFlags,
    throttle::Throttle,
};

mod auth;
mod dispatch;
mod transaction;

/// Longest command line accepted, sized for `AUTH` initial responses
const MAX_COMMAND_LINE: usize = 4096;

/// Longest message line accepted while reading `DATA`
const MAX_DATA_LINE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

enum Input {
    Line(Vec<u8>),
    Shutdown,
    Expired,
    Idle,
    Closed,
    Overlong,
}

/// One inbound SMTP conversation.
///
/// Commands are handled strictly one at a time, so pipelined input simply
/// waits in the connection buffer until the previous reply is written.
pub struct Session<Stream> {
    pub(crate) connection: Connection<Stream>,
    pub(crate) peer: SocketAddr,
    pub(crate) args: SmtpArgs,
    /// Listener supplied values copied into every envelope's macros
    pub(crate) context: AHashMap<String, String>,
    pub(crate) state: State,
    pub(crate) flags: SessionFlags,
    pub(crate) helo: Option<String>,
    pub(crate) envelope: Option<Envelope>,
    pub(crate) security: SecuritySession,
    pub(crate) throttle: Throttle,
    pub(crate) auth_limiter: AttemptLimiter,
    /// Set by `VERB`: deliver before answering the final dot
    pub(crate) verbose: bool,
    started: Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: SocketAddr,
        context: AHashMap<String, String>,
        args: SmtpArgs,
    ) -> Self {
        let flags = SessionFlags {
            helo_required: args.helo_required,
            ..SessionFlags::default()
        };

        Self {
            connection: Connection::new(stream),
            peer,
            context,
            state: State::default(),
            flags,
            helo: None,
            envelope: None,
            security: SecuritySession::plain(),
            throttle: Throttle::new(args.throttle.clone()),
            auth_limiter: AttemptLimiter::new(args.auth_attempts),
            verbose: false,
            started: Instant::now(),
            args,
        }
    }

    /// Drives the conversation until either side closes it.
    ///
    /// # Errors
    /// When the connection fails or a timeout expires
    #[tracing::instrument(level = "trace", skip_all, fields(peer = %self.peer))]
    pub async fn serve(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected");

        let result = self.converse(&mut signal).await;
        if let Err(err) = &result {
            tracing::warn!(peer = %self.peer, state = %self.state, "Session ended: {err}");
        }

        internal!("Connection closed");
        result
    }

    async fn converse(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let load = self
            .args
            .load_source
            .as_ref()
            .map_or(0, |source| source.load());
        if self.args.load.refuse_connections(load, self.args.rate.record()) {
            tracing::warn!(peer = %self.peer, load, "Refusing connection under load");
            self.send(&Reply::from_parts(
                421,
                "4.3.2",
                format!("{} Too busy, try again later", self.args.hostname),
            ))
            .await?;
            return Ok(());
        }

        match self.checkpoint(Phase::Connect, None).await {
            Verdict::Reject(reply) | Verdict::TempFail(reply) => {
                self.send(&reply).await?;
                return Ok(());
            }
            Verdict::Accept | Verdict::Discard => {}
        }

        self.send(&Reply::new(
            Status::ServiceReady,
            None,
            format!("{} ESMTP tern ready", self.args.hostname),
        ))
        .await?;

        let lifetime = Duration::from_secs(self.args.timeouts.connection_secs);
        let deadline = self.started + lifetime;

        loop {
            let command_timeout = Duration::from_secs(self.args.timeouts.command_secs);

            let input = tokio::select! {
                _ = signal.recv() => Input::Shutdown,
                () = tokio::time::sleep_until(deadline) => Input::Expired,
                read = tokio::time::timeout(command_timeout, self.connection.read_line(MAX_COMMAND_LINE)) => {
                    match read {
                        Err(_) => Input::Idle,
                        Ok(Ok(Some(line))) => Input::Line(line),
                        Ok(Ok(None)) => Input::Closed,
                        Ok(Err(ConnectionError::LineTooLong(_))) => Input::Overlong,
                        Ok(Err(err)) => return Err(SessionError::Protocol(err.to_string())),
                    }
                }
            };

            match input {
                Input::Line(line) => {
                    if self.dispatch(&line).await? == Flow::Close {
                        return Ok(());
                    }
                }
                Input::Overlong => {
                    let reply = Reply::from_parts(500, "5.5.2", "Line too long");
                    if self.reject(&reply).await? == Flow::Close {
                        return Ok(());
                    }
                }
                Input::Shutdown => {
                    self.abandon("server shutting down");
                    self.send(&Reply::from_parts(
                        421,
                        "4.3.2",
                        format!("{} Server shutting down", self.args.hostname),
                    ))
                    .await?;
                    return Ok(());
                }
                Input::Idle => {
                    self.abandon("timeout waiting for input");
                    self.send(&Reply::from_parts(
                        421,
                        "4.4.2",
                        format!("{} Timeout waiting for input", self.args.hostname),
                    ))
                    .await?;
                    return Err(SessionError::Timeout(self.args.timeouts.command_secs));
                }
                Input::Expired => {
                    self.abandon("connection lifetime exceeded");
                    self.send(&Reply::from_parts(
                        421,
                        "4.4.2",
                        format!("{} Connection lifetime exceeded", self.args.hostname),
                    ))
                    .await?;
                    return Err(SessionError::Timeout(self.args.timeouts.connection_secs));
                }
                Input::Closed => {
                    self.abandon("connection closed by peer");
                    return Ok(());
                }
            }
        }
    }

    /// Parses and answers one command line
    async fn dispatch(&mut self, raw: &[u8]) -> Result<Flow, SessionError> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim_end_matches(['\r', '\n']);

        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(err) => {
                incoming!("{text}");
                return self.reject(&err.reply()).await;
            }
        };
        incoming!("{command}");

        if let Some(delay) = self.throttle.command(command.verb()) {
            tracing::debug!(peer = %self.peer, verb = %command.verb(), ?delay, "Throttling");
            tokio::time::sleep(delay).await;
        }

        if let Err(reply) = self.state.check(&command, &self.flags) {
            return self.reject(&reply).await;
        }

        self.handle(&command).await
    }

    /// Moves the session along after a successful command
    pub(crate) fn advance(&mut self, command: &Command) {
        let previous = self.state;
        self.state = self.state.transition(command, &mut self.flags);
        if previous != self.state {
            tracing::trace!(from = %previous, to = %self.state, "Transition");
        }
    }

    pub(crate) async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        self.connection.send(reply).await.map_err(|err| {
            internal!(level = ERROR, "{err}");
            SessionError::Protocol(format!("Failed to send response: {err}"))
        })
    }

    pub(crate) async fn send_lines(
        &mut self,
        code: u32,
        lines: &[String],
    ) -> Result<(), SessionError> {
        self.connection.send_lines(code, lines).await.map_err(|err| {
            internal!(level = ERROR, "{err}");
            SessionError::Protocol(format!("Failed to send response: {err}"))
        })
    }

    /// Answers a command and keeps going
    pub(crate) async fn reply(&mut self, reply: &Reply) -> Result<Flow, SessionError> {
        self.send(reply).await?;
        Ok(Flow::Continue)
    }

    /// Answers a bad command, closing the session once too many were seen
    pub(crate) async fn reject(&mut self, reply: &Reply) -> Result<Flow, SessionError> {
        self.send(reply).await?;

        if let Some(closing) = self.throttle.bad_command(&self.args.hostname) {
            tracing::warn!(
                peer = %self.peer,
                count = self.throttle.bad_commands(),
                "Too many bad commands"
            );
            self.abandon("too many bad commands");
            self.send(&closing).await?;
            return Ok(Flow::Close);
        }

        Ok(Flow::Continue)
    }

    pub(crate) async fn checkpoint(&self, phase: Phase, argument: Option<&str>) -> Verdict {
        let Some(checkpoint) = self.args.checkpoint.as_ref() else {
            return Verdict::Accept;
        };

        let verdict = checkpoint
            .check(
                phase,
                CheckpointContext {
                    peer: self.peer,
                    helo: self.helo.as_deref(),
                    argument,
                    envelope: self.envelope.as_ref(),
                },
            )
            .await;

        if verdict != Verdict::Accept {
            tracing::info!(peer = %self.peer, ?phase, ?verdict, "Checkpoint verdict");
        }
        verdict
    }

    /// Drops the open transaction, logging recipients that were accepted
    /// but never got a message
    pub(crate) fn abandon(&mut self, reason: &str) {
        if let Some(envelope) = self.envelope.take()
            && !envelope.recipients().is_empty()
        {
            tracing::info!(
                envelope = %envelope.id(),
                sender = %envelope.sender_path(),
                recipients = envelope.recipients().len(),
                "Lost input channel from {}: {reason}",
                self.peer,
            );
        }
        self.throttle.reset_transaction();
    }
}
