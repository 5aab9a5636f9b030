//! The client side of an SMTP or LMTP conversation, as used by delivery.

use std::{net::SocketAddr, time::Duration};

use tern_common::{config::ClientTimeouts, tracing};
use tern_security::{
    ClientTlsContext, SaslError, SecuritySession, TlsError, TlsaRecord,
    sasl::{self, ClientExchange, Credentials},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::client::TlsStream;

use super::{capabilities::Capabilities, response::Response};
use crate::error::{ClientError, ClientResult};

/// Initial size of the read buffer for replies.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// A protocol step, selecting the timeout that bounds its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Greeting,
    Helo,
    StartTls,
    Auth,
    Mail,
    Rcpt,
    Data,
    DataDone,
    Rset,
    Quit,
}

impl Step {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Helo => "HELO",
            Self::StartTls => "STARTTLS",
            Self::Auth => "AUTH",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::DataDone => "end of data",
            Self::Rset => "RSET",
            Self::Quit => "QUIT",
        }
    }

    const fn timeout(self, timeouts: &ClientTimeouts) -> Duration {
        match self {
            Self::Greeting => timeouts.greeting(),
            Self::Helo | Self::Rset => timeouts.helo(),
            Self::StartTls => timeouts.starttls(),
            Self::Auth => timeouts.auth(),
            Self::Mail => timeouts.mail(),
            Self::Rcpt => timeouts.rcpt(),
            Self::Data => timeouts.data_init(),
            Self::DataDone => timeouts.data_done(),
            Self::Quit => timeouts.quit(),
        }
    }
}

/// The byte stream under the client, plain or encrypted.
enum Channel<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Channel<S> {
    async fn send(&mut self, data: &[u8]) -> ClientResult<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> ClientResult<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn shutdown(&mut self) {
        let result = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        };
        if let Err(err) = result {
            tracing::trace!(%err, "Ignoring error while closing channel");
        }
    }
}

/// Dot-stuffs a message body and terminates it, normalising bare `LF`
/// line endings to `CRLF` on the way.
pub fn encode_body(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 64 + 5);
    let mut line_start = true;
    let mut previous = 0u8;

    for &byte in body {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        line_start = byte == b'\n';
        previous = byte;
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// One outbound SMTP/LMTP connection.
///
/// Capabilities are only known between a successful `EHLO`/`LHLO` and the
/// next activation of a security layer; [`SmtpClient::capabilities`]
/// returns `None` outside that window.
pub struct SmtpClient<S = TcpStream> {
    channel: Option<Channel<S>>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    peer: String,
    timeouts: ClientTimeouts,
    capabilities: Option<Capabilities>,
    security: SecuritySession,
}

impl<S> core::fmt::Debug for SmtpClient<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmtpClient")
            .field("peer", &self.peer)
            .field("open", &self.channel.is_some())
            .field("capabilities", &self.capabilities)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl SmtpClient<TcpStream> {
    /// Opens a TCP connection to `addr`, giving up after `limit`.
    ///
    /// # Errors
    /// [`ClientError::Timeout`] when the peer does not accept in time, or
    /// the I/O error of a refused connection.
    pub async fn connect(
        addr: SocketAddr,
        peer: impl Into<String>,
        timeouts: ClientTimeouts,
        limit: Duration,
    ) -> ClientResult<Self> {
        let stream = tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout("connect"))??;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%err, "Unable to disable Nagle");
        }

        Ok(Self::new(stream, peer, timeouts))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SmtpClient<S> {
    pub fn new(stream: S, peer: impl Into<String>, timeouts: ClientTimeouts) -> Self {
        Self {
            channel: Some(Channel::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            peer: peer.into(),
            timeouts,
            capabilities: None,
            security: SecuritySession::plain(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub const fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self.channel, Some(Channel::Tls(_)))
    }

    pub const fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub const fn security(&self) -> &SecuritySession {
        &self.security
    }

    pub const fn security_mut(&mut self) -> &mut SecuritySession {
        &mut self.security
    }

    pub const fn timeouts(&self) -> &ClientTimeouts {
        &self.timeouts
    }

    fn channel(&mut self) -> ClientResult<&mut Channel<S>> {
        self.channel.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    /// Reads the `220` banner
    ///
    /// # Errors
    /// If the banner cannot be read in time
    pub async fn read_greeting(&mut self) -> ClientResult<Response> {
        self.read_response(Step::Greeting).await
    }

    /// Writes one command line without waiting for its reply
    ///
    /// # Errors
    /// If the write fails
    pub async fn send_command(&mut self, command: &str) -> ClientResult<()> {
        tracing::trace!(peer = %self.peer, "C: {command}");
        let data = format!("{command}\r\n");
        self.channel()?.send(data.as_bytes()).await
    }

    /// Writes several command lines in one go, as a pipelined group
    ///
    /// # Errors
    /// If the write fails
    pub async fn send_pipelined(&mut self, commands: &[String]) -> ClientResult<()> {
        let mut data = String::new();
        for command in commands {
            tracing::trace!(peer = %self.peer, "C: {command}");
            data.push_str(command);
            data.push_str("\r\n");
        }
        self.channel()?.send(data.as_bytes()).await
    }

    /// Sends a command and reads its reply
    ///
    /// # Errors
    /// If the command cannot be written or no reply arrives in time
    pub async fn command(&mut self, command: &str, step: Step) -> ClientResult<Response> {
        self.send_command(command).await?;
        self.read_response(step).await
    }

    /// `EHLO`, remembering the advertised capabilities on success
    ///
    /// # Errors
    /// See [`SmtpClient::command`]
    pub async fn ehlo(&mut self, domain: &str) -> ClientResult<Response> {
        let response = self.command(&format!("EHLO {domain}"), Step::Helo).await?;
        if response.is_success() {
            self.capabilities = Some(Capabilities::parse(&response));
        }
        Ok(response)
    }

    /// `LHLO`, the LMTP greeting
    ///
    /// # Errors
    /// See [`SmtpClient::command`]
    pub async fn lhlo(&mut self, domain: &str) -> ClientResult<Response> {
        let response = self.command(&format!("LHLO {domain}"), Step::Helo).await?;
        if response.is_success() {
            self.capabilities = Some(Capabilities::parse(&response));
        }
        Ok(response)
    }

    /// `HELO`; a plain SMTP peer has no extensions
    ///
    /// # Errors
    /// See [`SmtpClient::command`]
    pub async fn helo(&mut self, domain: &str) -> ClientResult<Response> {
        let response = self.command(&format!("HELO {domain}"), Step::Helo).await?;
        if response.is_success() {
            self.capabilities = Some(Capabilities::default());
        }
        Ok(response)
    }

    /// Issues `STARTTLS` and, if the peer agrees, performs the handshake.
    ///
    /// A refusal is returned as the peer's response with the channel left
    /// in clear text. After a handshake the capabilities are forgotten and
    /// the caller has to greet again.
    ///
    /// # Errors
    /// [`ClientError::Tls`] when the handshake fails; the channel is gone
    /// afterwards.
    pub async fn starttls(
        &mut self,
        context: &ClientTlsContext,
        tlsa: Option<&[TlsaRecord]>,
    ) -> ClientResult<Response> {
        let response = self.command("STARTTLS", Step::StartTls).await?;
        if response.code != 220 {
            return Ok(response);
        }

        let stream = match self.channel.take() {
            Some(Channel::Plain(stream)) => stream,
            Some(tls @ Channel::Tls(_)) => {
                self.channel = Some(tls);
                return Err(ClientError::Tls(TlsError::Handshake(
                    "TLS already active".to_string(),
                )));
            }
            None => return Err(ClientError::ConnectionClosed),
        };

        // Nothing read before the handshake may be trusted afterwards
        self.buffer_pos = 0;
        self.capabilities = None;

        let (stream, security) = context
            .connect(stream, &self.peer, tlsa, self.timeouts.starttls())
            .await?;

        self.channel = Some(Channel::Tls(Box::new(stream)));
        self.security = security;

        Ok(response)
    }

    /// Authenticates with the first mechanism both sides support.
    ///
    /// Returns the final reply; `235` means success. Plaintext mechanisms
    /// are refused unless the channel is encrypted.
    ///
    /// # Errors
    /// [`ClientError::Sasl`] when no mechanism fits or the exchange breaks
    /// down; I/O and timeout errors as for any command.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> ClientResult<Response> {
        let offered = self
            .capabilities
            .as_ref()
            .map(|capabilities| capabilities.auth.clone())
            .unwrap_or_default();

        let mechanism = sasl::choose(&offered, &credentials.mechanisms)
            .ok_or_else(|| SaslError::UnsupportedMechanism(offered.join(" ")))?;
        if mechanism.is_plaintext() && !self.security.is_encrypted() {
            return Err(SaslError::UnsupportedMechanism(format!(
                "{mechanism} over an unencrypted channel"
            ))
            .into());
        }

        let mut exchange = ClientExchange::new(mechanism, credentials);
        let mut line = match exchange.initial_response() {
            Some(initial) if initial.is_empty() => format!("AUTH {mechanism} ="),
            Some(initial) => format!("AUTH {mechanism} {initial}"),
            None => format!("AUTH {mechanism}"),
        };

        loop {
            let response = self.command(&line, Step::Auth).await?;
            if response.code != 334 {
                if response.code == 235
                    && self.security.authenticate(mechanism, credentials.username.clone())
                {
                    self.capabilities = None;
                }
                return Ok(response);
            }

            let challenge = response.lines.last().map_or("", String::as_str);
            match exchange.respond(challenge) {
                Ok(answer) => line = answer,
                Err(err) => {
                    // Cancel, then wait for the peer to acknowledge
                    self.command("*", Step::Auth).await?;
                    return Err(err.into());
                }
            }
        }
    }

    /// `MAIL FROM` with already formatted parameters
    ///
    /// # Errors
    /// See [`SmtpClient::command`]
    pub async fn mail_from(&mut self, path: &str, params: &[String]) -> ClientResult<Response> {
        self.command(&mail_command(path, params), Step::Mail).await
    }

    /// `RCPT TO` with already formatted parameters
    ///
    /// # Errors
    /// See [`SmtpClient::command`]
    pub async fn rcpt_to(&mut self, path: &str, params: &[String]) -> ClientResult<Response> {
        self.command(&rcpt_command(path, params), Step::Rcpt).await
    }

    /// # Errors
    /// See [`SmtpClient::command`]
    pub async fn data(&mut self) -> ClientResult<Response> {
        self.command("DATA", Step::Data).await
    }

    /// Sends the message body and the terminating dot, without reading
    /// the reply (LMTP peers answer once per recipient).
    ///
    /// # Errors
    /// [`ClientError::Timeout`] if the peer stops reading
    pub async fn send_body(&mut self, body: &[u8]) -> ClientResult<()> {
        let encoded = encode_body(body);
        let timeout = self.timeouts.data_block();

        for chunk in encoded.chunks(BUFFER_SIZE) {
            let channel = self.channel()?;
            tokio::time::timeout(timeout, channel.send(chunk))
                .await
                .map_err(|_| ClientError::Timeout("message body"))??;
        }

        Ok(())
    }

    /// # Errors
    /// See [`SmtpClient::command`]
    pub async fn rset(&mut self) -> ClientResult<Response> {
        self.command("RSET", Step::Rset).await
    }

    /// Says goodbye and closes the channel. Errors are logged, not
    /// returned: the connection is finished either way.
    pub async fn quit(&mut self) {
        if self.channel.is_none() {
            return;
        }
        if let Err(err) = self.command("QUIT", Step::Quit).await {
            tracing::debug!(peer = %self.peer, %err, "QUIT failed");
        }
        self.close().await;
    }

    /// Closes the channel without `QUIT`
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.shutdown().await;
        }
        self.capabilities = None;
    }

    /// Reads a complete reply, waiting at most the timeout of `step`
    ///
    /// # Errors
    /// [`ClientError::Timeout`] naming the step, parse errors, or
    /// [`ClientError::ConnectionClosed`]
    pub async fn read_response(&mut self, step: Step) -> ClientResult<Response> {
        let timeout = step.timeout(&self.timeouts);
        let response = tokio::time::timeout(timeout, self.next_response())
            .await
            .map_err(|_| ClientError::Timeout(step.name()))?;

        match &response {
            Ok(response) => tracing::trace!(peer = %self.peer, "S: {response}"),
            Err(err) if err.is_fatal() => self.channel = None,
            Err(_) => {}
        }
        response
    }

    async fn next_response(&mut self) -> ClientResult<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let pos = self.buffer_pos;
            let channel = self.channel.as_mut().ok_or(ClientError::ConnectionClosed)?;
            let n = channel.read(&mut self.buffer[pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Formats `MAIL FROM:<path> params...`
pub fn mail_command(path: &str, params: &[String]) -> String {
    with_params(format!("MAIL FROM:{path}"), params)
}

/// Formats `RCPT TO:<path> params...`
pub fn rcpt_command(path: &str, params: &[String]) -> String {
    with_params(format!("RCPT TO:{path}"), params)
}

fn with_params(mut command: String, params: &[String]) -> String {
    for param in params {
        command.push(' ');
        command.push_str(param);
    }
    command
}
