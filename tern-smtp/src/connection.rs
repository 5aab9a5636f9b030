use std::{fmt::Write, time::Duration};

use tern_common::{outgoing, tracing};
use tern_security::{ServerTlsContext, TlsError, TlsInfo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::server::TlsStream;

use crate::error::{ConnectionError, ConnectionResult};

const READ_CHUNK: usize = 8192;

enum Channel<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Lost during a failed handshake
    Closed,
}

/// The server's side of one inbound connection.
///
/// Reads are line oriented. Bytes that arrive after a complete line stay in
/// the buffer for the next read, which is what makes pipelining work.
pub struct Connection<Stream> {
    channel: Channel<Stream>,
    buffer: Vec<u8>,
    /// Skipping the rest of an overlong line
    discarding: bool,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub const fn new(stream: Stream) -> Self {
        Self {
            channel: Channel::Plain(stream),
            buffer: Vec::new(),
            discarding: false,
        }
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self.channel, Channel::Tls(_))
    }

    /// Whether the client has already sent more than we have read
    pub fn has_pending_input(&self) -> bool {
        !self.buffer.is_empty()
    }

    async fn fill(&mut self) -> ConnectionResult<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = match &mut self.channel {
            Channel::Plain(stream) => stream.read(&mut chunk).await?,
            Channel::Tls(stream) => stream.read(&mut chunk).await?,
            Channel::Closed => return Err(ConnectionError::Closed),
        };
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Reads one line, terminator included.
    ///
    /// Returns `None` once the peer has closed the connection and nothing
    /// is left to read.
    ///
    /// # Errors
    /// [`ConnectionError::LineTooLong`] when no terminator arrives within
    /// `limit` bytes. The rest of that line is skipped, so the session may
    /// carry on with the next one.
    pub async fn read_line(&mut self, limit: usize) -> ConnectionResult<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                if line.len() > limit {
                    return Err(ConnectionError::LineTooLong(limit));
                }
                return Ok(Some(line));
            }

            if self.discarding {
                self.buffer.clear();
            } else if self.buffer.len() > limit {
                self.buffer.clear();
                self.discarding = true;
                return Err(ConnectionError::LineTooLong(limit));
            }

            if self.fill().await? == 0 {
                if self.buffer.is_empty() || self.discarding {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buffer)));
            }
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> ConnectionResult<()> {
        match &mut self.channel {
            Channel::Plain(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            Channel::Tls(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            Channel::Closed => return Err(ConnectionError::Closed),
        }
        Ok(())
    }

    /// Sends a single line reply
    pub async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> ConnectionResult<()> {
        let line = format!("{response}\r\n");
        outgoing!("{response}");
        self.write_all(line.as_bytes()).await
    }

    /// Sends a multi-line reply, `code-` on every line but the last
    pub async fn send_lines(&mut self, code: u32, lines: &[String]) -> ConnectionResult<()> {
        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            let separator = if i + 1 == lines.len() { ' ' } else { '-' };
            write!(out, "{code}{separator}{line}\r\n")?;
            outgoing!("{code}{separator}{line}");
        }
        self.write_all(out.as_bytes()).await
    }

    /// Runs the server side of the TLS handshake.
    ///
    /// Anything the client pipelined behind `STARTTLS` was sent in the
    /// clear and is dropped. A failed handshake leaves the connection
    /// closed.
    ///
    /// # Errors
    /// If the channel is not plain text or the handshake fails
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn upgrade(
        &mut self,
        context: &ServerTlsContext,
        timeout: Duration,
    ) -> ConnectionResult<TlsInfo> {
        if !matches!(self.channel, Channel::Plain(_)) {
            return Err(ConnectionError::Tls(TlsError::Handshake(
                "channel is not plain text".to_string(),
            )));
        }
        let Channel::Plain(stream) = std::mem::replace(&mut self.channel, Channel::Closed) else {
            return Err(ConnectionError::Closed);
        };

        if !self.buffer.is_empty() {
            tracing::debug!(
                bytes = self.buffer.len(),
                "Discarding input pipelined before the TLS handshake"
            );
            self.buffer.clear();
        }
        self.discarding = false;

        let (stream, info) = context.accept(stream, timeout).await?;
        self.channel = Channel::Tls(Box::new(stream));

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn splits_pipelined_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server);
        let mut client = client;

        client
            .write_all(b"MAIL FROM:<a@b.org>\r\nRCPT TO:<c@d.org>\r\nDATA\r\n")
            .await
            .unwrap();
        drop(client);

        assert_eq!(
            connection.read_line(512).await.unwrap().unwrap(),
            b"MAIL FROM:<a@b.org>\r\n"
        );
        assert!(connection.has_pending_input());
        assert_eq!(
            connection.read_line(512).await.unwrap().unwrap(),
            b"RCPT TO:<c@d.org>\r\n"
        );
        assert_eq!(connection.read_line(512).await.unwrap().unwrap(), b"DATA\r\n");
        assert_eq!(connection.read_line(512).await.unwrap(), None);
    }

    #[tokio::test]
    async fn overlong_lines_are_skipped() {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let mut connection = Connection::new(server);

        let mut long = vec![b'A'; 600];
        long.extend_from_slice(b"\r\nNOOP\r\n");
        client.write_all(&long).await.unwrap();
        drop(client);

        assert!(matches!(
            connection.read_line(512).await,
            Err(ConnectionError::LineTooLong(512))
        ));
        assert_eq!(connection.read_line(512).await.unwrap().unwrap(), b"NOOP\r\n");
    }

    #[tokio::test]
    async fn multi_line_replies() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server);

        connection
            .send_lines(250, &["mx.example".to_string(), "PIPELINING".to_string()])
            .await
            .unwrap();
        drop(connection);

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut out)
            .await
            .unwrap();
        assert_eq!(out, "250-mx.example\r\n250 PIPELINING\r\n");
    }
}
