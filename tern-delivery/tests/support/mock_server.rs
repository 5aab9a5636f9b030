//! Scriptable SMTP/LMTP peer for delivery tests
//!
//! The server can:
//! - answer each command with a configured reply, per recipient for `RCPT`
//!   and, in LMTP mode, after the message
//! - accept `STARTTLS` and then drop the connection to break the handshake
//! - drop or stall the connection after a number of commands
//! - record every command and message it received
//!
//! ```rust,no_run
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_response("<bad@example.test>", 550, "5.1.1 No such user")
//!     .build()
//!     .await?;
//! ```

#![allow(dead_code)]

use std::{
    collections::HashMap,
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    task::JoinHandle,
    time::timeout,
};

/// A command the server received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// `EHLO`, `HELO` or `LHLO` with the verb upper-cased
    Hello(String, String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// The message as received, still dot-stuffed
    Message(Vec<u8>),
    Rset,
    StartTls,
    Auth(String),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.text).into_bytes()
    }
}

#[derive(Clone)]
struct Script {
    bind: String,
    greeting: Reply,
    lmtp: bool,
    capabilities: Vec<String>,
    ehlo_code: u16,
    helo: Reply,
    mail: Reply,
    rcpt: Reply,
    rcpt_by_address: HashMap<String, Reply>,
    data: Reply,
    data_end: Reply,
    /// LMTP replies after the message, by recipient path
    data_end_by_address: HashMap<String, Reply>,
    rset: Reply,
    starttls: Option<Reply>,
    drop_after: Option<usize>,
    stall_after: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            greeting: Reply::new(220, "mock.test ESMTP ready"),
            lmtp: false,
            capabilities: vec!["8BITMIME".to_string(), "SIZE 100000".to_string()],
            ehlo_code: 250,
            helo: Reply::new(250, "mock.test"),
            mail: Reply::new(250, "2.1.0 Sender ok"),
            rcpt: Reply::new(250, "2.1.5 Recipient ok"),
            rcpt_by_address: HashMap::new(),
            data: Reply::new(354, "Go ahead"),
            data_end: Reply::new(250, "2.0.0 Queued as MOCK"),
            data_end_by_address: HashMap::new(),
            rset: Reply::new(250, "2.0.0 Reset"),
            starttls: None,
            drop_after: None,
            stall_after: None,
        }
    }
}

impl Script {
    fn ehlo_bytes(&self, verb: &str) -> Vec<u8> {
        if verb == "HELO" {
            return self.helo.to_bytes();
        }

        let mut lines = vec!["mock.test".to_string()];
        lines.extend(self.capabilities.iter().cloned());
        if self.starttls.is_some() {
            lines.push("STARTTLS".to_string());
        }

        let mut reply = String::new();
        let last = lines.len() - 1;
        for (i, line) in lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            let _ = write!(reply, "{}{sep}{line}\r\n", self.ehlo_code);
        }
        reply.into_bytes()
    }
}

/// A running mock server
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// Commands of one kind, e.g. every `RCPT TO` path
    pub async fn count(&self, matches: impl Fn(&SmtpCommand) -> bool) -> usize {
        self.commands.read().await.iter().filter(|c| matches(c)).count()
    }

    /// The messages received, in order
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::Message(body) => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    async fn session(
        stream: TcpStream,
        script: Arc<Script>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut seen = 0;
        let mut accepted: Vec<String> = Vec::new();

        writer.write_all(&script.greeting.to_bytes()).await?;
        if script.greeting.code != 220 {
            // Wait for QUIT or the peer to go away
            let _ = timeout(Duration::from_secs(5), reader.read_line(&mut line)).await;
            writer.write_all(b"221 2.0.0 Bye\r\n").await?;
            return Ok(());
        }

        loop {
            if script.drop_after.is_some_and(|n| seen >= n) {
                return Ok(());
            }
            if script.stall_after.is_some_and(|n| seen >= n) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            seen += 1;

            let trimmed = line.trim_end().to_string();
            let (verb, rest) = trimmed.split_once(' ').unwrap_or((trimmed.as_str(), ""));
            let verb = verb.to_ascii_uppercase();
            tracing::debug!("Mock server received: {trimmed}");

            let (command, reply) = match verb.as_str() {
                "EHLO" | "HELO" | "LHLO" => (
                    SmtpCommand::Hello(verb.clone(), rest.to_string()),
                    script.ehlo_bytes(&verb),
                ),
                "MAIL" => {
                    accepted.clear();
                    (
                        SmtpCommand::MailFrom(rest.to_string()),
                        script.mail.to_bytes(),
                    )
                }
                "RCPT" => {
                    let path = rest
                        .trim_start_matches("TO:")
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    let reply = script.rcpt_by_address.get(&path).unwrap_or(&script.rcpt);
                    if reply.code / 100 == 2 {
                        accepted.push(path);
                    }
                    (SmtpCommand::RcptTo(rest.to_string()), reply.to_bytes())
                }
                "DATA" => (SmtpCommand::Data, script.data.to_bytes()),
                "RSET" => {
                    accepted.clear();
                    (SmtpCommand::Rset, script.rset.to_bytes())
                }
                "AUTH" => (
                    SmtpCommand::Auth(rest.to_string()),
                    Reply::new(535, "5.7.8 Authentication failed").to_bytes(),
                ),
                "STARTTLS" => {
                    let reply = script
                        .starttls
                        .clone()
                        .unwrap_or_else(|| Reply::new(502, "5.5.1 Not offered"));
                    commands.write().await.push(SmtpCommand::StartTls);
                    writer.write_all(&reply.to_bytes()).await?;
                    if reply.code == 220 {
                        // No TLS here: the handshake fails on a closed socket
                        return Ok(());
                    }
                    continue;
                }
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(b"221 2.0.0 Bye\r\n").await?;
                    return Ok(());
                }
                _ => (
                    SmtpCommand::Other(trimmed.clone()),
                    Reply::new(500, "5.5.2 Unknown command").to_bytes(),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            commands.write().await.push(command);
            writer.write_all(&reply).await?;

            if !is_data || script.data.code != 354 {
                continue;
            }

            let mut message = Vec::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" || line == ".\n" {
                    break;
                }
                message.extend_from_slice(line.as_bytes());
            }
            commands.write().await.push(SmtpCommand::Message(message));

            if script.lmtp {
                for path in accepted.drain(..) {
                    let reply = script
                        .data_end_by_address
                        .get(&path)
                        .unwrap_or(&script.data_end);
                    writer.write_all(&reply.to_bytes()).await?;
                }
            } else {
                writer.write_all(&script.data_end.to_bytes()).await?;
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    /// Listen on a specific address instead of a random loopback port
    #[must_use]
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.script.bind = addr.into();
        self
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.greeting = Reply::new(code, text);
        self
    }

    /// Answer `LHLO` and reply once per accepted recipient after the message
    #[must_use]
    pub const fn lmtp(mut self) -> Self {
        self.script.lmtp = true;
        self
    }

    /// Keywords listed after the first `EHLO` line
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.script.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    /// Refuse `EHLO` with `code`, forcing `HELO`
    #[must_use]
    pub const fn with_ehlo_code(mut self, code: u16) -> Self {
        self.script.ehlo_code = code;
        self
    }

    #[must_use]
    pub fn with_mail_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.mail = Reply::new(code, text);
        self
    }

    /// Default reply to `RCPT TO`
    #[must_use]
    pub fn with_rcpt_default(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.rcpt = Reply::new(code, text);
        self
    }

    /// Reply to `RCPT TO` for one path, written with its angle brackets
    #[must_use]
    pub fn with_rcpt_response(mut self, path: &str, code: u16, text: impl Into<String>) -> Self {
        self.script
            .rcpt_by_address
            .insert(path.to_string(), Reply::new(code, text));
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.data = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, text);
        self
    }

    /// LMTP reply after the message for one recipient path
    #[must_use]
    pub fn with_data_end_for(mut self, path: &str, code: u16, text: impl Into<String>) -> Self {
        self.script
            .data_end_by_address
            .insert(path.to_string(), Reply::new(code, text));
        self
    }

    /// Offer `STARTTLS` and answer it with `code`
    #[must_use]
    pub fn with_starttls(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.starttls = Some(Reply::new(code, text));
        self
    }

    /// Close the connection after `count` commands
    #[must_use]
    pub const fn drop_after(mut self, count: usize) -> Self {
        self.script.drop_after = Some(count);
        self
    }

    /// Stop answering after `count` commands
    #[must_use]
    pub const fn stall_after(mut self, count: usize) -> Self {
        self.script.stall_after = Some(count);
        self
    }

    /// Starts serving
    ///
    /// # Errors
    /// If the address cannot be bound
    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind(&self.script.bind).await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let commands = Arc::clone(&commands);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _peer)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::Relaxed);
                    let script = Arc::clone(&script);
                    let commands = Arc::clone(&commands);
                    tokio::spawn(async move {
                        if let Err(err) = MockSmtpServer::session(stream, script, commands).await {
                            tracing::debug!("Mock server session error: {err}");
                        }
                    });
                }
            })
        };

        Ok(MockSmtpServer {
            addr,
            commands,
            connections,
            task,
        })
    }
}
