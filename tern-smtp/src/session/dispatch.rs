use tern_common::{
    Address, DsnNotify, Reply, Status, error::SessionError, tracing,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session};
use crate::{
    checkpoint::{Phase, Verdict},
    command::{Command, Verb},
    extensions::{Advertising, Extension},
};

fn help_topic(verb: Verb) -> &'static str {
    match verb {
        Verb::Helo => "HELO <hostname>",
        Verb::Ehlo => "EHLO <hostname>",
        Verb::Mail => "MAIL FROM:<sender> [SIZE=n] [BODY=7BIT|8BITMIME] [ENVID=id] [RET=FULL|HDRS] [AUTH=addr] [BY=n;R|N]",
        Verb::Rcpt => "RCPT TO:<recipient> [NOTIFY=NEVER|SUCCESS,FAILURE,DELAY] [ORCPT=type;addr]",
        Verb::Data => "DATA, then the message ending with \".\" on a line by itself",
        Verb::Rset => "RSET discards the current transaction",
        Verb::Vrfy => "VRFY <recipient>",
        Verb::Expn => "EXPN <alias>",
        Verb::Etrn => "ETRN <domain>",
        Verb::StartTls => "STARTTLS switches the session to TLS",
        Verb::Auth => "AUTH <mechanism> [initial-response]",
        Verb::Noop => "NOOP does nothing",
        Verb::Help => "HELP [topic]",
        Verb::Verb => "VERB delivers while you wait",
        Verb::Quit => "QUIT closes the connection",
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn handle(&mut self, command: &Command) -> Result<Flow, SessionError> {
        match command {
            Command::Helo(domain) => self.helo(command, domain, false).await,
            Command::Ehlo(domain) => self.helo(command, domain, true).await,
            Command::Mail { sender, params } => self.mail(command, sender.as_ref(), params).await,
            Command::Rcpt { recipient, params } => self.rcpt(command, recipient, params).await,
            Command::Data => self.data(command).await,
            Command::Rset => {
                self.abandon("reset");
                self.advance(command);
                self.reply(&Reply::from_parts(250, "2.0.0", "Reset state"))
                    .await
            }
            Command::Vrfy(_) => {
                self.reply(&Reply::from_parts(
                    252,
                    "2.5.2",
                    "Cannot VRFY user; try RCPT to attempt delivery",
                ))
                .await
            }
            Command::Expn(alias) => self.expn(alias).await,
            Command::Etrn(node) => self.etrn(node).await,
            Command::StartTls => self.starttls(command).await,
            Command::Auth { mechanism, initial } => {
                self.auth(command, mechanism, initial.as_deref()).await
            }
            Command::Noop => self.reply(&Reply::from_parts(250, "2.0.0", "OK")).await,
            Command::Help(topic) => self.help(topic.as_deref()).await,
            Command::Verb => {
                self.verbose = true;
                self.reply(&Reply::from_parts(250, "2.0.0", "Verbose mode"))
                    .await
            }
            Command::Quit => {
                self.abandon("client quit");
                self.send(&Reply::from_parts(
                    221,
                    "2.0.0",
                    format!("{} closing connection", self.args.hostname),
                ))
                .await?;
                Ok(Flow::Close)
            }
        }
    }

    async fn helo(
        &mut self,
        command: &Command,
        domain: &str,
        extended: bool,
    ) -> Result<Flow, SessionError> {
        match self.checkpoint(Phase::Helo, Some(domain)).await {
            Verdict::Reject(reply) | Verdict::TempFail(reply) => return self.reply(&reply).await,
            Verdict::Accept | Verdict::Discard => {}
        }

        self.abandon("new greeting");
        self.helo = Some(domain.to_string());
        self.advance(command);

        let greeting = format!(
            "{} Hello {domain}, pleased to meet you",
            self.args.hostname
        );

        if !extended {
            return self
                .reply(&Reply::new(Status::Ok, None, greeting))
                .await;
        }

        let at = Advertising {
            tls_active: self.connection.is_tls(),
            authenticated: self.flags.authenticated,
            plaintext_auth: self.args.plaintext_auth,
        };
        let has_tls = self.args.tls.is_some();
        let has_credentials = self.args.credentials.is_some();

        let mut lines = vec![greeting];
        lines.extend(self.args.extensions.iter().filter_map(|ext| match ext {
            Extension::Starttls(_) if !has_tls => None,
            Extension::Auth(_) if !has_credentials => None,
            ext => ext.advertise(at),
        }));

        self.send_lines(250, &lines).await?;
        Ok(Flow::Continue)
    }

    async fn expn(&mut self, alias: &str) -> Result<Flow, SessionError> {
        if !self.args.expn {
            return self
                .reply(&Reply::from_parts(
                    502,
                    "5.7.0",
                    "Sorry, we do not allow this operation",
                ))
                .await;
        }

        let Ok(address) = Address::parse(alias) else {
            return self
                .reject(&Reply::from_parts(501, "5.1.3", "Invalid address"))
                .await;
        };

        let Some(expander) = self.args.expander.clone() else {
            return self
                .reply(&Reply::from_parts(550, "5.1.1", "User unknown"))
                .await;
        };

        match expander.expand(&address, DsnNotify::default()).await {
            Ok(recipients) if recipients.is_empty() => {
                self.reply(&Reply::from_parts(550, "5.1.1", "User unknown"))
                    .await
            }
            Ok(recipients) => {
                let lines = recipients
                    .iter()
                    .map(|r| format!("2.1.5 <{}>", r.address))
                    .collect::<Vec<_>>();
                self.send_lines(250, &lines).await?;
                Ok(Flow::Continue)
            }
            Err(reply) => self.reply(&reply).await,
        }
    }

    async fn etrn(&mut self, node: &str) -> Result<Flow, SessionError> {
        if !self.args.has_extension(|ext| *ext == Extension::Etrn) {
            return self
                .reject(&Reply::from_parts(502, "5.5.1", "Command not implemented"))
                .await;
        }

        let domain = node.trim_start_matches(['@', '#']);
        if domain.is_empty() {
            return self
                .reject(&Reply::from_parts(501, "5.5.2", "Parameter required"))
                .await;
        }

        let started = self
            .args
            .queue_runner
            .as_ref()
            .is_some_and(|runner| runner.request_run(domain));

        if started {
            tracing::info!(peer = %self.peer, domain, "Queue run requested");
            self.reply(&Reply::from_parts(
                250,
                "2.0.0",
                format!("Queuing for node {domain} started"),
            ))
            .await
        } else {
            self.reply(&Reply::from_parts(
                458,
                "4.0.0",
                format!("Unable to queue messages for node {domain}"),
            ))
            .await
        }
    }

    async fn help(&mut self, topic: Option<&str>) -> Result<Flow, SessionError> {
        if let Some(topic) = topic {
            return match Verb::lookup(topic) {
                Some(verb) => {
                    let lines = vec![
                        format!("2.0.0 {}", help_topic(verb)),
                        "2.0.0 End of HELP info".to_string(),
                    ];
                    self.send_lines(214, &lines).await?;
                    Ok(Flow::Continue)
                }
                None => {
                    self.reply(&Reply::from_parts(
                        504,
                        "5.3.0",
                        format!("HELP topic \"{topic}\" unknown"),
                    ))
                    .await
                }
            };
        }

        let lines = vec![
            format!("2.0.0 This is tern on {}", self.args.hostname),
            "2.0.0 Topics:".to_string(),
            "2.0.0     HELO    EHLO    MAIL    RCPT    DATA".to_string(),
            "2.0.0     RSET    NOOP    QUIT    HELP    VRFY".to_string(),
            "2.0.0     EXPN    VERB    ETRN    STARTTLS AUTH".to_string(),
            "2.0.0 For more info use \"HELP <topic>\".".to_string(),
            "2.0.0 End of HELP info".to_string(),
        ];
        self.send_lines(214, &lines).await?;
        Ok(Flow::Continue)
    }
}
