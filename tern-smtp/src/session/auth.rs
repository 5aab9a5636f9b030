use std::time::Duration;

use tern_common::{EnhancedStatus, Reply, Status, error::SessionError, tracing};
use tern_security::{
    SaslError, SecuritySession,
    sasl::{Mechanism, ServerExchange, Step},
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, MAX_COMMAND_LINE, Session};
use crate::{command::Command, extensions::Extension};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn starttls(&mut self, command: &Command) -> Result<Flow, SessionError> {
        let Some(context) = self.args.tls.clone() else {
            return self
                .reply(&Reply::from_parts(454, "4.7.0", "TLS not available"))
                .await;
        };

        self.send(&Reply::new(
            Status::ServiceReady,
            Some(EnhancedStatus::SENT),
            "Ready to start TLS",
        ))
        .await?;

        let timeout = Duration::from_secs(self.args.timeouts.command_secs);
        let info = self
            .connection
            .upgrade(&context, timeout)
            .await
            .map_err(|err| {
                tracing::warn!(peer = %self.peer, "STARTTLS failed: {err}");
                SessionError::Protocol(format!("STARTTLS failed: {err}"))
            })?;

        tracing::debug!(
            peer = %self.peer,
            protocol = %info.proto(),
            cipher = %info.cipher(),
            "Connection upgraded"
        );

        // The client starts over, as if it had just connected
        self.security = SecuritySession::accepted(info);
        self.envelope = None;
        self.helo = None;
        self.advance(command);

        Ok(Flow::Continue)
    }

    fn offered_mechanisms(&self) -> Vec<Mechanism> {
        self.args
            .extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Auth(mechanisms) => Some(mechanisms.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Reads one continuation line of an `AUTH` exchange, `None` on EOF
    async fn read_response(&mut self) -> Result<Option<String>, SessionError> {
        let timeout = Duration::from_secs(self.args.timeouts.command_secs);
        let line = tokio::time::timeout(timeout, self.connection.read_line(MAX_COMMAND_LINE))
            .await
            .map_err(|_| SessionError::Timeout(self.args.timeouts.command_secs))?
            .map_err(|err| SessionError::Protocol(err.to_string()))?;

        Ok(line.map(|line| {
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string()
        }))
    }

    pub(super) async fn auth(
        &mut self,
        command: &Command,
        mechanism: &str,
        initial: Option<&str>,
    ) -> Result<Flow, SessionError> {
        let offered = self.offered_mechanisms();
        let Some(credentials) = self.args.credentials.clone() else {
            return self
                .reply(&Reply::from_parts(503, "5.3.3", "AUTH not available"))
                .await;
        };
        if offered.is_empty() {
            return self
                .reply(&Reply::from_parts(503, "5.3.3", "AUTH not available"))
                .await;
        }

        let Some(mechanism) = mechanism
            .parse::<Mechanism>()
            .ok()
            .filter(|m| offered.contains(m))
        else {
            return self
                .reply(&Reply::from_parts(
                    504,
                    "5.3.8",
                    format!("AUTH mechanism {mechanism} not available"),
                ))
                .await;
        };

        if mechanism.is_plaintext() && !self.connection.is_tls() && !self.args.plaintext_auth {
            return self
                .reply(&Reply::from_parts(
                    538,
                    "5.7.11",
                    "Encryption required for requested authentication mechanism",
                ))
                .await;
        }

        let mut exchange = ServerExchange::new(mechanism);
        // A lone `=` is an empty initial response
        let mut response = initial.map(|r| if r == "=" { String::new() } else { r.to_string() });

        let (authzid, username, password) = loop {
            match exchange.step(response.as_deref()) {
                Ok(Step::Challenge(challenge)) => {
                    self.send(&Reply::new(Status::AuthContinue, None, challenge))
                        .await?;
                    let Some(line) = self.read_response().await? else {
                        return Ok(Flow::Close);
                    };
                    response = Some(line);
                }
                Ok(Step::Complete {
                    authzid,
                    username,
                    password,
                }) => break (authzid, username, password),
                Err(SaslError::Cancelled) => {
                    return self
                        .reply(&Reply::from_parts(501, "5.0.0", "AUTH aborted"))
                        .await;
                }
                Err(err) => {
                    return self
                        .reject(&Reply::from_parts(501, "5.5.2", err.to_string()))
                        .await;
                }
            }
        };

        let Some(identity) = credentials
            .verify(authzid.as_deref(), &username, &password)
            .await
        else {
            tracing::warn!(peer = %self.peer, %mechanism, %username, "Authentication failed");
            self.send(&Reply::from_parts(535, "5.7.0", "authentication failed"))
                .await?;

            if self.auth_limiter.record_failure() {
                self.send(&Reply::from_parts(
                    421,
                    "4.7.0",
                    format!("{} Too many AUTH failures", self.args.hostname),
                ))
                .await?;
                return Ok(Flow::Close);
            }
            return Ok(Flow::Continue);
        };

        tracing::info!(peer = %self.peer, %mechanism, %identity, "Authenticated");
        if self.security.authenticate(mechanism, identity) {
            // Anything negotiated below the new layer is stale
            self.envelope = None;
        }
        self.advance(command);

        self.reply(&Reply::new(
            Status::AuthSucceeded,
            Some(EnhancedStatus::SENT),
            "OK Authenticated",
        ))
        .await
    }
}
