//! Reaching a network destination: MX failover, connection reuse and
//! security layer negotiation.

use std::net::{IpAddr, SocketAddr};

use tern_common::{Envelope, ExitCode, MailerDescriptor, config::DaneMode};
use tern_security::{DaneState, TlsError, TlsFailure};
use tern_smtp::{client::SmtpClient, error::ClientError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Batch, DeliveryEngine, pending};
use crate::{
    connection_cache::{ConnectionContext, Phase},
    error::{DeliveryError, PermanentError, TemporaryError},
};

/// Why a connection could not be made ready
enum Handshake {
    /// The TLS handshake broke the channel; clear text may be an option
    TlsFailed(TlsError),
    Failed(DeliveryError),
}

impl From<DeliveryError> for Handshake {
    fn from(err: DeliveryError) -> Self {
        Self::Failed(err)
    }
}

impl From<ClientError> for Handshake {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Tls(err) => Self::TlsFailed(err),
            err => Self::Failed(err.into()),
        }
    }
}

impl DeliveryEngine {
    /// Tries the batch's hosts in signature order until one of them has
    /// dealt with every member.
    ///
    /// Connecting shares one time budget across all hosts. A host that
    /// fails temporarily moves on to the next; if every host failed and
    /// any of them only temporarily, the batch is deferred rather than
    /// bounced. The fallback host comes last, once, and never for DANE
    /// secured destinations.
    pub(super) async fn deliver_network(
        &mut self,
        envelope: &mut Envelope,
        batch: &Batch,
        started: Instant,
    ) {
        let mailer = &batch.mailer;
        let port = mailer.port().unwrap_or(25);
        let candidates = batch
            .signature
            .parse(|host| self.cache.contains(host, &mailer.name));

        let mut hosts = candidates
            .into_iter()
            .map(|candidate| (candidate.host, false))
            .collect::<Vec<_>>();
        if let Some(fallback) = &self.config.fallback_host {
            hosts.push((fallback.to_ascii_lowercase(), true));
        }

        let deadline = Instant::now() + self.config.timeouts.connect_budget();
        let mut good_mx = false;
        let mut dane_secured = false;
        let mut last_error: Option<DeliveryError> = None;
        let mut last_host: Option<String> = None;

        for (host, fallback) in hosts {
            if pending(envelope, &batch.members).is_empty() {
                return;
            }

            if fallback {
                if dane_secured {
                    info!(%host, "Destination is DANE secured, not using the fallback host");
                    break;
                }
                let exhausted = last_error
                    .as_ref()
                    .is_none_or(|err| err.is_temporary() || err.exit_code() == ExitCode::NoHost);
                if !exhausted {
                    break;
                }
            }

            if !fallback && let Some(failure) = batch.signature.failure(&host) {
                let err = failure.error(&host);
                good_mx |= err.is_temporary();
                last_error = Some(err);
                last_host = Some(host);
                continue;
            }

            let authenticated = !fallback && batch.signature.is_authenticated(&host);
            let dane = self.dane_state(&host, port, authenticated).await;
            dane_secured |= dane.is_secure();

            let mut context = match self.open(&host, port, mailer, dane, deadline).await {
                Ok(context) => context,
                Err(err) => {
                    debug!(%host, %err, "Host failed");
                    good_mx |= err.should_requeue();
                    last_error = Some(err);
                    last_host = Some(host);
                    continue;
                }
            };

            let members = pending(envelope, &batch.members);
            let result = self
                .transact(&mut context, mailer, envelope, &members, started)
                .await;
            self.cache.put(context).await;

            match result {
                Ok(()) => return,
                Err(err) if err.should_requeue() => {
                    debug!(%host, %err, "Transaction failed temporarily, trying the next host");
                    good_mx = true;
                    last_error = Some(err);
                    last_host = Some(host);
                }
                Err(err) => {
                    self.fail_members(envelope, &members, &err, Some(&host), started);
                    return;
                }
            }
        }

        let err = match last_error {
            Some(DeliveryError::Permanent(PermanentError::HostUnknown(host))) if good_mx => {
                TemporaryError::DnsLookupFailed(host).into()
            }
            Some(err) => err,
            None => PermanentError::HostUnknown(batch.signature.to_string()).into(),
        };
        self.fail_members(
            envelope,
            &batch.members,
            &err,
            last_host.as_deref(),
            started,
        );
    }

    /// Looks up the TLSA records of `host` when DANE applies to it
    async fn dane_state(&self, host: &str, port: u16, authenticated: bool) -> DaneState {
        let tls = &self.config.tls;
        if tls.is_disabled() || tls.dane != DaneMode::Opportunistic {
            return DaneState::NotRequested;
        }
        if !authenticated {
            return DaneState::NotApplicable;
        }

        match self.resolver.lookup().tlsa(host, port).await {
            Ok(records) => DaneState::from_records(records),
            Err(err) if err.is_temporary() => DaneState::TempFail(err.to_string()),
            Err(_) => DaneState::NoRecords,
        }
    }

    /// A ready connection to `host`: a compatible cached one, or a fresh
    /// one that got through greeting and security negotiation.
    async fn open(
        &mut self,
        host: &str,
        port: u16,
        mailer: &MailerDescriptor,
        dane: DaneState,
        deadline: Instant,
    ) -> Result<ConnectionContext, DeliveryError> {
        let tls = &self.config.tls;
        let required = tls.minimum_level(dane.is_secure());
        if let Some(context) = self.cache.take(host, &mailer.name, required).await {
            return Ok(context);
        }

        dane.check().map_err(|err| DeliveryError::from(TlsError::Dane(err)))?;
        let addresses = self.resolver.lookup().addresses(host).await?;

        let mut allow_tls = !tls.is_disabled();
        loop {
            let client = self.connect(host, port, &addresses, deadline).await?;
            let mut context = ConnectionContext::new(client, host, &mailer.name);
            context.dane = dane.clone();

            match self.handshake(&mut context, mailer, allow_tls).await {
                Ok(()) => {
                    context.phase = Phase::Ready;
                    return Ok(context);
                }
                Err(Handshake::TlsFailed(err))
                    if allow_tls && self.config.tls.may_fall_back(dane.is_secure()) =>
                {
                    info!(host, %err, "STARTTLS failed, trying again in clear text");
                    allow_tls = false;
                }
                Err(Handshake::TlsFailed(err)) => {
                    warn!(host, %err, "STARTTLS failed");
                    context.client.close().await;
                    return Err(err.into());
                }
                Err(Handshake::Failed(err)) => {
                    context.close().await;
                    return Err(err);
                }
            }
        }
    }

    /// Connects to the first address that answers within the budget
    async fn connect(
        &self,
        host: &str,
        port: u16,
        addresses: &[IpAddr],
        deadline: Instant,
    ) -> Result<SmtpClient, DeliveryError> {
        let mut last = None;

        for address in addresses {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let addr = SocketAddr::new(*address, port);
            let limit = remaining.min(self.config.timeouts.connect());
            match SmtpClient::connect(addr, host, self.config.timeouts.clone(), limit).await {
                Ok(client) => {
                    debug!(host, %addr, "Connected");
                    return Ok(client);
                }
                Err(err) => {
                    debug!(host, %addr, %err, "Connect failed");
                    last = Some(err);
                }
            }
        }

        Err(last.map_or_else(
            || TemporaryError::Timeout(format!("connect budget exhausted before {host}")).into(),
            DeliveryError::from,
        ))
    }

    /// Greeting, `EHLO`, `STARTTLS`, `AUTH` and the policy check
    async fn handshake(
        &self,
        context: &mut ConnectionContext,
        mailer: &MailerDescriptor,
        allow_tls: bool,
    ) -> Result<(), Handshake> {
        let greeting = context.client.read_greeting().await?;
        if greeting.code != 220 {
            return Err(DeliveryError::from_reply(greeting.to_reply()).into());
        }

        self.hello(context, mailer).await?;

        let offers_tls = context
            .client
            .capabilities()
            .is_some_and(|capabilities| capabilities.starttls);
        if allow_tls && offers_tls {
            let response = context
                .client
                .starttls(&self.tls, context.dane.records())
                .await?;
            if let Some(failure) = TlsFailure::from_reply(response.code) {
                debug!(host = %context.host, %response, ?failure, "STARTTLS refused");
                context.client.security_mut().record_failure(failure);
            } else {
                self.hello(context, mailer).await?;
            }
        }

        if let Err(reply) = context
            .client
            .security()
            .enforce(&self.config.tls, context.dane.is_secure())
        {
            warn!(host = %context.host, %reply, "Peer does not meet the TLS policy");
            return Err(DeliveryError::not_authenticated(reply).into());
        }

        self.authenticate(context, mailer).await?;

        Ok(())
    }

    async fn hello(
        &self,
        context: &mut ConnectionContext,
        mailer: &MailerDescriptor,
    ) -> Result<(), DeliveryError> {
        let name = &self.config.hostname;
        let client = &mut context.client;

        let response = if mailer.flags.lmtp {
            client.lhlo(name).await?
        } else if mailer.flags.esmtp {
            let response = client.ehlo(name).await?;
            if response.is_success() {
                response
            } else {
                client.helo(name).await?
            }
        } else {
            client.helo(name).await?
        };

        if !response.is_success() {
            return Err(DeliveryError::from_reply(response.to_reply()));
        }
        Ok(())
    }

    /// Offers the configured credentials if the peer accepts `AUTH`.
    ///
    /// A refusal is not fatal: the peer may still take the mail.
    async fn authenticate(
        &self,
        context: &mut ConnectionContext,
        mailer: &MailerDescriptor,
    ) -> Result<(), DeliveryError> {
        let Some(credentials) = &self.config.credentials else {
            return Ok(());
        };
        let offered = context
            .client
            .capabilities()
            .is_some_and(|capabilities| !capabilities.auth.is_empty());
        if !offered {
            return Ok(());
        }

        match context.client.authenticate(credentials).await {
            Ok(response) if response.code == 235 => {
                // A negotiated layer forgets the capabilities
                if context.client.capabilities().is_none() {
                    self.hello(context, mailer).await?;
                }
                Ok(())
            }
            Ok(response) => {
                warn!(host = %context.host, %response, "Authentication refused");
                Ok(())
            }
            Err(ClientError::Sasl(err)) => {
                warn!(host = %context.host, %err, "Authentication failed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
