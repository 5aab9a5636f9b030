//! SMTP for tern: the inbound command dispatcher and the outbound client.

pub mod body;
pub mod checkpoint;
pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod session;
pub mod state;
pub mod throttle;

use core::fmt::{self, Debug, Formatter};
use std::{net::SocketAddr, sync::Arc};

use ahash::AHashMap;
use serde::Deserialize;
use tern_common::{
    Signal,
    config::ServerTimeouts,
    error::{ProtocolError, SessionError},
    load::{ConnectionRate, DeliveryMode, FixedLoad, LoadPolicy, LoadSource},
    mailer::MailerDescriptor,
    queue::MemoryQueue,
    routing::{RoutingTable, StaticRouter},
    traits::{
        AliasExpander, DeliveryHandoff, QueueRunner, QueueStore,
        protocol::{Protocol, SessionHandler},
    },
};
use tern_security::{ServerTlsContext, sasl::CredentialStore, sasl::StaticCredentials};
use tokio::net::TcpStream;

pub use crate::state::State;
use crate::{
    checkpoint::{AcceptAll, Checkpoint},
    extensions::Extension,
    session::Session,
    throttle::ThrottleConfig,
};

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

const fn default_max_recipients() -> usize {
    100
}

const fn default_max_hops() -> usize {
    25
}

const fn default_auth_attempts() -> u32 {
    3
}

#[derive(Default)]
pub struct Smtp;

/// Settings of one SMTP listener.
///
/// The serialized fields come from the configuration file. The skipped
/// ones are runtime collaborators injected by the binary through
/// [`tern_common::controller::Controller::map_args`]; [`Protocol::validate`]
/// fills in in-memory defaults for whatever was not injected.
#[derive(Clone, Default, Deserialize)]
pub struct SmtpArgs {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub extensions: Vec<Extension>,
    #[serde(default)]
    pub timeouts: ServerTimeouts,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    /// Refuse `MAIL` until the client has introduced itself
    #[serde(default)]
    pub helo_required: bool,
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    /// Messages with more `Received` headers than this are refused
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default)]
    pub load: LoadPolicy,
    /// Answer `EXPN` with the expansion instead of refusing it
    #[serde(default)]
    pub expn: bool,
    /// Offer plaintext `AUTH` mechanisms before `STARTTLS`
    #[serde(default)]
    pub plaintext_auth: bool,
    #[serde(default = "default_auth_attempts")]
    pub auth_attempts: u32,
    /// Users accepted by `AUTH` when no credential store is injected
    #[serde(default)]
    pub users: Option<StaticCredentials>,

    #[serde(skip)]
    pub tls: Option<Arc<ServerTlsContext>>,
    #[serde(skip)]
    pub queue: Option<Arc<dyn QueueStore>>,
    #[serde(skip)]
    pub handoff: Option<Arc<dyn DeliveryHandoff>>,
    #[serde(skip)]
    pub expander: Option<Arc<dyn AliasExpander>>,
    #[serde(skip)]
    pub queue_runner: Option<Arc<dyn QueueRunner>>,
    #[serde(skip)]
    pub checkpoint: Option<Arc<dyn Checkpoint>>,
    #[serde(skip)]
    pub credentials: Option<Arc<dyn CredentialStore>>,
    #[serde(skip)]
    pub load_source: Option<Arc<dyn LoadSource>>,
    #[serde(skip)]
    pub rate: Arc<ConnectionRate>,
}

impl Debug for SmtpArgs {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpArgs")
            .field("hostname", &self.hostname)
            .field("extensions", &self.extensions)
            .field("timeouts", &self.timeouts)
            .field("throttle", &self.throttle)
            .field("helo_required", &self.helo_required)
            .field("max_recipients", &self.max_recipients)
            .field("max_hops", &self.max_hops)
            .field("mode", &self.mode)
            .field("tls", &self.tls.is_some())
            .field("handoff", &self.handoff.is_some())
            .finish_non_exhaustive()
    }
}

impl SmtpArgs {
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn QueueStore>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_handoff(mut self, handoff: Arc<dyn DeliveryHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    #[must_use]
    pub fn with_expander(mut self, expander: Arc<dyn AliasExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    #[must_use]
    pub fn with_queue_runner(mut self, runner: Arc<dyn QueueRunner>) -> Self {
        self.queue_runner = Some(runner);
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_load_source(mut self, load: Arc<dyn LoadSource>) -> Self {
        self.load_source = Some(load);
        self
    }

    /// The advertised `SIZE` limit, `0` for none
    pub fn max_message_size(&self) -> usize {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Size(size) => Some(*size),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn has_extension(&self, matches: impl Fn(&Extension) -> bool) -> bool {
        self.extensions.iter().any(matches)
    }

    /// Fills in every collaborator that was not injected
    ///
    /// # Errors
    /// If the configured TLS certificate or key cannot be loaded
    pub fn prepare(&mut self) -> Result<(), ProtocolError> {
        if self.tls.is_none()
            && let Some(files) = self.extensions.iter().find_map(|ext| match ext {
                Extension::Starttls(files) => Some(files),
                _ => None,
            })
        {
            let context = ServerTlsContext::load(&files.certificate, &files.key).map_err(|e| {
                ProtocolError::InvalidConfiguration {
                    field: "starttls".to_string(),
                    reason: e.to_string(),
                }
            })?;
            self.tls = Some(Arc::new(context));
        }

        if self.credentials.is_none()
            && let Some(users) = self.users.clone()
        {
            self.credentials = Some(Arc::new(users));
        }

        if self.queue.is_none() {
            self.queue = Some(Arc::new(MemoryQueue::new()));
        }

        if self.expander.is_none() {
            self.expander = Some(Arc::new(StaticRouter::new(
                RoutingTable::default(),
                &[Arc::new(MailerDescriptor::esmtp("esmtp"))],
            )));
        }

        if self.checkpoint.is_none() {
            self.checkpoint = Some(Arc::new(AcceptAll));
        }

        if self.load_source.is_none() {
            self.load_source = Some(Arc::new(FixedLoad::default()));
        }

        if self.max_recipients == 0 {
            return Err(ProtocolError::InvalidConfiguration {
                field: "max_recipients".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

impl Protocol for Smtp {
    type Session = Session<TcpStream>;
    type Args = SmtpArgs;

    fn ty() -> &'static str {
        "SMTP"
    }

    #[tracing::instrument(level = "trace", skip(self, stream, context, args))]
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        context: AHashMap<String, String>,
        args: Self::Args,
    ) -> Self::Session {
        Session::new(stream, peer, context, args)
    }

    #[tracing::instrument(level = "trace", skip(self, args))]
    fn validate(&mut self, args: &mut Self::Args) -> Result<(), ProtocolError> {
        args.prepare()
    }
}

impl SessionHandler for Session<TcpStream> {
    async fn run(self, signal: tokio::sync::broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        self.serve(signal).await
    }
}
