//! Typed error handling for delivery operations.
//!
//! Failures are split into three families:
//! - Permanent failures (5xx) that bounce the recipient
//! - Temporary failures (4xx) that leave it queued for a later attempt
//! - System errors, whose [`ExitCode`] decides which of the two applies
//!
//! Every error projects onto the sysexits taxonomy and onto the reply that
//! is recorded against the recipients it affects.

use std::io;

use tern_common::{EnhancedStatus, ExitCode, Reply, Status, exit::is_transient};
use tern_security::{TlsError, TlsFailure};
use tern_smtp::error::ClientError;
use thiserror::Error;

use crate::dns::DnsError;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried (e.g., 5xx SMTP codes).
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried later (e.g., 4xx SMTP codes).
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (I/O, configuration, protocol violations).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// The destination host does not exist.
    #[error("Host unknown: {0}")]
    HostUnknown(String),

    /// The peer refused with a 5xx reply.
    #[error("Rejected: {0}")]
    Rejected(Reply),

    /// The message exceeds the mailer's or the peer's size limit.
    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize, local: bool },

    /// The message went through more relays than allowed.
    #[error("Too many hops: {hops} ({max} max)")]
    TooManyHops { hops: usize, max: usize },

    /// 8-bit content for a destination that only takes 7-bit data.
    #[error("Cannot send 8-bit data to {0}")]
    EightBitUnsupported(String),

    /// The peer failed the TLS policy and refused with a 5xx class.
    #[error("Peer not authenticated: {0}")]
    NotAuthenticated(Reply),
}

/// Temporary errors that leave the recipient queued.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Failed to establish (or keep) a connection to the mail server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A protocol step did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The DNS lookup failed in a way that may clear up.
    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    /// The peer answered with a 4xx reply.
    #[error("Deferred: {0}")]
    Deferred(Reply),

    /// STARTTLS could not be completed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// The peer did not meet the TLS policy for this destination.
    #[error("Peer not authenticated: {0}")]
    NotAuthenticated(Reply),

    /// SASL authentication with the peer failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
}

/// System-level errors.
#[derive(Debug, Error)]
pub enum SystemError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The peer violated the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A local mailer or internal component failed.
    #[error("Internal error: {0}")]
    Software(String),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeliveryError {
    /// Returns `true` if this is a temporary failure that should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this is a permanent failure.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Whether affected recipients stay queued
    pub fn should_requeue(&self) -> bool {
        self.exit_code().should_requeue()
    }

    /// The outcome code recorded against affected recipients
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Permanent(err) => match err {
                PermanentError::HostUnknown(_) => ExitCode::NoHost,
                PermanentError::Rejected(reply) => rejection_exit(reply),
                PermanentError::EightBitUnsupported(_) => ExitCode::DataErr,
                PermanentError::MessageTooLarge { .. }
                | PermanentError::TooManyHops { .. }
                | PermanentError::NotAuthenticated(_) => ExitCode::Unavailable,
            },
            Self::Temporary(_) => ExitCode::TempFail,
            Self::System(err) => match err {
                SystemError::Configuration(_) => ExitCode::Config,
                SystemError::Protocol(_) => ExitCode::Protocol,
                SystemError::Software(_) => ExitCode::Software,
                SystemError::Io(err) => ExitCode::from_io(err),
            },
        }
    }

    /// The reply recorded against affected recipients
    pub fn reply(&self) -> Reply {
        match self {
            Self::Permanent(err) => match err {
                PermanentError::HostUnknown(host) => {
                    Reply::from_parts(550, "5.1.2", format!("Host unknown ({host})"))
                }
                PermanentError::Rejected(reply) | PermanentError::NotAuthenticated(reply) => {
                    reply.clone()
                }
                PermanentError::MessageTooLarge { limit, local, .. } => Reply::new(
                    Status::ExceededStorage,
                    Some(if *local {
                        EnhancedStatus::new(5, 2, 3)
                    } else {
                        EnhancedStatus::new(5, 3, 4)
                    }),
                    format!("Message is too large; {limit} bytes max"),
                ),
                PermanentError::TooManyHops { hops, max } => {
                    Reply::from_parts(554, "5.4.6", format!("Too many hops {hops} ({max} max)"))
                }
                PermanentError::EightBitUnsupported(_) => Reply::from_parts(
                    554,
                    "5.6.3",
                    "Cannot send 8-bit data to 7-bit destination",
                ),
            },
            Self::Temporary(err) => match err {
                TemporaryError::ConnectionFailed(reason) => {
                    Reply::from_parts(451, "4.4.1", reason.clone())
                }
                TemporaryError::Timeout(reason) => Reply::from_parts(451, "4.4.2", reason.clone()),
                TemporaryError::DnsLookupFailed(host) => {
                    Reply::from_parts(451, "4.4.3", format!("Host lookup failed ({host})"))
                }
                TemporaryError::Deferred(reply) | TemporaryError::NotAuthenticated(reply) => {
                    reply.clone()
                }
                TemporaryError::TlsHandshakeFailed(reason) => {
                    Reply::from_parts(403, "4.7.0", format!("TLS handshake failed: {reason}"))
                }
                TemporaryError::AuthFailed(reason) => {
                    Reply::from_parts(451, "4.7.0", format!("AUTH failed: {reason}"))
                }
            },
            Self::System(err) => match err {
                SystemError::Configuration(reason) => {
                    Reply::from_parts(554, "5.3.5", reason.clone())
                }
                SystemError::Protocol(reason) => {
                    Reply::from_parts(554, "5.5.0", format!("Remote protocol error: {reason}"))
                }
                SystemError::Software(reason) => Reply::from_parts(554, "5.3.0", reason.clone()),
                SystemError::Io(err) => {
                    let mut reply = ExitCode::from_io(err).reply();
                    reply.text = err.to_string();
                    reply
                }
            },
        }
    }

    /// Classifies a negative reply from the peer
    pub fn from_reply(reply: Reply) -> Self {
        if reply.status.is_temporary() {
            Self::Temporary(TemporaryError::Deferred(reply))
        } else {
            Self::Permanent(PermanentError::Rejected(reply))
        }
    }

    /// A refused TLS policy check, temporary or permanent by its class
    pub fn not_authenticated(reply: Reply) -> Self {
        if reply.status.is_permanent() {
            Self::Permanent(PermanentError::NotAuthenticated(reply))
        } else {
            Self::Temporary(TemporaryError::NotAuthenticated(reply))
        }
    }
}

/// Recipient rejections name the mailbox; everything else is the service
fn rejection_exit(reply: &Reply) -> ExitCode {
    match u32::from(reply.status) {
        550 | 551 | 553 => ExitCode::NoUser,
        _ => ExitCode::Unavailable,
    }
}

/// Convert from `DnsError` to `DeliveryError`.
///
/// A name that does not exist is permanent; anything else may succeed on
/// a later attempt.
impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(host) | DnsError::DomainNotFound(host) => {
                Self::Permanent(PermanentError::HostUnknown(host))
            }
            DnsError::Timeout(host) => Self::Temporary(TemporaryError::DnsLookupFailed(host)),
            DnsError::LookupFailed(err) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(err.to_string()))
            }
        }
    }
}

/// Convert from the SMTP client's `ClientError` to `DeliveryError`.
///
/// - **Connection/I/O errors** → Temporary when transient
/// - **Timeouts** → Temporary
/// - **TLS errors** → by their [`TlsFailure`] class
/// - **Parse errors** → System (the peer broke the protocol)
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Io(err) => err.into(),
            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                "Connection closed unexpectedly".to_string(),
            )),
            ClientError::Timeout(step) => {
                Self::Temporary(TemporaryError::Timeout(format!("timeout waiting for {step}")))
            }
            ClientError::Tls(err) => err.into(),
            ClientError::Sasl(err) => Self::Temporary(TemporaryError::AuthFailed(err.to_string())),
            ClientError::ParseError(msg) => Self::System(SystemError::Protocol(msg)),
            ClientError::Utf8Error(err) => Self::System(SystemError::Protocol(err.to_string())),
        }
    }
}

/// A failed handshake requeues; only broken local configuration does not.
impl From<TlsError> for DeliveryError {
    fn from(error: TlsError) -> Self {
        match error.failure() {
            TlsFailure::Config => Self::System(SystemError::Configuration(error.to_string())),
            TlsFailure::Unavailable => Self::Temporary(TemporaryError::NotAuthenticated(
                tern_security::session::not_authenticated(),
            )),
            TlsFailure::Temporary
            | TlsFailure::Protocol
            | TlsFailure::Usage
            | TlsFailure::Software => {
                Self::Temporary(TemporaryError::TlsHandshakeFailed(error.to_string()))
            }
        }
    }
}

impl From<io::Error> for DeliveryError {
    fn from(error: io::Error) -> Self {
        if is_transient(&error) {
            Self::Temporary(TemporaryError::ConnectionFailed(error.to_string()))
        } else {
            Self::System(SystemError::Io(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tern_security::DaneError;

    use super::*;

    #[test]
    fn categories() {
        let error = DeliveryError::Temporary(TemporaryError::ConnectionFailed(
            "Connection refused".to_string(),
        ));
        assert!(error.is_temporary());
        assert!(!error.is_permanent());
        assert!(error.should_requeue());

        let error = DeliveryError::Permanent(PermanentError::HostUnknown("nx.test".to_string()));
        assert!(error.is_permanent());
        assert_eq!(error.exit_code(), ExitCode::NoHost);
        assert_eq!(error.reply().to_string(), "550 5.1.2 Host unknown (nx.test)");

        let error = DeliveryError::System(SystemError::Software("boom".to_string()));
        assert!(error.is_system());
        assert!(!error.should_requeue());
    }

    #[test]
    fn peer_replies_keep_their_class() {
        let error = DeliveryError::from_reply(Reply::from_parts(550, "5.1.1", "No such user"));
        assert_eq!(error.exit_code(), ExitCode::NoUser);
        assert_eq!(error.reply().to_string(), "550 5.1.1 No such user");

        let error = DeliveryError::from_reply(Reply::from_parts(554, "5.7.1", "Relay denied"));
        assert_eq!(error.exit_code(), ExitCode::Unavailable);

        let error = DeliveryError::from_reply(Reply::from_parts(452, "4.2.2", "Mailbox full"));
        assert!(error.should_requeue());
    }

    #[test]
    fn dns_error_conversion() {
        let error: DeliveryError = DnsError::NoMailServers("example.com".to_string()).into();
        assert!(error.is_permanent());

        let error: DeliveryError = DnsError::DomainNotFound("example.com".to_string()).into();
        assert!(error.is_permanent());

        let error: DeliveryError = DnsError::Timeout("example.com".to_string()).into();
        assert!(error.is_temporary());
        assert_eq!(error.reply().enhanced, Some(EnhancedStatus::new(4, 4, 3)));
    }

    #[test]
    fn client_error_conversion() {
        let error: DeliveryError = ClientError::ConnectionClosed.into();
        assert!(error.is_temporary());

        let error: DeliveryError = ClientError::Timeout("greeting").into();
        assert_eq!(error.reply().to_string(), "451 4.4.2 timeout waiting for greeting");

        let error: DeliveryError = ClientError::ParseError("garbage".to_string()).into();
        assert_eq!(error.exit_code(), ExitCode::Protocol);

        let error: DeliveryError =
            ClientError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).into();
        assert!(error.is_temporary());
    }

    #[test]
    fn failed_handshakes_requeue() {
        let error: DeliveryError = TlsError::Handshake("alert".to_string()).into();
        assert!(error.should_requeue());
        assert_eq!(error.reply().status, Status::NotAuthenticated);

        let error: DeliveryError = TlsError::Dane(DaneError::Mismatch("mx.test".to_string())).into();
        assert!(error.should_requeue());
        assert_eq!(
            error.reply().to_string(),
            "403 4.7.0 server not authenticated."
        );

        let error: DeliveryError = TlsError::InvalidName("[::".to_string()).into();
        assert_eq!(error.exit_code(), ExitCode::Config);
    }

    #[test]
    fn size_replies_depend_on_mailer() {
        let local = DeliveryError::Permanent(PermanentError::MessageTooLarge {
            size: 2000,
            limit: 1000,
            local: true,
        });
        assert_eq!(
            local.reply().to_string(),
            "552 5.2.3 Message is too large; 1000 bytes max"
        );

        let remote = DeliveryError::Permanent(PermanentError::MessageTooLarge {
            size: 2000,
            limit: 1000,
            local: false,
        });
        assert_eq!(remote.reply().enhanced, Some(EnhancedStatus::new(5, 3, 4)));
        assert_eq!(remote.exit_code(), ExitCode::Unavailable);
    }
}
