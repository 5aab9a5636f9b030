//! Error types for the tern-smtp crate.
//!
//! This module provides typed error handling for both directions of an SMTP
//! conversation: parsing inbound commands, the server's connection, and the
//! client used by delivery.

use std::io;

use tern_common::{EnhancedStatus, Reply, Status};
use tern_security::{SaslError, TlsError};
use thiserror::Error;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed by peer.
    #[error("Connection closed by peer")]
    Closed,

    /// The peer sent a line longer than the protocol allows.
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Formatting error while preparing response.
    #[error("Response formatting error: {0}")]
    Format(#[from] std::fmt::Error),

    /// The channel could not be upgraded.
    #[error("TLS upgrade failed: {0}")]
    Tls(#[from] TlsError),
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Reasons an inbound command line is refused before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Command unrecognized: {0}")]
    Unrecognized(String),

    #[error("Syntax error in {verb}: {reason}")]
    Syntax { verb: &'static str, reason: String },

    #[error("Invalid address {0}")]
    Address(String),

    #[error("{0} parameter unrecognized")]
    UnknownParameter(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidParameter { name: String, value: String },

    #[error("Duplicate parameter {0}")]
    DuplicateParameter(String),
}

impl CommandError {
    /// The reply sent back for this error
    pub fn reply(&self) -> Reply {
        let (status, enhanced, text) = match self {
            Self::Unrecognized(line) => (
                Status::SyntaxError,
                EnhancedStatus::new(5, 5, 1),
                format!("Command unrecognized: \"{line}\""),
            ),
            Self::Syntax { verb, reason } => (
                Status::ParameterError,
                EnhancedStatus::new(5, 5, 2),
                format!("Syntax error in parameters scanning \"{verb}\": {reason}"),
            ),
            Self::Address(reason) => (
                Status::MailboxNameInvalid,
                EnhancedStatus::new(5, 1, 3),
                format!("Invalid address: {reason}"),
            ),
            Self::UnknownParameter(name) => (
                Status::ParametersUnrecognised,
                EnhancedStatus::new(5, 5, 4),
                format!("{name} parameter unrecognized"),
            ),
            Self::InvalidParameter { name, value } => (
                Status::ParameterError,
                EnhancedStatus::new(5, 5, 4),
                format!("Bad {name} parameter value \"{value}\""),
            ),
            Self::DuplicateParameter(name) => (
                Status::ParameterError,
                EnhancedStatus::new(5, 5, 4),
                format!("Duplicate {name} parameter"),
            ),
        };

        Reply::new(status, Some(enhanced), text)
    }
}

/// Errors that can occur when using the SMTP client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The peer did not answer in time.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// SASL negotiation failed.
    #[error("SASL error: {0}")]
    Sasl(#[from] SaslError),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Whether the channel can no longer be used after this error
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Tls(err) => !err.failure().connection_usable(),
            Self::Sasl(_) => false,
            _ => true,
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
