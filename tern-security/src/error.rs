//! Error types for the tern-security crate.

use std::io;

use tern_common::ExitCode;
use thiserror::Error;

/// How a failed TLS negotiation should be treated.
///
/// Each class carries its own retry policy; see [`TlsFailure::exit_code`]
/// and [`TlsFailure::connection_usable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsFailure {
    /// The peer refused for now (`454`), or the handshake timed out.
    Temporary,
    /// The peer answered STARTTLS with something unexpected.
    Protocol,
    /// The peer rejected the command syntax (`501`).
    Usage,
    /// The handshake itself failed; the channel is unusable.
    Software,
    /// Encryption was required but is not offered or could not be verified.
    Unavailable,
    /// Local TLS configuration is broken (certificates, keys, names).
    Config,
}

impl TlsFailure {
    pub const fn exit_code(self) -> ExitCode {
        match self {
            Self::Temporary => ExitCode::TempFail,
            Self::Protocol => ExitCode::Protocol,
            Self::Usage => ExitCode::Usage,
            Self::Software => ExitCode::Software,
            Self::Unavailable => ExitCode::Unavailable,
            Self::Config => ExitCode::Config,
        }
    }

    /// Whether the plain channel can still carry a transaction afterwards.
    ///
    /// Only a failed handshake leaves the stream in an unknown state.
    pub const fn connection_usable(self) -> bool {
        !matches!(self, Self::Software)
    }

    /// Classifies the reply to `STARTTLS`
    pub const fn from_reply(code: u16) -> Option<Self> {
        match code {
            220 => None,
            454 => Some(Self::Temporary),
            501 => Some(Self::Usage),
            _ => Some(Self::Protocol),
        }
    }
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during TLS operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load TLS certificate.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// The peer name cannot be used for SNI or verification.
    #[error("Invalid server name: {0}")]
    InvalidName(String),

    /// The handshake did not finish in time.
    #[error("TLS handshake timed out after {0} seconds")]
    Timeout(u64),

    /// The handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// The peer's certificate did not match its TLSA records.
    #[error("DANE verification failed: {0}")]
    Dane(#[from] DaneError),

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl TlsError {
    /// Classifies a failure for retry purposes
    pub const fn failure(&self) -> TlsFailure {
        match self {
            Self::CertificateLoad { .. } | Self::KeyLoad { .. } | Self::InvalidName(_) => {
                TlsFailure::Config
            }
            Self::Timeout(_) => TlsFailure::Temporary,
            Self::Dane(DaneError::Temporary(_)) => TlsFailure::Temporary,
            Self::Dane(_) => TlsFailure::Unavailable,
            Self::Io(_) | Self::Handshake(_) | Self::Rustls(_) => TlsFailure::Software,
        }
    }
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// DANE lookup and matching failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DaneError {
    /// The TLSA lookup failed in a way that may clear up.
    #[error("TLSA lookup failed temporarily: {0}")]
    Temporary(String),

    /// TLSA records exist but none is usable.
    #[error("No usable TLSA records for {0}")]
    Unusable(String),

    /// No certificate in the peer's chain matched a usable record.
    #[error("Peer certificate does not match any TLSA record for {0}")]
    Mismatch(String),
}

/// SASL negotiation failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SaslError {
    /// The payload was not valid base64.
    #[error("Invalid base64 payload")]
    Encoding,

    /// The decoded payload did not have the structure the mechanism expects.
    #[error("Malformed {mechanism} response")]
    Malformed { mechanism: &'static str },

    /// The mechanism is unknown or not offered.
    #[error("Unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    /// The client gave up (`*`).
    #[error("Authentication cancelled")]
    Cancelled,

    /// The credentials were rejected.
    #[error("Authentication failed")]
    Rejected,

    /// The exchange was driven past its end.
    #[error("Unexpected step in {mechanism} exchange")]
    UnexpectedStep { mechanism: &'static str },
}

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
