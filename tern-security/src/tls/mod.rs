//! STARTTLS for both roles.
//!
//! A [`ClientTlsContext`] or [`ServerTlsContext`] is built once per process
//! and hands out one handshake per connection attempt.

mod client;
mod server;
mod verifier;

use core::fmt::{self, Display, Formatter};

use tokio_rustls::rustls::{ProtocolVersion, SupportedCipherSuite};

pub use self::{client::ClientTlsContext, server::ServerTlsContext, verifier::PeerVerification};
use crate::error::TlsFailure;

/// Result of certificate verification, as published in the `verify` macro.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VerifyOutcome {
    /// No TLS, or verification was not attempted
    #[default]
    None,
    Ok,
    Fail,
    Temp,
    Protocol,
    Software,
    Usage,
}

impl From<TlsFailure> for VerifyOutcome {
    fn from(failure: TlsFailure) -> Self {
        match failure {
            TlsFailure::Temporary => Self::Temp,
            TlsFailure::Protocol => Self::Protocol,
            TlsFailure::Usage => Self::Usage,
            TlsFailure::Software | TlsFailure::Config => Self::Software,
            TlsFailure::Unavailable => Self::Fail,
        }
    }
}

impl Display for VerifyOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "NONE",
            Self::Ok => "OK",
            Self::Fail => "FAIL",
            Self::Temp => "TEMP",
            Self::Protocol => "PROTOCOL",
            Self::Software => "SOFTWARE",
            Self::Usage => "USAGE",
        })
    }
}

/// Negotiated protocol parameters of an established TLS channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    version: String,
    cipher: String,
}

impl TlsInfo {
    pub(crate) fn of(version: Option<ProtocolVersion>, cipher: Option<SupportedCipherSuite>) -> Self {
        Self {
            version: version
                .and_then(|v| v.as_str())
                .map_or_else(|| "unknown".to_string(), str::to_string),
            cipher: cipher
                .and_then(|c| c.suite().as_str())
                .map_or_else(|| "unknown".to_string(), str::to_string),
        }
    }

    pub fn proto(&self) -> &str {
        &self.version
    }

    pub fn cipher(&self) -> &str {
        &self.cipher
    }
}

impl Display for TlsInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "version={} cipher={}", self.version, self.cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_macro_values() {
        assert_eq!(VerifyOutcome::default().to_string(), "NONE");
        assert_eq!(VerifyOutcome::from(TlsFailure::Temporary).to_string(), "TEMP");
        assert_eq!(VerifyOutcome::from(TlsFailure::Usage).to_string(), "USAGE");
        assert_eq!(
            VerifyOutcome::from(TlsFailure::Software).to_string(),
            "SOFTWARE"
        );
        assert_eq!(
            VerifyOutcome::from(TlsFailure::Protocol).to_string(),
            "PROTOCOL"
        );
    }

    #[test]
    fn unknown_parameters() {
        let info = TlsInfo::of(None, None);
        assert_eq!(info.proto(), "unknown");
        assert_eq!(info.to_string(), "version=unknown cipher=unknown");
    }
}
