use core::fmt::{self, Display};
use std::path::PathBuf;

use serde::Deserialize;
use tern_security::sasl::Mechanism;

/// Certificate and key offered to `STARTTLS` clients
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// SMTP protocol extensions advertised in the EHLO response.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Extension {
    /// STARTTLS (RFC 3207). Withdrawn once the channel is encrypted.
    Starttls(TlsFiles),

    /// SIZE (RFC 1870). `0` advertises the keyword without a limit.
    Size(usize),

    Help,

    Pipelining,

    #[serde(rename = "8bitmime", alias = "eightbitmime")]
    EightBitMime,

    /// DSN (RFC 3461)
    Dsn,

    /// AUTH (RFC 4954) with the mechanisms to offer
    Auth(Vec<Mechanism>),

    /// ETRN (RFC 1985)
    Etrn,

    EnhancedStatusCodes,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Starttls(_) => fmt.write_str("STARTTLS"),
            Self::Size(max) => {
                if *max == 0 {
                    fmt.write_str("SIZE")
                } else {
                    write!(fmt, "SIZE {max}")
                }
            }
            Self::Help => fmt.write_str("HELP"),
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::Dsn => fmt.write_str("DSN"),
            Self::Auth(mechanisms) => {
                fmt.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(fmt, " {mechanism}")?;
                }
                Ok(())
            }
            Self::Etrn => fmt.write_str("ETRN"),
            Self::EnhancedStatusCodes => fmt.write_str("ENHANCEDSTATUSCODES"),
        }
    }
}

/// Where a session stands when it answers EHLO
#[derive(Debug, Clone, Copy, Default)]
pub struct Advertising {
    pub tls_active: bool,
    pub authenticated: bool,
    /// Offer plaintext mechanisms on an unencrypted channel
    pub plaintext_auth: bool,
}

impl Extension {
    /// Whether to include this extension in the EHLO reply
    pub fn offered(&self, at: Advertising) -> bool {
        match self {
            Self::Starttls(_) => !at.tls_active,
            Self::Auth(mechanisms) => {
                !at.authenticated
                    && mechanisms
                        .iter()
                        .any(|m| at.tls_active || at.plaintext_auth || !m.is_plaintext())
            }
            _ => true,
        }
    }

    /// The advertised form, with mechanisms filtered by channel state
    pub fn advertise(&self, at: Advertising) -> Option<String> {
        if !self.offered(at) {
            return None;
        }

        match self {
            Self::Auth(mechanisms) => Some(
                Self::Auth(
                    mechanisms
                        .iter()
                        .copied()
                        .filter(|m| at.tls_active || at.plaintext_auth || !m.is_plaintext())
                        .collect(),
                )
                .to_string(),
            ),
            other => Some(other.to_string()),
        }
    }
}
