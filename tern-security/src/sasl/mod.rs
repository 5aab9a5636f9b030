//! SASL authentication (RFC 4954) for both roles.
//!
//! Only mechanisms without a security layer are implemented, so a
//! successful exchange never changes the bytes on the wire. The strength
//! factor is still tracked, and the session layer re-advertises
//! capabilities whenever a layer with a positive factor activates.

mod client;
mod server;

use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

pub use self::{
    client::ClientExchange,
    server::{AttemptLimiter, CredentialStore, ServerExchange, StaticCredentials, Step},
};
use crate::error::SaslError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mechanism {
    Plain,
    Login,
}

impl Mechanism {
    pub const ALL: [Self; 2] = [Self::Plain, Self::Login];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }

    /// Security strength factor of the layer the mechanism installs
    pub const fn ssf(self) -> u32 {
        match self {
            Self::Plain | Self::Login => 0,
        }
    }

    /// Whether the mechanism sends the password in the clear
    pub const fn is_plaintext(self) -> bool {
        matches!(self, Self::Plain | Self::Login)
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mechanism {
    type Err = SaslError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SaslError::UnsupportedMechanism(s.to_string()))
    }
}

/// Picks the first of our mechanisms that the peer advertised
pub fn choose(offered: &[String], preferred: &[Mechanism]) -> Option<Mechanism> {
    preferred
        .iter()
        .copied()
        .find(|m| offered.iter().any(|o| o.eq_ignore_ascii_case(m.name())))
}

/// Client credentials for relaying through an authenticating peer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct Credentials {
    #[serde(default)]
    pub authzid: Option<String>,
    pub username: String,
    pub password: String,
    /// Mechanisms to try, in order of preference
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Vec<Mechanism>,
}

fn default_mechanisms() -> Vec<Mechanism> {
    Mechanism::ALL.to_vec()
}

/// Encodes a payload for the wire. An empty payload is sent as `=` when
/// it appears as an initial response.
pub fn encode(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Decodes a challenge or response line.
///
/// # Errors
/// [`SaslError::Cancelled`] for `*`, [`SaslError::Encoding`] for anything
/// that is not valid base64.
pub fn decode(line: &str) -> Result<Vec<u8>, SaslError> {
    match line.trim() {
        "*" => Err(SaslError::Cancelled),
        "=" | "" => Ok(Vec::new()),
        data => STANDARD.decode(data).map_err(|_| SaslError::Encoding),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn mechanism_names() {
        assert_eq!("plain".parse::<Mechanism>(), Ok(Mechanism::Plain));
        assert_eq!("LOGIN".parse::<Mechanism>(), Ok(Mechanism::Login));
        assert_eq!(
            "CRAM-MD5".parse::<Mechanism>(),
            Err(SaslError::UnsupportedMechanism("CRAM-MD5".to_string()))
        );
        assert_eq!(Mechanism::Plain.ssf(), 0);
    }

    #[test]
    fn only_advertised_mechanisms_are_chosen() {
        let offered = vec!["LOGIN".to_string(), "CRAM-MD5".to_string()];
        assert_eq!(choose(&offered, &Mechanism::ALL), Some(Mechanism::Login));
        assert_eq!(choose(&offered, &[Mechanism::Plain]), None);
        assert_eq!(choose(&[], &Mechanism::ALL), None);
    }

    #[test]
    fn payload_encoding() {
        assert_eq!(encode(b"\0user\0pass"), "AHVzZXIAcGFzcw==");
        assert_eq!(decode("AHVzZXIAcGFzcw=="), Ok(b"\0user\0pass".to_vec()));
        assert_eq!(decode("="), Ok(Vec::new()));
        assert_eq!(decode("*"), Err(SaslError::Cancelled));
        assert_eq!(decode("!!!"), Err(SaslError::Encoding));
    }
}
