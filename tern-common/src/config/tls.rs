//! Security policy for outbound connections.

use serde::{Deserialize, Serialize};

/// When to negotiate STARTTLS with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Use STARTTLS whenever the peer offers it.
    #[default]
    Opportunistic,

    /// Refuse to send mail unless STARTTLS succeeds.
    Required,

    /// Never issue STARTTLS.
    Disabled,
}

/// Whether TLSA records are consulted when verifying a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DaneMode {
    #[default]
    Disabled,

    /// Look up TLSA records for hosts whose MX answer was authenticated,
    /// and enforce them when usable records exist.
    Opportunistic,
}

/// Strength of the security state a delivery needs from a connection.
///
/// The ordering is meaningful: a cached connection may only carry a
/// delivery whose requirement is less than or equal to what it achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    #[default]
    None,
    Encrypted,
    Verified,
    DaneVerified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub policy: TlsPolicy,

    /// Retry a destination in clear text after STARTTLS failed.
    ///
    /// Ignored when TLS is required or the destination is DANE secured.
    #[serde(default)]
    pub fallback_to_clear: bool,

    #[serde(default)]
    pub dane: DaneMode,

    /// Skip certificate validation.
    ///
    /// Only meant for testing against self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    #[must_use]
    pub const fn required() -> Self {
        Self {
            policy: TlsPolicy::Required,
            fallback_to_clear: false,
            dane: DaneMode::Disabled,
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            policy: TlsPolicy::Disabled,
            fallback_to_clear: false,
            dane: DaneMode::Disabled,
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub const fn is_required(&self) -> bool {
        matches!(self.policy, TlsPolicy::Required)
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self.policy, TlsPolicy::Disabled)
    }

    /// Whether clear text may be used after a failed handshake.
    ///
    /// A DANE secured destination never falls back.
    #[must_use]
    pub const fn may_fall_back(&self, dane_secured: bool) -> bool {
        self.fallback_to_clear && !self.is_required() && !dane_secured
    }

    /// The minimum security a connection must reach under this policy.
    #[must_use]
    pub const fn minimum_level(&self, dane_secured: bool) -> SecurityLevel {
        if dane_secured {
            SecurityLevel::DaneVerified
        } else if self.is_required() {
            SecurityLevel::Encrypted
        } else {
            SecurityLevel::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_config_default() {
        let config = TlsConfig::default();
        assert_eq!(config.policy, TlsPolicy::Opportunistic);
        assert!(!config.accept_invalid_certs);
        assert!(!config.may_fall_back(false));
    }

    #[test]
    fn test_dane_forbids_fallback() {
        let config = TlsConfig {
            fallback_to_clear: true,
            ..TlsConfig::default()
        };
        assert!(config.may_fall_back(false));
        assert!(!config.may_fall_back(true));

        let required = TlsConfig {
            fallback_to_clear: true,
            ..TlsConfig::required()
        };
        assert!(!required.may_fall_back(false));
    }

    #[test]
    fn test_minimum_levels() {
        assert_eq!(TlsConfig::default().minimum_level(false), SecurityLevel::None);
        assert_eq!(
            TlsConfig::required().minimum_level(false),
            SecurityLevel::Encrypted
        );
        assert_eq!(
            TlsConfig::disabled().minimum_level(true),
            SecurityLevel::DaneVerified
        );
        assert!(SecurityLevel::Verified > SecurityLevel::Encrypted);
    }
}
