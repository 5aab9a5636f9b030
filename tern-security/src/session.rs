//! Security state attached to one connection.

use tern_common::{
    EnhancedStatus, Reply, Status,
    config::{SecurityLevel, TlsConfig},
};

use crate::{
    dane::DaneOutcome,
    error::TlsFailure,
    sasl::Mechanism,
    tls::{PeerVerification, TlsInfo, VerifyOutcome},
};

/// What has been negotiated on a connection so far.
///
/// Starts out as [`SecuritySession::plain`]; each activated layer adds to
/// it. Whenever a layer activates, any capability list learned earlier on
/// the connection is stale and must be fetched again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecuritySession {
    tls: Option<TlsInfo>,
    verify: VerifyOutcome,
    dane: DaneOutcome,
    mechanism: Option<Mechanism>,
    authenticated: Option<String>,
    ssf: u32,
}

impl SecuritySession {
    pub fn plain() -> Self {
        Self::default()
    }

    pub(crate) const fn encrypted(info: TlsInfo, verification: PeerVerification) -> Self {
        Self {
            tls: Some(info),
            verify: verification.pkix,
            dane: verification.dane,
            mechanism: None,
            authenticated: None,
            ssf: 0,
        }
    }

    /// Server side: a channel upgraded by `STARTTLS`. Client certificates
    /// are not requested, so there is nothing to verify.
    pub const fn accepted(info: TlsInfo) -> Self {
        Self {
            tls: Some(info),
            verify: VerifyOutcome::None,
            dane: DaneOutcome::NotApplicable,
            mechanism: None,
            authenticated: None,
            ssf: 0,
        }
    }

    pub const fn tls(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    pub const fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    pub const fn verify(&self) -> VerifyOutcome {
        self.verify
    }

    pub const fn dane(&self) -> DaneOutcome {
        self.dane
    }

    pub const fn mechanism(&self) -> Option<Mechanism> {
        self.mechanism
    }

    pub fn authenticated(&self) -> Option<&str> {
        self.authenticated.as_deref()
    }

    pub const fn ssf(&self) -> u32 {
        self.ssf
    }

    /// Records a failed `STARTTLS` for the `verify` macro
    pub fn record_failure(&mut self, failure: TlsFailure) {
        self.verify = VerifyOutcome::from(failure);
    }

    /// Records a successful `AUTH`.
    ///
    /// Returns `true` if the mechanism installed a security layer, in which
    /// case the caller must discard cached capabilities.
    pub fn authenticate(&mut self, mechanism: Mechanism, identity: impl Into<String>) -> bool {
        self.mechanism = Some(mechanism);
        self.authenticated = Some(identity.into());
        self.ssf = self.ssf.max(mechanism.ssf());
        mechanism.ssf() > 0
    }

    /// The strongest guarantee this session gives
    pub const fn level(&self) -> SecurityLevel {
        if self.tls.is_none() {
            return SecurityLevel::None;
        }

        match (self.dane, self.verify) {
            (DaneOutcome::Matched(_), _) => SecurityLevel::DaneVerified,
            (_, VerifyOutcome::Ok) => SecurityLevel::Verified,
            _ => SecurityLevel::Encrypted,
        }
    }

    pub fn satisfies(&self, required: SecurityLevel) -> bool {
        self.level() >= required
    }

    /// Decides whether the peer may receive mail under `config`.
    ///
    /// # Errors
    /// The reply that refuses the peer: `403 4.7.0` when the established
    /// channel falls short of what the destination requires.
    pub fn enforce(&self, config: &TlsConfig, dane_secured: bool) -> Result<(), Reply> {
        let required = config.minimum_level(dane_secured);
        if self.dane == DaneOutcome::Mismatch || !self.satisfies(required) {
            return Err(not_authenticated());
        }
        Ok(())
    }

    /// Session macros describing the negotiated layers
    pub fn macros(&self) -> Vec<(&'static str, String)> {
        let mut macros = vec![("verify", self.verify.to_string())];

        if let Some(tls) = &self.tls {
            macros.push(("tls_version", tls.proto().to_string()));
            macros.push(("cipher", tls.cipher().to_string()));
        }

        if let Some(mechanism) = self.mechanism {
            macros.push(("auth_type", mechanism.to_string()));
        }

        if let Some(user) = &self.authenticated {
            macros.push(("auth_authen", user.clone()));
        }

        macros.push(("auth_ssf", self.ssf.to_string()));

        macros
    }
}

/// The refusal sent when a peer fails the TLS policy check
pub fn not_authenticated() -> Reply {
    Reply::new(
        Status::NotAuthenticated,
        Some(EnhancedStatus::new(4, 7, 0)),
        "server not authenticated.",
    )
}
