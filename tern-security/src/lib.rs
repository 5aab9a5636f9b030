//! Security layers for tern connections.
//!
//! Encryption always comes before authentication: credentials are only
//! exchanged once `STARTTLS` has either succeeded or been ruled out by
//! policy. Both layers share one contract with the protocol engines that
//! use them, namely that a freshly activated layer invalidates every
//! capability learned before it.

pub mod dane;
pub mod error;
pub mod sasl;
pub mod session;
pub mod tls;

pub use self::{
    dane::{DaneOutcome, DaneState, TlsaRecord},
    error::{DaneError, SaslError, TlsError, TlsFailure},
    session::SecuritySession,
    tls::{ClientTlsContext, ServerTlsContext, TlsInfo, VerifyOutcome},
};
