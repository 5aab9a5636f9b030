//! Configuration types shared by the server and the delivery side.
//!
//! - [`timeouts`]: per-step limits for server sessions and outbound delivery
//! - [`tls`]: outbound STARTTLS and DANE policy

pub mod timeouts;
pub mod tls;

pub use timeouts::{ClientTimeouts, ServerTimeouts, TimeoutConfig};
pub use tls::{DaneMode, SecurityLevel, TlsConfig, TlsPolicy};
