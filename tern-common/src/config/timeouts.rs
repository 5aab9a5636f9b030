//! Timeout configuration for both sides of an SMTP conversation.
//!
//! Every blocking protocol step has its own limit. Server values follow the
//! RFC 5321 recommendations; client values are tighter so that a stuck peer
//! is abandoned in favour of the next candidate host.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Common interface for timeout configuration.
pub trait TimeoutConfig {
    /// Timeout for SMTP command processing.
    fn command_timeout(&self) -> Duration;

    /// Timeout for DATA command and message transfer.
    fn data_timeout(&self) -> Duration;

    /// Maximum connection duration.
    fn connection_timeout(&self) -> Duration;
}

/// Server-side SMTP timeout configuration (RFC 5321 compliant).
///
/// # RFC 5321 Recommendations
///
/// - MAIL/RCPT commands: 5 minutes
/// - DATA initiation: 2 minutes
/// - DATA block: 3 minutes
/// - DATA termination: 10 minutes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Idle timeout while waiting for the next command.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::server_command_secs")]
    pub command_secs: u64,

    /// Timeout for the first block of message data after `354`.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::server_data_init_secs")]
    pub data_init_secs: u64,

    /// Timeout for each subsequent block of message data.
    ///
    /// Default: 180 seconds
    #[serde(default = "defaults::server_data_block_secs")]
    pub data_block_secs: u64,

    /// Timeout for processing the final `.`, including any interactive delivery.
    ///
    /// Default: 600 seconds
    #[serde(default = "defaults::server_data_termination_secs")]
    pub data_termination_secs: u64,

    /// Maximum total session duration.
    ///
    /// Default: 1800 seconds
    #[serde(default = "defaults::server_connection_secs")]
    pub connection_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::server_command_secs(),
            data_init_secs: defaults::server_data_init_secs(),
            data_block_secs: defaults::server_data_block_secs(),
            data_termination_secs: defaults::server_data_termination_secs(),
            connection_secs: defaults::server_connection_secs(),
        }
    }
}

impl TimeoutConfig for ServerTimeouts {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_block_secs)
    }

    fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_secs)
    }
}

/// Client-side timeouts used while delivering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Timeout for a single TCP connect.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// Total time spent connecting across every candidate host of one
    /// destination.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::client_connect_budget_secs")]
    pub connect_budget_secs: u64,

    /// Timeout for the `220` greeting.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::client_greeting_secs")]
    pub greeting_secs: u64,

    /// Timeout for EHLO/HELO (and LHLO).
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::client_helo_secs")]
    pub helo_secs: u64,

    /// Timeout for the STARTTLS command and the handshake that follows.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::client_starttls_secs")]
    pub starttls_secs: u64,

    /// Timeout for each AUTH exchange step.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::client_auth_secs")]
    pub auth_secs: u64,

    /// Timeout for MAIL FROM.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::client_mail_secs")]
    pub mail_secs: u64,

    /// Timeout for each RCPT TO.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::client_rcpt_secs")]
    pub rcpt_secs: u64,

    /// Timeout for the `354` reply to DATA.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::client_data_init_secs")]
    pub data_init_secs: u64,

    /// Timeout for writing each block of the body.
    ///
    /// Default: 180 seconds
    #[serde(default = "defaults::client_data_block_secs")]
    pub data_block_secs: u64,

    /// Timeout for the reply to the final `.`.
    ///
    /// Default: 600 seconds
    #[serde(default = "defaults::client_data_done_secs")]
    pub data_done_secs: u64,

    /// Timeout for QUIT (a failure here never affects delivery).
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::client_quit_secs")]
    pub quit_secs: u64,

    /// How long an unused cached connection stays open.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::client_idle_secs")]
    pub idle_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            connect_budget_secs: defaults::client_connect_budget_secs(),
            greeting_secs: defaults::client_greeting_secs(),
            helo_secs: defaults::client_helo_secs(),
            starttls_secs: defaults::client_starttls_secs(),
            auth_secs: defaults::client_auth_secs(),
            mail_secs: defaults::client_mail_secs(),
            rcpt_secs: defaults::client_rcpt_secs(),
            data_init_secs: defaults::client_data_init_secs(),
            data_block_secs: defaults::client_data_block_secs(),
            data_done_secs: defaults::client_data_done_secs(),
            quit_secs: defaults::client_quit_secs(),
            idle_secs: defaults::client_idle_secs(),
        }
    }
}

impl ClientTimeouts {
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub const fn connect_budget(&self) -> Duration {
        Duration::from_secs(self.connect_budget_secs)
    }

    pub const fn greeting(&self) -> Duration {
        Duration::from_secs(self.greeting_secs)
    }

    pub const fn helo(&self) -> Duration {
        Duration::from_secs(self.helo_secs)
    }

    pub const fn starttls(&self) -> Duration {
        Duration::from_secs(self.starttls_secs)
    }

    pub const fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }

    pub const fn mail(&self) -> Duration {
        Duration::from_secs(self.mail_secs)
    }

    pub const fn rcpt(&self) -> Duration {
        Duration::from_secs(self.rcpt_secs)
    }

    pub const fn data_init(&self) -> Duration {
        Duration::from_secs(self.data_init_secs)
    }

    pub const fn data_block(&self) -> Duration {
        Duration::from_secs(self.data_block_secs)
    }

    pub const fn data_done(&self) -> Duration {
        Duration::from_secs(self.data_done_secs)
    }

    pub const fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }

    pub const fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

impl TimeoutConfig for ClientTimeouts {
    fn command_timeout(&self) -> Duration {
        self.helo()
    }

    fn data_timeout(&self) -> Duration {
        self.data_done()
    }

    fn connection_timeout(&self) -> Duration {
        self.connect_budget()
    }
}

mod defaults {
    pub const fn server_command_secs() -> u64 {
        300
    }
    pub const fn server_data_init_secs() -> u64 {
        120
    }
    pub const fn server_data_block_secs() -> u64 {
        180
    }
    pub const fn server_data_termination_secs() -> u64 {
        600
    }
    pub const fn server_connection_secs() -> u64 {
        1800
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }
    pub const fn client_connect_budget_secs() -> u64 {
        120
    }
    pub const fn client_greeting_secs() -> u64 {
        300
    }
    pub const fn client_helo_secs() -> u64 {
        300
    }
    pub const fn client_starttls_secs() -> u64 {
        60
    }
    pub const fn client_auth_secs() -> u64 {
        60
    }
    pub const fn client_mail_secs() -> u64 {
        300
    }
    pub const fn client_rcpt_secs() -> u64 {
        300
    }
    pub const fn client_data_init_secs() -> u64 {
        120
    }
    pub const fn client_data_block_secs() -> u64 {
        180
    }
    pub const fn client_data_done_secs() -> u64 {
        600
    }
    pub const fn client_quit_secs() -> u64 {
        10
    }
    pub const fn client_idle_secs() -> u64 {
        300
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_timeouts_defaults() {
        let timeouts = ServerTimeouts::default();
        assert_eq!(timeouts.command_secs, 300);
        assert_eq!(timeouts.data_init_secs, 120);
        assert_eq!(timeouts.data_block_secs, 180);
        assert_eq!(timeouts.data_termination_secs, 600);
        assert_eq!(timeouts.command_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_client_timeouts_partial_config() {
        let timeouts: ClientTimeouts =
            ron::from_str("(connect_secs: 5, connect_budget_secs: 12)").unwrap();
        assert_eq!(timeouts.connect(), Duration::from_secs(5));
        assert_eq!(timeouts.connect_budget(), Duration::from_secs(12));
        assert_eq!(timeouts.quit(), Duration::from_secs(10));
        assert_eq!(timeouts.connection_timeout(), Duration::from_secs(12));
    }
}
