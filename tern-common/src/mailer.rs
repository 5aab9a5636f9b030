//! Mailer descriptors.
//!
//! A mailer describes one class of destination: a network peer spoken to over
//! SMTP or LMTP, a local program that receives the message on its standard
//! input, or a plain file. Descriptors are immutable once loaded.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const fn default_port() -> u16 {
    25
}

const fn default_max_name_list() -> usize {
    8192
}

/// How a mailer reaches its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailerKind {
    /// An SMTP or LMTP peer reached over TCP
    Network {
        #[serde(default = "default_port")]
        port: u16,
    },
    /// A program spawned per transaction, reading the message on stdin
    Local {
        program: PathBuf,
        /// Argument template; `$u`, `$h`, `$f` and `$g` are expanded
        #[serde(default)]
        argv: Vec<String>,
    },
    /// Appends the message to the file named by the recipient
    File,
}

/// Capability flags of a mailer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "These are independent configuration switches"
)]
pub struct MailerFlags {
    /// Speak LMTP rather than SMTP, with a reply per recipient after DATA
    #[serde(default)]
    pub lmtp: bool,
    /// Greet with EHLO and use extensions
    #[serde(default)]
    pub esmtp: bool,
    /// Connect to the named host directly, without an MX lookup
    #[serde(default)]
    pub no_mx: bool,
    /// The mailer cannot carry 8-bit data
    #[serde(default)]
    pub seven_bit: bool,
    /// Several recipients may share one transaction
    #[serde(default)]
    pub multi_user: bool,
    /// Always run local programs under the configured default identity
    #[serde(default)]
    pub fixed_identity: bool,
    /// Delivers into this host rather than relaying onwards
    #[serde(default)]
    pub local: bool,
    /// The mailer takes recipients one argument at a time, so the name
    /// list is not subject to the aggregate size cap
    #[serde(default)]
    pub expands_names: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailerDescriptor {
    pub name: String,
    pub kind: MailerKind,
    #[serde(default)]
    pub flags: MailerFlags,
    /// Maximum recipients per transaction (`None` for unlimited)
    #[serde(default)]
    pub max_recipients: Option<usize>,
    /// Maximum message size in bytes (`None` for unlimited)
    #[serde(default)]
    pub max_message_size: Option<usize>,
    /// Maximum combined length of recipient names in one transaction
    #[serde(default = "default_max_name_list")]
    pub max_name_list: usize,
    /// Identity used for local programs when the recipient has no owner,
    /// or when the mailer requires a fixed identity
    #[serde(default)]
    pub default_identity: Option<String>,
}

impl MailerDescriptor {
    /// A network mailer speaking ESMTP on port 25
    pub fn esmtp(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MailerKind::Network {
                port: default_port(),
            },
            flags: MailerFlags {
                esmtp: true,
                multi_user: true,
                ..MailerFlags::default()
            },
            max_recipients: Some(100),
            max_message_size: None,
            max_name_list: default_max_name_list(),
            default_identity: None,
        }
    }

    /// A local program mailer
    pub fn local(name: impl Into<String>, program: impl Into<PathBuf>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: MailerKind::Local {
                program: program.into(),
                argv,
            },
            flags: MailerFlags {
                local: true,
                no_mx: true,
                ..MailerFlags::default()
            },
            max_recipients: None,
            max_message_size: None,
            max_name_list: default_max_name_list(),
            default_identity: None,
        }
    }

    /// The file drop mailer
    pub fn file() -> Self {
        Self {
            name: "*file*".to_string(),
            kind: MailerKind::File,
            flags: MailerFlags {
                local: true,
                no_mx: true,
                ..MailerFlags::default()
            },
            max_recipients: Some(1),
            max_message_size: None,
            max_name_list: default_max_name_list(),
            default_identity: None,
        }
    }

    pub const fn is_network(&self) -> bool {
        matches!(self.kind, MailerKind::Network { .. })
    }

    pub const fn port(&self) -> Option<u16> {
        match self.kind {
            MailerKind::Network { port } => Some(port),
            _ => None,
        }
    }

    /// Whether destinations of this mailer go through MX resolution
    pub const fn uses_mx(&self) -> bool {
        self.is_network() && !self.flags.no_mx
    }

    /// Whether more than one recipient may share a transaction
    pub const fn batches(&self) -> bool {
        self.flags.multi_user || self.flags.lmtp
    }

    /// Whether a message of `size` bytes exceeds this mailer's limit
    pub fn rejects_size(&self, size: usize) -> bool {
        self.max_message_size.is_some_and(|max| max > 0 && size > max)
    }
}
