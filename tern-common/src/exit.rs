//! Internal delivery outcome codes.
//!
//! These follow the `sysexits(3)` numbering so that local mailers can report
//! their result through their process exit status, and so that network
//! failures can be classified the same way.

use core::fmt::{self, Display, Formatter};
use std::io;

use crate::status::{EnhancedStatus, Reply, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Ok,
    Usage,
    DataErr,
    NoInput,
    NoUser,
    NoHost,
    Unavailable,
    Software,
    OsErr,
    OsFile,
    CantCreat,
    IoErr,
    TempFail,
    Protocol,
    NoPerm,
    Config,
    Other(i32),
}

impl ExitCode {
    /// Maps a raw process exit status onto an outcome
    pub const fn from_raw(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            64 => Self::Usage,
            65 => Self::DataErr,
            66 => Self::NoInput,
            67 => Self::NoUser,
            68 => Self::NoHost,
            69 => Self::Unavailable,
            70 => Self::Software,
            71 => Self::OsErr,
            72 => Self::OsFile,
            73 => Self::CantCreat,
            74 => Self::IoErr,
            75 => Self::TempFail,
            76 => Self::Protocol,
            77 => Self::NoPerm,
            78 => Self::Config,
            other => Self::Other(other),
        }
    }

    pub const fn raw(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Usage => 64,
            Self::DataErr => 65,
            Self::NoInput => 66,
            Self::NoUser => 67,
            Self::NoHost => 68,
            Self::Unavailable => 69,
            Self::Software => 70,
            Self::OsErr => 71,
            Self::OsFile => 72,
            Self::CantCreat => 73,
            Self::IoErr => 74,
            Self::TempFail => 75,
            Self::Protocol => 76,
            Self::NoPerm => 77,
            Self::Config => 78,
            Self::Other(code) => code,
        }
    }

    /// Whether a recipient failing with this outcome should be retried later
    pub const fn should_requeue(self) -> bool {
        matches!(self, Self::TempFail | Self::IoErr | Self::OsErr)
    }

    /// The enhanced status recorded against a recipient when nothing more
    /// specific was learned from the peer.
    pub const fn default_status(self) -> EnhancedStatus {
        match self {
            Self::Ok => EnhancedStatus::SENT,
            Self::Usage => EnhancedStatus::INVALID_COMMAND,
            Self::DataErr => EnhancedStatus::INVALID_SYNTAX,
            Self::NoUser => EnhancedStatus::BAD_MAILBOX,
            Self::NoHost => EnhancedStatus::BAD_HOST,
            Self::NoInput | Self::CantCreat | Self::NoPerm | Self::Other(_) => {
                EnhancedStatus::SYSTEM_ERROR
            }
            Self::Unavailable | Self::Software | Self::OsFile | Self::Protocol | Self::Config => {
                EnhancedStatus::PROTOCOL_ERROR
            }
            Self::OsErr | Self::IoErr => EnhancedStatus::OS_ERROR,
            Self::TempFail => EnhancedStatus::TEMPFAIL,
        }
    }

    /// The canonical reply for an outcome when the peer did not supply one
    pub fn reply(self) -> Reply {
        let (code, text) = match self {
            Self::Ok => (250, "Sent".to_string()),
            Self::Usage => (500, "Bad usage".to_string()),
            Self::DataErr => (554, "Data format error".to_string()),
            Self::NoInput => (554, "Cannot open input".to_string()),
            Self::NoUser => (550, "User unknown".to_string()),
            Self::NoHost => (550, "Host unknown".to_string()),
            Self::Unavailable => (554, "Service unavailable".to_string()),
            Self::Software => (554, "Internal error".to_string()),
            Self::OsErr => (451, "Operating system error".to_string()),
            Self::OsFile => (554, "Critical OS file missing".to_string()),
            Self::CantCreat => (550, "Can't create output".to_string()),
            Self::IoErr => (451, "I/O error".to_string()),
            Self::TempFail => (451, "Deferred".to_string()),
            Self::Protocol => (554, "Remote protocol error".to_string()),
            Self::NoPerm => (550, "Insufficient permission".to_string()),
            Self::Config => (554, "Local configuration error".to_string()),
            Self::Other(code) => (554, format!("unknown mailer error {code}")),
        };

        Reply::new(Status::from(code), Some(self.default_status()), text)
    }

    /// Classifies a local I/O failure.
    ///
    /// Conditions that may clear up on their own (timeouts, refused or reset
    /// connections, unreachable networks, exhausted resources) become
    /// [`ExitCode::TempFail`]; anything else is an I/O error.
    pub fn from_io(err: &io::Error) -> Self {
        if is_transient(err) {
            Self::TempFail
        } else {
            match err.kind() {
                io::ErrorKind::NotFound => Self::NoInput,
                io::ErrorKind::PermissionDenied => Self::NoPerm,
                _ => Self::IoErr,
            }
        }
    }
}

/// Whether an I/O error is likely to be resolved by trying again later
pub fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind as K;

    matches!(
        err.kind(),
        K::Interrupted
            | K::WouldBlock
            | K::TimedOut
            | K::ConnectionRefused
            | K::ConnectionReset
            | K::ConnectionAborted
            | K::NotConnected
            | K::BrokenPipe
            | K::HostUnreachable
            | K::NetworkUnreachable
            | K::NetworkDown
            | K::OutOfMemory
            | K::StorageFull
            | K::ResourceBusy
            | K::AddrNotAvailable
    )
}

impl Display for ExitCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Usage => "USAGE",
            Self::DataErr => "DATAERR",
            Self::NoInput => "NOINPUT",
            Self::NoUser => "NOUSER",
            Self::NoHost => "NOHOST",
            Self::Unavailable => "UNAVAILABLE",
            Self::Software => "SOFTWARE",
            Self::OsErr => "OSERR",
            Self::OsFile => "OSFILE",
            Self::CantCreat => "CANTCREAT",
            Self::IoErr => "IOERR",
            Self::TempFail => "TEMPFAIL",
            Self::Protocol => "PROTOCOL",
            Self::NoPerm => "NOPERM",
            Self::Config => "CONFIG",
            Self::Other(code) => return write!(f, "EXIT({code})"),
        };

        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn raw_roundtrip() {
        for raw in [0, 64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 3] {
            assert_eq!(ExitCode::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn requeue_classes() {
        assert!(ExitCode::TempFail.should_requeue());
        assert!(ExitCode::IoErr.should_requeue());
        assert!(ExitCode::OsErr.should_requeue());
        assert!(!ExitCode::NoHost.should_requeue());
        assert!(!ExitCode::Protocol.should_requeue());
        assert!(!ExitCode::Software.should_requeue());
    }

    #[test]
    fn default_status_table() {
        assert_eq!(ExitCode::Usage.default_status().to_string(), "5.5.4");
        assert_eq!(ExitCode::DataErr.default_status().to_string(), "5.5.2");
        assert_eq!(ExitCode::NoUser.default_status().to_string(), "5.1.1");
        assert_eq!(ExitCode::NoHost.default_status().to_string(), "5.1.2");
        assert_eq!(ExitCode::CantCreat.default_status().to_string(), "5.3.0");
        assert_eq!(ExitCode::Config.default_status().to_string(), "5.5.0");
        assert_eq!(ExitCode::IoErr.default_status().to_string(), "4.5.0");
        assert_eq!(ExitCode::TempFail.default_status().to_string(), "4.2.0");
    }

    #[test]
    fn replies() {
        assert_eq!(ExitCode::Ok.reply().to_string(), "250 2.0.0 Sent");
        assert_eq!(
            ExitCode::Other(3).reply().to_string(),
            "554 5.3.0 unknown mailer error 3"
        );
        assert_eq!(ExitCode::NoHost.reply().to_string(), "550 5.1.2 Host unknown");
    }

    #[test]
    fn io_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ExitCode::from_io(&refused), ExitCode::TempFail);

        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(ExitCode::from_io(&missing), ExitCode::NoInput);

        let other = io::Error::other("boom");
        assert_eq!(ExitCode::from_io(&other), ExitCode::IoErr);
    }
}
