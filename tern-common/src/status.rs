use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Three digit SMTP reply codes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    SystemStatus,
    HelpMessage,
    ServiceReady,
    GoodBye,
    AuthSucceeded,
    Ok,
    WillForward,
    CannotVerify,
    AuthContinue,
    StartMailInput,
    NotAuthenticated,
    Unavailable,
    MailboxBusy,
    ActionUnavailable,
    InsufficientStorage,
    TlsUnavailable,
    SyntaxError,
    ParameterError,
    NotImplemented,
    InvalidCommandSequence,
    ParameterNotImplemented,
    AuthRequired,
    AuthFailed,
    Error,
    ExceededStorage,
    MailboxNameInvalid,
    TransactionFailed,
    ParametersUnrecognised,
    Unknown(u32),
}

impl Status {
    /// Checks if the status is a permanent rejection
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }

    /// Checks if the status is a positive completion or intermediate reply
    pub fn is_positive(self) -> bool {
        (200..400).contains(&u32::from(self))
    }

    /// The leading digit of the reply, as used when choosing a failure class
    pub fn class(self) -> u8 {
        u8::try_from(u32::from(self) / 100).unwrap_or(5)
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            211 => Self::SystemStatus,
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSucceeded,
            250 => Self::Ok,
            251 => Self::WillForward,
            252 => Self::CannotVerify,
            334 => Self::AuthContinue,
            354 => Self::StartMailInput,
            403 => Self::NotAuthenticated,
            421 => Self::Unavailable,
            450 => Self::MailboxBusy,
            451 => Self::ActionUnavailable,
            452 => Self::InsufficientStorage,
            454 => Self::TlsUnavailable,
            500 => Self::SyntaxError,
            501 => Self::ParameterError,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            504 => Self::ParameterNotImplemented,
            530 => Self::AuthRequired,
            535 => Self::AuthFailed,
            550 => Self::Error,
            552 => Self::ExceededStorage,
            553 => Self::MailboxNameInvalid,
            554 => Self::TransactionFailed,
            555 => Self::ParametersUnrecognised,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::SystemStatus => 211,
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSucceeded => 235,
            Status::Ok => 250,
            Status::WillForward => 251,
            Status::CannotVerify => 252,
            Status::AuthContinue => 334,
            Status::StartMailInput => 354,
            Status::NotAuthenticated => 403,
            Status::Unavailable => 421,
            Status::MailboxBusy => 450,
            Status::ActionUnavailable => 451,
            Status::InsufficientStorage => 452,
            Status::TlsUnavailable => 454,
            Status::SyntaxError => 500,
            Status::ParameterError => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::ParameterNotImplemented => 504,
            Status::AuthRequired => 530,
            Status::AuthFailed => 535,
            Status::Error => 550,
            Status::ExceededStorage => 552,
            Status::MailboxNameInvalid => 553,
            Status::TransactionFailed => 554,
            Status::ParametersUnrecognised => 555,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}

/// An RFC 3463 enhanced status code, `class.subject.detail`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnhancedStatus {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedStatus {
    pub const SENT: Self = Self::new(2, 0, 0);
    pub const DELIVERED_LOCALLY: Self = Self::new(2, 1, 5);
    pub const TEMPFAIL: Self = Self::new(4, 2, 0);
    pub const OS_ERROR: Self = Self::new(4, 5, 0);
    pub const BAD_MAILBOX: Self = Self::new(5, 1, 1);
    pub const BAD_HOST: Self = Self::new(5, 1, 2);
    pub const SYSTEM_ERROR: Self = Self::new(5, 3, 0);
    pub const PROTOCOL_ERROR: Self = Self::new(5, 5, 0);
    pub const INVALID_SYNTAX: Self = Self::new(5, 5, 2);
    pub const INVALID_COMMAND: Self = Self::new(5, 5, 4);

    pub const fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    pub const fn is_success(self) -> bool {
        self.class == 2
    }

    pub const fn is_temporary(self) -> bool {
        self.class == 4
    }

    pub const fn is_permanent(self) -> bool {
        self.class == 5
    }

    /// Decides whether `new` should replace `old` as a recipient's recorded status.
    ///
    /// A more severe class (`2` < `4` < `5`) always wins; otherwise the
    /// existing status is kept unless `force` is set.
    pub fn should_replace(old: Option<Self>, new: Self, force: bool) -> bool {
        force || old.is_none_or(|old| old.class < new.class)
    }
}

impl Display for EnhancedStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

impl FromStr for EnhancedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (Some(class), Some(subject), Some(detail), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("Invalid enhanced status code: {s}"));
        };

        let class = class
            .parse::<u8>()
            .ok()
            .filter(|c| matches!(c, 2 | 4 | 5))
            .ok_or_else(|| format!("Invalid enhanced status class: {s}"))?;
        let subject = subject
            .parse::<u16>()
            .map_err(|_| format!("Invalid enhanced status subject: {s}"))?;
        let detail = detail
            .parse::<u16>()
            .map_err(|_| format!("Invalid enhanced status detail: {s}"))?;

        Ok(Self::new(class, subject, detail))
    }
}

impl TryFrom<String> for EnhancedStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EnhancedStatus> for String {
    fn from(value: EnhancedStatus) -> Self {
        value.to_string()
    }
}

/// A complete protocol reply: three digit code, optional enhanced code and text
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Reply {
    pub status: Status,
    pub enhanced: Option<EnhancedStatus>,
    pub text: String,
}

impl Reply {
    pub fn new(status: Status, enhanced: Option<EnhancedStatus>, text: impl Into<String>) -> Self {
        Self {
            status,
            enhanced,
            text: text.into(),
        }
    }

    /// Builds a reply from a raw code and `x.y.z` string, as found in tables
    pub fn from_parts(code: u32, enhanced: &str, text: impl Into<String>) -> Self {
        Self::new(Status::from(code), enhanced.parse().ok(), text)
    }

    /// Parses a single line reply such as `550 5.1.1 User unknown`
    pub fn parse(line: &str) -> Option<Self> {
        let code = line.get(..3)?.parse::<u32>().ok()?;
        let rest = line.get(4..).unwrap_or_default().trim_start();
        let (enhanced, text) = match rest.split_once(' ') {
            Some((first, text)) => match first.parse::<EnhancedStatus>() {
                Ok(enhanced) => (Some(enhanced), text),
                Err(_) => (None, rest),
            },
            None => match rest.parse::<EnhancedStatus>() {
                Ok(enhanced) => (Some(enhanced), ""),
                Err(_) => (None, rest),
            },
        };

        Some(Self::new(Status::from(code), enhanced, text))
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.enhanced {
            Some(enhanced) if self.text.is_empty() => write!(f, "{} {enhanced}", self.status),
            Some(enhanced) => write!(f, "{} {enhanced} {}", self.status, self.text),
            None => write!(f, "{} {}", self.status, self.text),
        }
    }
}
