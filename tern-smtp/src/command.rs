//! Inbound command parsing.
//!
//! A line is split into its verb and argument once; ESMTP parameters are read
//! by a tokenizer over the untouched argument, so the original line is still
//! available for logging after a failed parse.

use core::fmt::{self, Display, Formatter};

use arrayvec::ArrayString;
use phf::phf_map;
use tern_common::{
    Address, DsnNotify,
    dsn::DsnReturn,
    envelope::BodyType,
};

use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Vrfy,
    Expn,
    Etrn,
    StartTls,
    Auth,
    Noop,
    Help,
    Verb,
    Quit,
}

static VERBS: phf::Map<&'static str, Verb> = phf_map! {
    "HELO" => Verb::Helo,
    "EHLO" => Verb::Ehlo,
    "MAIL" => Verb::Mail,
    "RCPT" => Verb::Rcpt,
    "DATA" => Verb::Data,
    "RSET" => Verb::Rset,
    "VRFY" => Verb::Vrfy,
    "EXPN" => Verb::Expn,
    "ETRN" => Verb::Etrn,
    "STARTTLS" => Verb::StartTls,
    "AUTH" => Verb::Auth,
    "NOOP" => Verb::Noop,
    "HELP" => Verb::Help,
    "VERB" => Verb::Verb,
    "QUIT" => Verb::Quit,
};

impl Verb {
    /// Case-insensitive lookup of a command word
    pub fn lookup(word: &str) -> Option<Self> {
        let mut upper = ArrayString::<8>::new();
        for c in word.chars() {
            upper.try_push(c.to_ascii_uppercase()).ok()?;
        }

        VERBS.get(upper.as_str()).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Vrfy => "VRFY",
            Self::Expn => "EXPN",
            Self::Etrn => "ETRN",
            Self::StartTls => "STARTTLS",
            Self::Auth => "AUTH",
            Self::Noop => "NOOP",
            Self::Help => "HELP",
            Self::Verb => "VERB",
            Self::Quit => "QUIT",
        }
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deliver-by request (RFC 2852), `BY=<seconds>;<R|N>[T]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverBy {
    pub seconds: i64,
    pub return_on_expiry: bool,
    pub trace: bool,
}

impl DeliverBy {
    fn parse(value: &str) -> Option<Self> {
        let (seconds, mode) = value.split_once(';')?;
        let seconds = seconds.parse::<i64>().ok()?;
        let mode = mode.to_ascii_uppercase();
        let (mode, trace) = mode
            .strip_suffix('T')
            .map_or((mode.as_str(), false), |m| (m, true));

        let return_on_expiry = match mode {
            "R" => true,
            "N" => false,
            _ => return None,
        };

        // A return request needs a positive deadline
        if return_on_expiry && seconds <= 0 {
            return None;
        }

        Some(Self {
            seconds,
            return_on_expiry,
            trace,
        })
    }
}

/// Parameters accepted on `MAIL FROM`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParameters {
    pub size: Option<usize>,
    pub body: Option<BodyType>,
    /// Decoded `ENVID`
    pub envid: Option<String>,
    pub ret: Option<DsnReturn>,
    /// Decoded `AUTH=` identity, `None` for `AUTH=<>`
    pub auth: Option<String>,
    pub by: Option<DeliverBy>,
}

/// Parameters accepted on `RCPT TO`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RcptParameters {
    pub notify: Option<DsnNotify>,
    /// `ORCPT` as `addr-type;address`, with the address decoded
    pub orcpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// `sender` is `None` for the null reverse-path
    Mail {
        sender: Option<Address>,
        params: MailParameters,
    },
    Rcpt {
        recipient: Address,
        params: RcptParameters,
    },
    Data,
    Rset,
    Vrfy(String),
    Expn(String),
    Etrn(String),
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Noop,
    Help(Option<String>),
    Verb,
    Quit,
}

/// Decodes RFC 3461 `xtext` (`+XX` hex escapes)
pub fn decode_xtext(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                let hex = value.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b @ b'!'..=b'~' if b != b'=' => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }

    String::from_utf8(out).ok()
}

/// Splits `KEY=VALUE` and bare `KEY` tokens
fn parameters(rest: &str) -> impl Iterator<Item = (&str, Option<&str>)> {
    rest.split_ascii_whitespace().map(|token| {
        token
            .split_once('=')
            .map_or((token, None), |(key, value)| (key, Some(value)))
    })
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, CommandError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CommandError::InvalidParameter {
            name: name.to_ascii_uppercase(),
            value: String::new(),
        })
}

fn invalid(name: &str, value: &str) -> CommandError {
    CommandError::InvalidParameter {
        name: name.to_ascii_uppercase(),
        value: value.to_string(),
    }
}

fn once<T>(slot: &mut Option<T>, name: &str, value: T) -> Result<(), CommandError> {
    if slot.is_some() {
        return Err(CommandError::DuplicateParameter(name.to_ascii_uppercase()));
    }
    *slot = Some(value);
    Ok(())
}

impl MailParameters {
    /// Parses everything after the reverse-path.
    ///
    /// # Errors
    /// On unknown, repeated or malformed parameters
    pub fn parse(rest: &str) -> Result<Self, CommandError> {
        let mut params = Self::default();
        let mut auth_seen = false;

        for (key, value) in parameters(rest) {
            match key.to_ascii_uppercase().as_str() {
                "SIZE" => {
                    let value = required(key, value)?;
                    let size = value.parse::<usize>().map_err(|_| invalid(key, value))?;
                    once(&mut params.size, key, size)?;
                }
                "BODY" => {
                    let value = required(key, value)?;
                    let body = match value.to_ascii_uppercase().as_str() {
                        "7BIT" => BodyType::SevenBit,
                        "8BITMIME" => BodyType::EightBitMime,
                        _ => return Err(invalid(key, value)),
                    };
                    once(&mut params.body, key, body)?;
                }
                "ENVID" => {
                    let value = required(key, value)?;
                    let envid = decode_xtext(value).ok_or_else(|| invalid(key, value))?;
                    once(&mut params.envid, key, envid)?;
                }
                "RET" => {
                    let value = required(key, value)?;
                    let ret = DsnReturn::parse(value).ok_or_else(|| invalid(key, value))?;
                    once(&mut params.ret, key, ret)?;
                }
                "AUTH" => {
                    let value = required(key, value)?;
                    if auth_seen {
                        return Err(CommandError::DuplicateParameter("AUTH".to_string()));
                    }
                    auth_seen = true;
                    if value != "<>" {
                        params.auth = Some(decode_xtext(value).ok_or_else(|| invalid(key, value))?);
                    }
                }
                "BY" => {
                    let value = required(key, value)?;
                    let by = DeliverBy::parse(value).ok_or_else(|| invalid(key, value))?;
                    once(&mut params.by, key, by)?;
                }
                _ => return Err(CommandError::UnknownParameter(key.to_ascii_uppercase())),
            }
        }

        Ok(params)
    }
}

impl RcptParameters {
    /// Parses everything after the forward-path.
    ///
    /// # Errors
    /// On unknown, repeated or malformed parameters
    pub fn parse(rest: &str) -> Result<Self, CommandError> {
        let mut params = Self::default();

        for (key, value) in parameters(rest) {
            match key.to_ascii_uppercase().as_str() {
                "NOTIFY" => {
                    let value = required(key, value)?;
                    let notify = DsnNotify::parse(value).ok_or_else(|| invalid(key, value))?;
                    once(&mut params.notify, key, notify)?;
                }
                "ORCPT" => {
                    let value = required(key, value)?;
                    let (kind, address) =
                        value.split_once(';').ok_or_else(|| invalid(key, value))?;
                    if kind.is_empty() || address.is_empty() {
                        return Err(invalid(key, value));
                    }
                    let address = decode_xtext(address).ok_or_else(|| invalid(key, value))?;
                    once(&mut params.orcpt, key, format!("{kind};{address}"))?;
                }
                _ => return Err(CommandError::UnknownParameter(key.to_ascii_uppercase())),
            }
        }

        Ok(params)
    }
}

/// Splits `<path> params` (or a bare path) into the path and the rest
fn split_path(arg: &str) -> (&str, &str) {
    let arg = arg.trim_start();
    let end = if arg.starts_with('<') {
        arg.find('>').map_or(arg.len(), |i| i + 1)
    } else {
        arg.find(char::is_whitespace).unwrap_or(arg.len())
    };

    (&arg[..end], arg[end..].trim())
}

/// Removes an obsolete source route, `<@a,@b:user@host>`
fn strip_route(path: &str) -> String {
    let inner = path
        .strip_prefix('<')
        .and_then(|p| p.strip_suffix('>'))
        .unwrap_or(path);

    match inner.split_once(':') {
        Some((route, mailbox)) if route.starts_with('@') => mailbox.to_string(),
        _ => inner.to_string(),
    }
}

/// Strips a case-insensitive `FROM:`/`TO:` keyword
fn keyword<'a>(arg: &'a str, word: &str, verb: Verb) -> Result<&'a str, CommandError> {
    arg.get(..word.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(word))
        .map(|_| &arg[word.len()..])
        .ok_or_else(|| CommandError::Syntax {
            verb: verb.name(),
            reason: format!("expected {word}"),
        })
}

fn no_argument(verb: Verb, arg: &str, command: Command) -> Result<Command, CommandError> {
    if arg.is_empty() {
        Ok(command)
    } else {
        Err(CommandError::Syntax {
            verb: verb.name(),
            reason: "takes no arguments".to_string(),
        })
    }
}

fn argument(verb: Verb, arg: &str, what: &str) -> Result<String, CommandError> {
    if arg.is_empty() {
        Err(CommandError::Syntax {
            verb: verb.name(),
            reason: format!("requires {what}"),
        })
    } else {
        Ok(arg.to_string())
    }
}

impl Command {
    /// Parses one command line, without its line terminator.
    ///
    /// # Errors
    /// A [`CommandError`] whose reply should be sent back unchanged
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim();
        let (word, arg) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(w, a)| (w, a.trim()));

        let verb =
            Verb::lookup(word).ok_or_else(|| CommandError::Unrecognized(line.to_string()))?;

        match verb {
            Verb::Helo => argument(verb, arg, "domain address").map(Self::Helo),
            Verb::Ehlo => argument(verb, arg, "domain address").map(Self::Ehlo),
            Verb::Mail => {
                let (path, rest) = split_path(keyword(arg, "FROM:", verb)?);
                if path.is_empty() {
                    return Err(CommandError::Syntax {
                        verb: verb.name(),
                        reason: "missing reverse-path".to_string(),
                    });
                }

                let sender = if path == "<>" {
                    None
                } else {
                    Some(
                        Address::parse(&strip_route(path))
                            .map_err(|e| CommandError::Address(e.to_string()))?,
                    )
                };

                Ok(Self::Mail {
                    sender,
                    params: MailParameters::parse(rest)?,
                })
            }
            Verb::Rcpt => {
                let (path, rest) = split_path(keyword(arg, "TO:", verb)?);
                let recipient = Address::parse(&strip_route(path))
                    .map_err(|e| CommandError::Address(e.to_string()))?;

                Ok(Self::Rcpt {
                    recipient,
                    params: RcptParameters::parse(rest)?,
                })
            }
            Verb::Data => no_argument(verb, arg, Self::Data),
            Verb::Rset => no_argument(verb, arg, Self::Rset),
            Verb::StartTls => no_argument(verb, arg, Self::StartTls),
            Verb::Quit => no_argument(verb, arg, Self::Quit),
            Verb::Vrfy => argument(verb, arg, "an address").map(Self::Vrfy),
            Verb::Expn => argument(verb, arg, "an address").map(Self::Expn),
            Verb::Etrn => argument(verb, arg, "a node name").map(Self::Etrn),
            Verb::Auth => {
                let mut parts = arg.split_ascii_whitespace();
                let mechanism = parts.next().ok_or_else(|| CommandError::Syntax {
                    verb: verb.name(),
                    reason: "requires a mechanism".to_string(),
                })?;
                let initial = parts.next().map(ToString::to_string);
                if parts.next().is_some() {
                    return Err(CommandError::Syntax {
                        verb: verb.name(),
                        reason: "too many arguments".to_string(),
                    });
                }

                Ok(Self::Auth {
                    mechanism: mechanism.to_ascii_uppercase(),
                    initial,
                })
            }
            Verb::Noop => Ok(Self::Noop),
            Verb::Help => Ok(Self::Help((!arg.is_empty()).then(|| arg.to_string()))),
            Verb::Verb => Ok(Self::Verb),
        }
    }

    pub const fn verb(&self) -> Verb {
        match self {
            Self::Helo(_) => Verb::Helo,
            Self::Ehlo(_) => Verb::Ehlo,
            Self::Mail { .. } => Verb::Mail,
            Self::Rcpt { .. } => Verb::Rcpt,
            Self::Data => Verb::Data,
            Self::Rset => Verb::Rset,
            Self::Vrfy(_) => Verb::Vrfy,
            Self::Expn(_) => Verb::Expn,
            Self::Etrn(_) => Verb::Etrn,
            Self::StartTls => Verb::StartTls,
            Self::Auth { .. } => Verb::Auth,
            Self::Noop => Verb::Noop,
            Self::Help(_) => Verb::Help,
            Self::Verb => Verb::Verb,
            Self::Quit => Verb::Quit,
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(domain) | Self::Ehlo(domain) => write!(f, "{} {domain}", self.verb()),
            Self::Mail { sender, .. } => match sender {
                Some(sender) => write!(f, "MAIL FROM:<{sender}>"),
                None => f.write_str("MAIL FROM:<>"),
            },
            Self::Rcpt { recipient, .. } => write!(f, "RCPT TO:<{recipient}>"),
            Self::Vrfy(arg) | Self::Expn(arg) | Self::Etrn(arg) => {
                write!(f, "{} {arg}", self.verb())
            }
            // Credentials never reach the logs
            Self::Auth { mechanism, .. } => write!(f, "AUTH {mechanism}"),
            Self::Help(Some(topic)) => write!(f, "HELP {topic}"),
            _ => f.write_str(self.verb().name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(Verb::lookup("ehlo"), Some(Verb::Ehlo));
        assert_eq!(Verb::lookup("StartTLS"), Some(Verb::StartTls));
        assert_eq!(Verb::lookup("STARTTLSX"), None);
        assert_eq!(Verb::lookup("ÉHLO"), None);
    }

    #[test]
    fn mail_with_parameters() {
        let command = Command::parse(
            "MAIL FROM:<alice@example.com> SIZE=1024 BODY=8BITMIME ENVID=abc+2Bdef RET=HDRS",
        )
        .unwrap();

        let Command::Mail { sender, params } = command else {
            panic!("expected MAIL");
        };
        assert_eq!(sender.unwrap().to_string(), "alice@example.com");
        assert_eq!(
            params,
            MailParameters {
                size: Some(1024),
                body: Some(BodyType::EightBitMime),
                envid: Some("abc+def".to_string()),
                ret: Some(DsnReturn::Headers),
                auth: None,
                by: None,
            }
        );
    }

    #[test]
    fn null_sender_and_route() {
        assert_eq!(
            Command::parse("mail from:<>").unwrap(),
            Command::Mail {
                sender: None,
                params: MailParameters::default(),
            }
        );

        let Command::Rcpt { recipient, .. } =
            Command::parse("RCPT TO:<@relay.example:bob@example.org>").unwrap()
        else {
            panic!("expected RCPT");
        };
        assert_eq!(recipient.to_string(), "bob@example.org");
    }

    #[test]
    fn rcpt_parameters() {
        let Command::Rcpt { params, .. } =
            Command::parse("RCPT TO:<bob@example.org> NOTIFY=FAILURE,DELAY ORCPT=rfc822;bob+40example.org")
                .unwrap()
        else {
            panic!("expected RCPT");
        };

        assert_eq!(params.notify.unwrap().to_string(), "FAILURE,DELAY");
        assert_eq!(params.orcpt.as_deref(), Some("rfc822;bob@example.org"));
    }

    #[test]
    fn parameter_errors() {
        assert_eq!(
            Command::parse("MAIL FROM:<a@b.org> SIZE=10 SIZE=20"),
            Err(CommandError::DuplicateParameter("SIZE".to_string()))
        );
        assert_eq!(
            Command::parse("MAIL FROM:<a@b.org> FOO=1"),
            Err(CommandError::UnknownParameter("FOO".to_string()))
        );
        assert!(matches!(
            Command::parse("MAIL FROM:<a@b.org> BODY=9BIT"),
            Err(CommandError::InvalidParameter { .. })
        ));
        assert!(matches!(
            Command::parse("RCPT TO:<a@b.org> NOTIFY=NEVER,SUCCESS"),
            Err(CommandError::InvalidParameter { .. })
        ));
        assert!(matches!(
            Command::parse("MAIL FROM:<a@b.org> BY=0;R"),
            Err(CommandError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn deliver_by() {
        let Command::Mail { params, .. } = Command::parse("MAIL FROM:<a@b.org> BY=120;NT").unwrap()
        else {
            panic!("expected MAIL");
        };
        assert_eq!(
            params.by,
            Some(DeliverBy {
                seconds: 120,
                return_on_expiry: false,
                trace: true,
            })
        );
    }

    #[test]
    fn argument_rules() {
        assert!(matches!(
            Command::parse("HELO"),
            Err(CommandError::Syntax { verb: "HELO", .. })
        ));
        assert!(matches!(
            Command::parse("DATA now"),
            Err(CommandError::Syntax { verb: "DATA", .. })
        ));
        assert!(matches!(
            Command::parse("MAIL <a@b.org>"),
            Err(CommandError::Syntax { verb: "MAIL", .. })
        ));
        assert!(matches!(
            Command::parse("RCPT TO:<nodomain>"),
            Err(CommandError::Address(_))
        ));
        assert_eq!(Command::parse("NOOP anything"), Ok(Command::Noop));
        assert_eq!(
            Command::parse("WHAT is this"),
            Err(CommandError::Unrecognized("WHAT is this".to_string()))
        );
    }

    #[test]
    fn auth_keeps_initial_response_out_of_logs() {
        let command = Command::parse("auth plain AHVzZXIAcGFzcw==").unwrap();
        assert_eq!(
            command,
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("AHVzZXIAcGFzcw==".to_string()),
            }
        );
        assert_eq!(command.to_string(), "AUTH PLAIN");
    }

    #[test]
    fn xtext() {
        assert_eq!(decode_xtext("a+2Bb").as_deref(), Some("a+b"));
        assert_eq!(decode_xtext("a+2"), None);
        assert_eq!(decode_xtext("a=b"), None);
    }
}
