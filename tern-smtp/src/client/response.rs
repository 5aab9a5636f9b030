//! Replies read by the client, possibly spanning several lines.

use core::fmt::{self, Display, Formatter};

use tern_common::{EnhancedStatus, Reply, Status};

use crate::error::{ClientError, ClientResult};

/// One line of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// `false` for `250-` continuation lines
    pub is_last: bool,
    pub message: String,
}

/// A complete reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All lines joined by newlines
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// `3xx`, the peer wants more
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// The enhanced status code at the start of the last line, if any
    #[must_use]
    pub fn enhanced(&self) -> Option<EnhancedStatus> {
        let last = self.lines.last()?;
        let first = last.split_whitespace().next()?;
        let enhanced = first.parse::<EnhancedStatus>().ok()?;

        // The class must agree with the reply code
        (u16::from(enhanced.class) == self.code / 100).then_some(enhanced)
    }

    /// The last line without its enhanced status code
    #[must_use]
    pub fn text(&self) -> &str {
        let last = self.lines.last().map_or("", String::as_str);
        if self.enhanced().is_some() {
            last.split_once(' ').map_or("", |(_, text)| text)
        } else {
            last
        }
    }

    /// This response as a [`Reply`], for recording against recipients
    #[must_use]
    pub fn to_reply(&self) -> Reply {
        Reply::new(Status::from(u32::from(self.code)), self.enhanced(), self.text())
    }

    /// Parses a single response line.
    ///
    /// # Errors
    /// If the line does not start with a three digit code followed by a
    /// space or a dash
    pub fn parse_line(line: &str) -> ClientResult<ResponseLine> {
        let code = line
            .get(..3)
            .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| ClientError::ParseError(format!("Invalid status code: '{line}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{}'",
                    char::from(*c)
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it used, or `None` when
    /// more input is needed.
    ///
    /// # Errors
    /// If a line is malformed or the codes of a multi-line reply disagree
    pub fn parse_response(buffer: &[u8]) -> ClientResult<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|b| *b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let line = Self::parse_line(std::str::from_utf8(raw)?)?;
            match code {
                Some(code) if code != line.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        line.code
                    )));
                }
                Some(_) => {}
                None => code = Some(line.code),
            }

            lines.push(line.message);
            if line.is_last {
                return Ok(code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.last().map_or("", String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_single_line() {
        assert_eq!(
            Response::parse_line("220 mail.example.com ESMTP").unwrap(),
            ResponseLine {
                code: 220,
                is_last: true,
                message: "mail.example.com ESMTP".to_string(),
            }
        );
        assert!(!Response::parse_line("250-mail.example.com").unwrap().is_last);
        assert!(Response::parse_line("25").is_err());
        assert!(Response::parse_line("250_x").is_err());
    }

    #[test]
    fn parse_multi_line_response() {
        let data = b"250-mail.example.com\r\n250-SIZE 10000000\r\n250 HELP\r\nNEXT";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mail.example.com", "SIZE 10000000", "HELP"]
        );
        assert_eq!(consumed, 51);
    }

    #[test]
    fn incomplete_responses_wait() {
        assert!(
            Response::parse_response(b"250-mail.example.com\r\n250-SIZE")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn mismatched_codes() {
        assert!(Response::parse_response(b"250-a\r\n251 b\r\n").is_err());
    }

    #[test]
    fn enhanced_codes() {
        let response = Response::new(550, vec!["5.1.1 User unknown".to_string()]);
        assert_eq!(response.enhanced(), Some(EnhancedStatus::BAD_MAILBOX));
        assert_eq!(response.text(), "User unknown");
        assert_eq!(response.to_reply().to_string(), "550 5.1.1 User unknown");

        // A class that contradicts the code is ignored
        let response = Response::new(250, vec!["5.1.1 odd".to_string()]);
        assert_eq!(response.enhanced(), None);
        assert_eq!(response.text(), "5.1.1 odd");
    }
}
