//! Service extensions advertised by a peer in its `EHLO`/`LHLO` reply.

use super::response::Response;

/// What the peer said it supports.
///
/// Only valid until the next security layer activates; the client drops
/// it after `STARTTLS` and after `AUTH` installs a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Each flag is an independent extension keyword"
)]
pub struct Capabilities {
    pub pipelining: bool,
    /// `SIZE` limit; `Some(0)` when advertised without a limit
    pub size: Option<usize>,
    pub dsn: bool,
    pub starttls: bool,
    pub eight_bit_mime: bool,
    pub enhanced_status_codes: bool,
    /// `AUTH` mechanisms, upper-cased
    pub auth: Vec<String>,
}

impl Capabilities {
    /// Reads the keyword lines of an `EHLO` reply; the first line is the
    /// greeting and carries no keyword.
    pub fn parse(response: &Response) -> Self {
        let mut capabilities = Self::default();

        for line in response.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };

            match keyword.to_ascii_uppercase().as_str() {
                "PIPELINING" => capabilities.pipelining = true,
                "SIZE" => {
                    capabilities.size =
                        Some(words.next().and_then(|n| n.parse().ok()).unwrap_or(0));
                }
                "DSN" => capabilities.dsn = true,
                "STARTTLS" => capabilities.starttls = true,
                "8BITMIME" => capabilities.eight_bit_mime = true,
                "ENHANCEDSTATUSCODES" => capabilities.enhanced_status_codes = true,
                "AUTH" => capabilities
                    .auth
                    .extend(words.map(str::to_ascii_uppercase)),
                // Old-style `AUTH=PLAIN LOGIN`
                other => {
                    if let Some(first) = other.strip_prefix("AUTH=") {
                        capabilities.auth.push(first.to_string());
                        capabilities
                            .auth
                            .extend(words.map(str::to_ascii_uppercase));
                    }
                }
            }
        }

        capabilities.auth.dedup();
        capabilities
    }

    /// Whether a message of `size` bytes fits the advertised limit
    pub fn accepts_size(&self, size: usize) -> bool {
        self.size.is_none_or(|limit| limit == 0 || size <= limit)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ehlo(lines: &[&str]) -> Response {
        Response::new(250, lines.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn parses_common_keywords() {
        let capabilities = Capabilities::parse(&ehlo(&[
            "mx.example.com Hello",
            "PIPELINING",
            "SIZE 10240000",
            "DSN",
            "8BITMIME",
            "STARTTLS",
            "ENHANCEDSTATUSCODES",
            "AUTH PLAIN login",
        ]));

        assert_eq!(
            capabilities,
            Capabilities {
                pipelining: true,
                size: Some(10_240_000),
                dsn: true,
                starttls: true,
                eight_bit_mime: true,
                enhanced_status_codes: true,
                auth: vec!["PLAIN".to_string(), "LOGIN".to_string()],
            }
        );
        assert!(capabilities.accepts_size(10_240_000));
        assert!(!capabilities.accepts_size(10_240_001));
    }

    #[test]
    fn greeting_line_is_not_a_keyword() {
        let capabilities = Capabilities::parse(&ehlo(&["PIPELINING ready"]));
        assert!(!capabilities.pipelining);
        assert!(capabilities.accepts_size(usize::MAX));
    }

    #[test]
    fn legacy_auth_and_unlimited_size() {
        let capabilities = Capabilities::parse(&ehlo(&["mx", "AUTH=PLAIN", "SIZE"]));
        assert_eq!(capabilities.auth, vec!["PLAIN".to_string()]);
        assert_eq!(capabilities.size, Some(0));
        assert!(capabilities.accepts_size(usize::MAX));
    }
}
