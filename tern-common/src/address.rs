use core::fmt::{self, Display, Formatter};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// A mailbox as it appears on the envelope (`local@domain`).
///
/// The domain part is stored lowercased; the local part is preserved as
/// given. A bare `postmaster` is the only accepted address without a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    local: String,
    domain: Option<String>,
}

impl Address {
    /// Parses an envelope path, with or without the surrounding angle brackets.
    ///
    /// # Errors
    /// If the path is empty or not a single mailbox
    pub fn parse(path: &str) -> Result<Self, AddressError> {
        let trimmed = path.trim();
        let inner = trimmed
            .strip_prefix('<')
            .and_then(|p| p.strip_suffix('>'))
            .unwrap_or(trimmed);

        if inner.is_empty() {
            return Err(AddressError::Empty);
        }

        if inner.eq_ignore_ascii_case("postmaster") {
            return Ok(Self {
                local: inner.to_string(),
                domain: None,
            });
        }

        let parsed =
            mailparse::addrparse(inner).map_err(|e| AddressError::Invalid(e.to_string()))?;
        let addr = match parsed.first() {
            Some(MailAddr::Single(info)) if parsed.len() == 1 => info.addr.clone(),
            _ => return Err(AddressError::Invalid(inner.to_string())),
        };

        let (local, domain) = addr
            .rsplit_once('@')
            .ok_or_else(|| AddressError::MissingDomain(addr.clone()))?;

        if local.is_empty() || domain.is_empty() {
            return Err(AddressError::Invalid(addr.clone()));
        }

        Ok(Self {
            local: local.to_string(),
            domain: Some(domain.to_ascii_lowercase()),
        })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{}@{domain}", self.local),
            None => f.write_str(&self.local),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_and_bare() {
        let bracketed = Address::parse("<Alice@Example.COM>").unwrap();
        assert_eq!(bracketed.local(), "Alice");
        assert_eq!(bracketed.domain(), Some("example.com"));

        let bare = Address::parse("bob@example.org").unwrap();
        assert_eq!(bare.to_string(), "bob@example.org");
    }

    #[test]
    fn postmaster_without_domain() {
        let pm = Address::parse("<Postmaster>").unwrap();
        assert_eq!(pm.domain(), None);
        assert_eq!(pm.to_string(), "Postmaster");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(Address::parse("<>"), Err(AddressError::Empty)));
        assert!(Address::parse("no-domain").is_err());
        assert!(Address::parse("a@b.com, c@d.com").is_err());
    }
}
