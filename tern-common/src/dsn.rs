use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Per-recipient `NOTIFY=` request (RFC 3461)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DsnNotify {
    pub success: bool,
    pub failure: bool,
    pub delay: bool,
    pub never: bool,
}

/// The `RET=` parameter of `MAIL FROM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DsnReturn {
    Full,
    Headers,
}

impl DsnNotify {
    pub const NEVER: Self = Self {
        success: false,
        failure: false,
        delay: false,
        never: true,
    };

    /// Parses the value of a `NOTIFY=` parameter.
    ///
    /// `NEVER` must appear alone.
    pub fn parse(value: &str) -> Option<Self> {
        let mut notify = Self::default();

        for keyword in value.split(',') {
            match keyword.trim().to_ascii_uppercase().as_str() {
                "SUCCESS" => notify.success = true,
                "FAILURE" => notify.failure = true,
                "DELAY" => notify.delay = true,
                "NEVER" => notify.never = true,
                _ => return None,
            }
        }

        if notify.never && (notify.success || notify.failure || notify.delay) {
            return None;
        }

        Some(notify)
    }

    /// True if the sender asked for any notification at all, including the
    /// implied defaults when no `NOTIFY=` was given.
    pub const fn wants_any(self) -> bool {
        !self.never
    }

    pub const fn is_explicit(self) -> bool {
        self.success || self.failure || self.delay || self.never
    }
}

impl Display for DsnNotify {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.never {
            return f.write_str("NEVER");
        }

        let parts = [
            (self.success, "SUCCESS"),
            (self.failure, "FAILURE"),
            (self.delay, "DELAY"),
        ];
        let rendered = parts
            .iter()
            .filter_map(|(set, name)| set.then_some(*name))
            .collect::<Vec<_>>()
            .join(",");

        f.write_str(&rendered)
    }
}

impl DsnReturn {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "FULL" => Some(Self::Full),
            "HDRS" => Some(Self::Headers),
            _ => None,
        }
    }
}

impl Display for DsnReturn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "FULL",
            Self::Headers => "HDRS",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_in_fixed_order() {
        let notify = DsnNotify::parse("delay,SUCCESS").unwrap();
        assert_eq!(notify.to_string(), "SUCCESS,DELAY");

        let all = DsnNotify::parse("FAILURE,DELAY,SUCCESS").unwrap();
        assert_eq!(all.to_string(), "SUCCESS,FAILURE,DELAY");

        assert_eq!(DsnNotify::NEVER.to_string(), "NEVER");
    }

    #[test]
    fn never_is_exclusive() {
        assert!(DsnNotify::parse("NEVER,SUCCESS").is_none());
        assert!(DsnNotify::parse("SOMETIMES").is_none());
        assert!(!DsnNotify::parse("NEVER").unwrap().wants_any());
    }

    #[test]
    fn ret_keywords() {
        assert_eq!(DsnReturn::parse("hdrs"), Some(DsnReturn::Headers));
        assert_eq!(DsnReturn::parse("FULL"), Some(DsnReturn::Full));
        assert_eq!(DsnReturn::parse("BODY"), None);
    }
}
