use ahash::AHashMap;
use async_trait::async_trait;
use serde::Deserialize;

use super::{Mechanism, decode, encode};
use crate::error::SaslError;

/// Checks credentials presented over `AUTH`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns the identity to record for the session if the credentials
    /// are valid. `authzid`, when given, must be one the user may act as.
    async fn verify(&self, authzid: Option<&str>, username: &str, password: &str)
    -> Option<String>;
}

/// A fixed table of users and passwords loaded from configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticCredentials {
    users: AHashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn verify(
        &self,
        authzid: Option<&str>,
        username: &str,
        password: &str,
    ) -> Option<String> {
        let known = self.users.get(username)?;
        if known != password {
            return None;
        }

        match authzid {
            None => Some(username.to_string()),
            Some(authzid) if authzid.is_empty() || authzid == username => {
                Some(username.to_string())
            }
            Some(_) => None,
        }
    }
}

/// Outcome of feeding one client line to a [`ServerExchange`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send `334` with this (already encoded) challenge
    Challenge(String),
    /// The client has supplied everything the mechanism needs
    Complete {
        authzid: Option<String>,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Start,
    AwaitPlain,
    AwaitUsername,
    AwaitPassword(String),
    Done,
}

/// The server half of one `AUTH` exchange.
#[derive(Debug)]
pub struct ServerExchange {
    mechanism: Mechanism,
    state: State,
}

impl ServerExchange {
    pub const fn new(mechanism: Mechanism) -> Self {
        Self {
            mechanism,
            state: State::Start,
        }
    }

    pub const fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    fn utf8(bytes: Vec<u8>, mechanism: &'static str) -> Result<String, SaslError> {
        String::from_utf8(bytes).map_err(|_| SaslError::Malformed { mechanism })
    }

    fn plain(payload: Vec<u8>) -> Result<Step, SaslError> {
        let malformed = SaslError::Malformed { mechanism: "PLAIN" };
        let mut parts = payload.split(|b| *b == 0);
        let (Some(authzid), Some(username), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed);
        };

        if username.is_empty() {
            return Err(malformed);
        }

        Ok(Step::Complete {
            authzid: (!authzid.is_empty())
                .then(|| Self::utf8(authzid.to_vec(), "PLAIN"))
                .transpose()?,
            username: Self::utf8(username.to_vec(), "PLAIN")?,
            password: Self::utf8(password.to_vec(), "PLAIN")?,
        })
    }

    /// Advances the exchange. `response` is `None` for an `AUTH` command
    /// without an initial response.
    ///
    /// # Errors
    /// On malformed or cancelled responses, or when driven past the end.
    pub fn step(&mut self, response: Option<&str>) -> Result<Step, SaslError> {
        let state = std::mem::replace(&mut self.state, State::Done);

        let (next, step) = match (self.mechanism, state, response) {
            (Mechanism::Plain, State::Start, None) => {
                (State::AwaitPlain, Step::Challenge(String::new()))
            }
            (Mechanism::Plain, State::Start | State::AwaitPlain, Some(response)) => {
                (State::Done, Self::plain(decode(response)?)?)
            }
            (Mechanism::Login, State::Start, None) => (
                State::AwaitUsername,
                Step::Challenge(encode(b"Username:")),
            ),
            (Mechanism::Login, State::Start | State::AwaitUsername, Some(response)) => {
                let username = Self::utf8(decode(response)?, "LOGIN")?;
                (
                    State::AwaitPassword(username),
                    Step::Challenge(encode(b"Password:")),
                )
            }
            (Mechanism::Login, State::AwaitPassword(username), Some(response)) => (
                State::Done,
                Step::Complete {
                    authzid: None,
                    username,
                    password: Self::utf8(decode(response)?, "LOGIN")?,
                },
            ),
            (mechanism, _, _) => {
                return Err(SaslError::UnexpectedStep {
                    mechanism: mechanism.name(),
                });
            }
        };

        self.state = next;
        Ok(step)
    }
}

/// Bounds failed `AUTH` attempts within one session
#[derive(Debug, Clone, Copy)]
pub struct AttemptLimiter {
    limit: u32,
    failed: u32,
}

impl AttemptLimiter {
    pub const fn new(limit: u32) -> Self {
        Self { limit, failed: 0 }
    }

    /// Records a failure; returns `true` once the session should be dropped
    pub const fn record_failure(&mut self) -> bool {
        self.failed = self.failed.saturating_add(1);
        self.failed >= self.limit
    }

    pub const fn failures(&self) -> u32 {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plain_with_initial_response() {
        let mut exchange = ServerExchange::new(Mechanism::Plain);
        assert_eq!(
            exchange.step(Some("AHVzZXIAcGFzcw==")),
            Ok(Step::Complete {
                authzid: None,
                username: "user".to_string(),
                password: "pass".to_string(),
            })
        );
        assert!(exchange.step(Some("AHVzZXIAcGFzcw==")).is_err());
    }

    #[test]
    fn plain_rejects_malformed_payload() {
        let mut exchange = ServerExchange::new(Mechanism::Plain);
        assert_eq!(exchange.step(None), Ok(Step::Challenge(String::new())));
        assert_eq!(
            exchange.step(Some(&encode(b"user-only"))),
            Err(SaslError::Malformed { mechanism: "PLAIN" })
        );
    }

    #[test]
    fn login_prompts_for_both_fields() {
        let mut exchange = ServerExchange::new(Mechanism::Login);
        assert_eq!(
            exchange.step(None),
            Ok(Step::Challenge("VXNlcm5hbWU6".to_string()))
        );
        assert_eq!(
            exchange.step(Some("dXNlcg==")),
            Ok(Step::Challenge("UGFzc3dvcmQ6".to_string()))
        );
        assert_eq!(
            exchange.step(Some("cGFzcw==")),
            Ok(Step::Complete {
                authzid: None,
                username: "user".to_string(),
                password: "pass".to_string(),
            })
        );
    }

    #[test]
    fn cancelled_exchange() {
        let mut exchange = ServerExchange::new(Mechanism::Login);
        exchange.step(None).unwrap();
        assert_eq!(exchange.step(Some("*")), Err(SaslError::Cancelled));
    }

    #[tokio::test]
    async fn static_credentials() {
        let store = StaticCredentials::new([("user".to_string(), "pass".to_string())]);
        assert_eq!(
            store.verify(None, "user", "pass").await.as_deref(),
            Some("user")
        );
        assert_eq!(store.verify(None, "user", "wrong").await, None);
        assert_eq!(store.verify(Some("admin"), "user", "pass").await, None);
        assert_eq!(store.verify(None, "nobody", "pass").await, None);
    }

    #[test]
    fn attempts_are_bounded() {
        let mut limiter = AttemptLimiter::new(3);
        assert!(!limiter.record_failure());
        assert!(!limiter.record_failure());
        assert!(limiter.record_failure());
        assert_eq!(limiter.failures(), 3);
    }
}
