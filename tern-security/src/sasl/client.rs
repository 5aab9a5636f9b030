use super::{Credentials, Mechanism, decode, encode};
use crate::error::SaslError;

/// The client half of one `AUTH` exchange.
#[derive(Debug)]
pub struct ClientExchange<'a> {
    mechanism: Mechanism,
    credentials: &'a Credentials,
    step: usize,
}

impl<'a> ClientExchange<'a> {
    pub const fn new(mechanism: Mechanism, credentials: &'a Credentials) -> Self {
        Self {
            mechanism,
            credentials,
            step: 0,
        }
    }

    pub const fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    fn plain_response(&self) -> String {
        let authzid = self.credentials.authzid.as_deref().unwrap_or_default();
        encode(
            format!(
                "{authzid}\0{}\0{}",
                self.credentials.username, self.credentials.password
            )
            .as_bytes(),
        )
    }

    /// The response sent on the `AUTH` line itself, if the mechanism
    /// starts with one.
    pub fn initial_response(&mut self) -> Option<String> {
        match self.mechanism {
            Mechanism::Plain => {
                self.step = 1;
                Some(self.plain_response())
            }
            Mechanism::Login => None,
        }
    }

    /// Answers a `334` challenge.
    ///
    /// # Errors
    /// If the challenge is not valid base64 or the server asks for more
    /// steps than the mechanism has.
    pub fn respond(&mut self, challenge: &str) -> Result<String, SaslError> {
        let challenge = decode(challenge)?;
        let step = self.step;
        self.step += 1;

        match (self.mechanism, step) {
            (Mechanism::Plain, 0) if challenge.is_empty() => Ok(self.plain_response()),
            (Mechanism::Login, 0) => Ok(encode(self.credentials.username.as_bytes())),
            (Mechanism::Login, 1) => Ok(encode(self.credentials.password.as_bytes())),
            (mechanism, _) => Err(SaslError::UnexpectedStep {
                mechanism: mechanism.name(),
            }),
        }
    }
}
