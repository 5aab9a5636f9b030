use std::{fmt::Debug, net::SocketAddr};

use ahash::AHashMap;
use serde::Deserialize;
use tokio::net::TcpStream;

use crate::{
    Signal,
    error::{ProtocolError, SessionError},
};

pub trait SessionHandler {
    fn run(
        self,
        signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;
}

pub trait Protocol: Default + Send + Sync {
    type Session: SessionHandler + Send + Sync + 'static;
    type Args: Default + Clone + Debug + Send + Sync + for<'a> Deserialize<'a>;

    /// Builds the session for a freshly accepted connection
    fn handle(
        &self,
        stream: TcpStream,
        address: SocketAddr,
        context: AHashMap<String, String>,
        args: Self::Args,
    ) -> Self::Session;

    ///
    /// Validate the arguments being provided to the protocol
    ///
    /// # Errors
    /// For example, when TLS certificates/keys are configured it is necessary
    /// to check that the paths provided actually exist
    ///
    fn validate(&mut self, args: &mut Self::Args) -> Result<(), ProtocolError>;

    fn ty() -> &'static str;
}
