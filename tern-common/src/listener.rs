use std::net::SocketAddr;

use ahash::AHashMap;
use serde::Deserialize;
use tokio::{net::TcpListener, task::JoinSet};

use crate::{
    Signal,
    error::{ListenerError, ProtocolError},
    internal,
    traits::protocol::{Protocol, SessionHandler},
};

#[derive(Deserialize)]
pub struct Listener<Proto: Protocol> {
    #[serde(skip)]
    handler: Proto,
    socket: SocketAddr,
    /// Protocol specific settings
    #[serde(default)]
    args: Proto::Args,
    #[serde(default)]
    context: AHashMap<String, String>,
}

impl<Proto: Protocol> Listener<Proto> {
    pub fn new(socket: SocketAddr, args: Proto::Args) -> Self {
        Self {
            handler: Proto::default(),
            socket,
            args,
            context: AHashMap::new(),
        }
    }

    pub const fn socket(&self) -> SocketAddr {
        self.socket
    }

    /// Replaces the listener's arguments, e.g. to inject runtime resources
    pub fn map_args<F>(&mut self, f: F)
    where
        F: Fn(Proto::Args) -> Proto::Args,
    {
        self.args = f(std::mem::take(&mut self.args));
    }

    pub fn init(&mut self) -> Result<(), ProtocolError> {
        self.handler.validate(&mut self.args)
    }

    #[tracing::instrument(level = "trace", skip(self, shutdown), fields(socket = %self.socket))]
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        internal!("Serving {:?} with {:?}", self.socket, self.context);

        let mut sessions = JoinSet::new();
        let listener =
            TcpListener::bind(self.socket)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: self.socket.to_string(),
                    source,
                })?;

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(
                            level = INFO,
                            "{} Listener {} received Shutdown signal, finishing sessions ...",
                            Proto::ty(),
                            self.socket
                        );
                        while sessions.join_next().await.is_some() {}
                        return Ok(());
                    }
                }

                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("Connection received on {} from {peer}", self.socket);

                    let session = self.handler.handle(
                        stream,
                        peer,
                        self.context.clone(),
                        self.args.clone(),
                    );
                    let signal = shutdown.resubscribe();

                    sessions.spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            internal!(level = ERROR, "Session with {peer} ended: {err}");
                        }
                    });
                }
            }
        }
    }
}
