use futures_util::future::join_all;
use serde::Deserialize;
use tokio::sync::broadcast::Receiver;

use crate::{
    Signal,
    error::{ControllerError, ProtocolError},
    internal,
    listener::Listener,
    traits::Protocol,
};

#[derive(Deserialize)]
#[serde(bound = "")]
pub struct Controller<Proto: Protocol> {
    #[serde(alias = "listener", default)]
    listeners: Vec<Listener<Proto>>,
}

impl<Proto: Protocol> Default for Controller<Proto> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<Proto: Protocol> Controller<Proto> {
    pub fn add_listener(&mut self, listener: Listener<Proto>) {
        self.listeners.push(listener);
    }

    /// Map over the args of all listeners, allowing modification before initialization
    ///
    /// This is how runtime resources that cannot be deserialized, such as the
    /// queue store or the delivery hand-off, reach the sessions.
    pub fn map_args<F>(&mut self, f: F)
    where
        F: Fn(Proto::Args) -> Proto::Args,
    {
        for listener in &mut self.listeners {
            listener.map_args(&f);
        }
    }

    ///
    /// Initialise this controller
    ///
    /// # Errors
    /// Any listener whose arguments fail validation
    ///
    pub fn init(&mut self) -> Result<(), ProtocolError> {
        internal!("Initialising Controller for {}", Proto::ty());

        self.listeners.iter_mut().try_for_each(Listener::init)
    }

    ///
    /// # Errors
    /// If any of the listeners have a failure
    ///
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn control(self, signal: Receiver<Signal>) -> Result<(), ControllerError> {
        join_all(
            self.listeners
                .iter()
                .map(|listener| listener.serve(signal.resubscribe())),
        )
        .await
        .into_iter()
        .try_for_each(|result| result.map_err(ControllerError::from))
    }
}
