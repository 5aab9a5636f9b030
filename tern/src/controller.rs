use std::sync::{Arc, LazyLock};

use serde::Deserialize;
use tern_common::{
    Signal,
    controller::Controller,
    error::ConfigError,
    internal, logging,
    queue::MemoryQueue,
    routing::{RoutingTable, StaticRouter},
    traits::{AliasExpander, DeliveryHandoff, QueueRunner, QueueStore},
};
use tern_delivery::{Delivery, DeliveryConfig, ErrorResponseFormatter};
use tern_smtp::Smtp;
use tokio::sync::broadcast;

/// The whole MTA as configured.
#[derive(Default, Deserialize)]
pub struct Tern {
    #[serde(alias = "smtp", default)]
    smtp_controller: Controller<Smtp>,
    #[serde(default)]
    delivery: DeliveryConfig,
    #[serde(default)]
    routing: RoutingTable,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Waits for SIGINT or SIGTERM and tells everything to stop. A second
/// SIGINT exits without waiting.
#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    tokio::signal::ctrl_c().await?;
    internal!(level = WARN, "Forcing shutdown");
    std::process::exit(130);
}

fn require_mailer(
    known: &[String],
    field: &str,
    name: &str,
) -> Result<(), ConfigError> {
    if known.iter().any(|known| known == name) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: format!("routing.{field}"),
            reason: format!("no mailer named {name:?} is configured"),
        })
    }
}

impl Tern {
    /// Parses a configuration file's contents
    ///
    /// # Errors
    /// If `text` is not valid RON for this configuration
    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    pub const fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    pub const fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Checks that every mailer the routing table can pick exists
    ///
    /// # Errors
    /// Naming the first routing entry without a mailer
    pub fn verify(&self) -> Result<(), ConfigError> {
        let known = self
            .delivery
            .mailers
            .iter()
            .map(|mailer| mailer.name.clone())
            .collect::<Vec<_>>();

        require_mailer(&known, "relay_mailer", &self.routing.relay_mailer)?;
        if !self.routing.local_domains.is_empty() {
            require_mailer(&known, "local_mailer", &self.routing.local_mailer)?;
        }
        let programs = self
            .routing
            .aliases
            .values()
            .flatten()
            .any(|target| target.starts_with('|'));
        if programs {
            require_mailer(&known, "program_mailer", &self.routing.program_mailer)?;
        }

        Ok(())
    }

    /// Run the listeners and the delivery side until a shutdown signal
    ///
    /// # Errors
    ///
    /// If the configuration is inconsistent, a listener cannot be set up or
    /// the system resolver cannot be loaded.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        self.verify()?;

        let Self {
            mut smtp_controller,
            delivery,
            routing,
        } = self;

        internal!(level = INFO, "Controller running");

        let router: Arc<dyn AliasExpander> =
            Arc::new(StaticRouter::new(routing, &delivery.mailers()));
        let delivery = Arc::new(Delivery::from_config(
            delivery,
            ErrorResponseFormatter::new(),
        )?);
        let queue: Arc<dyn QueueStore> = Arc::new(MemoryQueue::new());

        smtp_controller.map_args(|args| {
            args.with_queue(Arc::clone(&queue))
                .with_handoff(Arc::clone(&delivery) as Arc<dyn DeliveryHandoff>)
                .with_queue_runner(Arc::clone(&delivery) as Arc<dyn QueueRunner>)
                .with_expander(Arc::clone(&router))
        });
        smtp_controller.init()?;

        let signals = tokio::spawn(shutdown());
        let listeners = async {
            let result = smtp_controller
                .control(SHUTDOWN_BROADCAST.subscribe())
                .await;
            // Listeners that stop on their own take delivery down with them
            let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
            result
        };
        let (listeners, delivered) = tokio::join!(
            listeners,
            delivery.serve(Arc::clone(&queue), SHUTDOWN_BROADCAST.subscribe())
        );
        signals.abort();

        internal!(level = INFO, "Shutting down...");

        listeners?;
        delivered?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tern_common::mailer::MailerKind;

    use super::*;

    const SAMPLE: &str = include_str!("../../tern.config.ron");

    #[test]
    fn sample_configuration_parses() {
        let tern = Tern::from_ron(SAMPLE).unwrap();

        assert_eq!(tern.delivery().hostname, "mx.tern.test");
        assert_eq!(
            tern.delivery()
                .mailers
                .iter()
                .map(|mailer| mailer.name.as_str())
                .collect::<Vec<_>>(),
            vec!["esmtp", "relay", "local", "prog"]
        );
        assert!(matches!(
            tern.delivery().mailers[2].kind,
            MailerKind::Local { .. }
        ));
        assert_eq!(tern.routing().local_domains, vec!["tern.test".to_string()]);
        assert!(tern.verify().is_ok());
    }

    #[test]
    fn empty_configuration_uses_defaults() {
        let tern = Tern::from_ron("()").unwrap();
        assert_eq!(tern.routing().relay_mailer, "esmtp");
        assert!(tern.verify().is_ok());
    }

    #[test]
    fn routing_needs_its_mailers() {
        let tern = Tern::from_ron(r#"(routing: (local_domains: ["tern.test"]))"#).unwrap();
        let err = tern.verify().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { ref field, .. } if field == "routing.local_mailer"
        ));

        let tern = Tern::from_ron(r#"(routing: (aliases: {"log": ["|/usr/bin/logger"]}))"#)
            .unwrap();
        assert!(tern.verify().is_err());
    }
}
