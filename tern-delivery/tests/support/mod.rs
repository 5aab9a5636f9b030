//! Helpers shared by the delivery integration tests.

pub mod mock_server;

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use tern_common::{
    Address, Envelope, MailerDescriptor, Recipient, config::TlsConfig, mailer::MailerKind,
};
use tern_delivery::{DeliveryConfig, DeliveryEngine, ErrorResponseFormatter, StaticLookup};
use tern_security::ClientTlsContext;

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// An ESMTP mailer speaking to `port`
pub fn esmtp(port: u16) -> Arc<MailerDescriptor> {
    let mut mailer = MailerDescriptor::esmtp("esmtp");
    mailer.kind = MailerKind::Network { port };
    Arc::new(mailer)
}

/// An LMTP mailer speaking to `port`
pub fn lmtp(port: u16) -> Arc<MailerDescriptor> {
    let mut mailer = MailerDescriptor::esmtp("lmtp");
    mailer.kind = MailerKind::Network { port };
    mailer.flags.lmtp = true;
    Arc::new(mailer)
}

/// `example.test` handled by one MX on the loopback interface
pub fn lookup() -> StaticLookup {
    StaticLookup::new()
        .with_mx("example.test", &[("mx1.example.test", 10)])
        .with_address("mx1.example.test", LOCALHOST)
}

pub fn engine(lookup: StaticLookup, tls: TlsConfig) -> DeliveryEngine {
    let tls_context = Arc::new(ClientTlsContext::new(&tls));
    let config = DeliveryConfig {
        hostname: "client.test".to_string(),
        tls,
        ..DeliveryConfig::default()
    };

    DeliveryEngine::new(
        Arc::new(config),
        Arc::new(lookup),
        tls_context,
        ErrorResponseFormatter::new(),
    )
}

/// An envelope from `sender@tern.test` to `recipients`, all through `mailer`
pub fn envelope(mailer: &Arc<MailerDescriptor>, recipients: &[&str]) -> Envelope {
    let mut envelope = Envelope::new(Some(Address::parse("sender@tern.test").unwrap()));
    for recipient in recipients {
        let address = Address::parse(recipient).unwrap();
        let host = address.domain().unwrap_or_default().to_string();
        envelope.add_recipient(Recipient::new(address, Arc::clone(mailer), host));
    }
    envelope.set_body(Arc::from(
        &b"Subject: test\r\n\r\nHello\r\n.leading dot\r\n"[..],
    ));
    envelope
}
