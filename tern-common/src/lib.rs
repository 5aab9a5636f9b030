pub mod address;
pub mod config;
pub mod controller;
pub mod dsn;
pub mod envelope;
pub mod error;
pub mod exit;
pub mod listener;
pub mod load;
pub mod logging;
pub mod mailer;
pub mod queue;
pub mod recipient;
pub mod routing;
pub mod status;
pub mod traits;

pub use tracing;

pub use self::{
    address::Address,
    dsn::DsnNotify,
    envelope::Envelope,
    exit::ExitCode,
    mailer::MailerDescriptor,
    recipient::{Recipient, RecipientState},
    status::{EnhancedStatus, Reply, Status},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
