//! The tern mail transfer agent: SMTP listeners in front of the delivery
//! engine, wired together from one configuration file.

pub mod config;
pub mod controller;

pub use self::controller::{SHUTDOWN_BROADCAST, Tern};
