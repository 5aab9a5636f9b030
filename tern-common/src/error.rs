//! Errors shared by the listeners, the sessions they spawn and the queue.

use std::io;

use thiserror::Error;
use ulid::Ulid;

/// A protocol's arguments were rejected when its listener was set up.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },
}

/// Why a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer broke the protocol or the channel failed mid-reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// No command or data arrived in time
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),
}

/// Errors raised while parsing an envelope address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The path was empty (`<>` where a mailbox is required).
    #[error("Empty address")]
    Empty,

    #[error("Address has no domain: {0}")]
    MissingDomain(String),

    #[error("Invalid address: {0}")]
    Invalid(String),
}

/// Errors from a [`QueueStore`](crate::traits::QueueStore).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Envelope {0} is not queued")]
    NotFound(Ulid),

    /// Another worker holds the claim on this envelope
    #[error("Envelope {0} is claimed by another worker")]
    Claimed(Ulid),

    /// The store could not be read or written
    #[error("Queue I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file found, tried: {0}")]
    NotFound(String),

    #[error("Failed to read configuration from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A value is out of range or inconsistent with another
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },
}
