//! SMTP/LMTP client used to hand messages to the next hop.
//!
//! The client only speaks the protocol; which commands to send, when to
//! pipeline them and what to make of the replies is up to the caller.
//! Security layers are activated through [`SmtpClient::starttls`] and
//! [`SmtpClient::authenticate`], each of which forgets the capabilities
//! learned so far.

mod capabilities;
mod response;
mod smtp_client;

pub use self::{
    capabilities::Capabilities,
    response::{Response, ResponseLine},
    smtp_client::{SmtpClient, Step, encode_body, mail_command, rcpt_command},
};
