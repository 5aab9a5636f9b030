use std::sync::Arc;

use ahash::AHashMap;
use ulid::Ulid;

use crate::{
    address::Address,
    dsn::DsnReturn,
    recipient::{Recipient, RecipientState},
};

/// Declared transfer encoding of the message body (`BODY=`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BodyType {
    #[default]
    SevenBit,
    EightBitMime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeFlags {
    /// Accept the message but deliver it nowhere
    pub discard: bool,
    /// A fatal error was already reported for this envelope
    pub fatal_errors: bool,
    /// This envelope was split from a parent
    pub split: bool,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    id: Ulid,
    sender: Option<Address>,
    recipients: Vec<Recipient>,
    pub size: usize,
    pub body_type: BodyType,
    pub envid: Option<String>,
    pub ret: Option<DsnReturn>,
    pub hop_count: usize,
    pub flags: EnvelopeFlags,
    pub priority: u64,
    /// Responsible owner when this envelope was split off by owner
    pub owner: Option<String>,
    pub macros: AHashMap<String, String>,
    pub body: Option<Arc<[u8]>>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Envelope {
    pub fn new(sender: Option<Address>) -> Self {
        Self {
            id: Ulid::new(),
            sender,
            recipients: Vec::new(),
            size: 0,
            body_type: BodyType::default(),
            envid: None,
            ret: None,
            hop_count: 0,
            flags: EnvelopeFlags::default(),
            priority: 0,
            owner: None,
            macros: AHashMap::new(),
            body: None,
        }
    }

    pub const fn id(&self) -> Ulid {
        self.id
    }

    /// Returns a reference to the sender for this message, `None` for the null sender
    #[inline]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// Returns a mutable reference to the sender for this message
    #[inline]
    pub const fn sender_mut(&mut self) -> &mut Option<Address> {
        &mut self.sender
    }

    /// Sender as written on the wire, `<>` for the null sender
    pub fn sender_path(&self) -> String {
        self.sender
            .as_ref()
            .map_or_else(|| "<>".to_string(), |sender| format!("<{sender}>"))
    }

    #[inline]
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    #[inline]
    pub fn recipients_mut(&mut self) -> &mut [Recipient] {
        &mut self.recipients
    }

    pub fn add_recipient(&mut self, recipient: Recipient) {
        self.recipients.push(recipient);
    }

    pub fn set_body(&mut self, body: Arc<[u8]>) {
        self.size = body.len();
        self.body = Some(body);
    }

    /// Whether any recipient still needs a delivery attempt
    pub fn has_pending(&self) -> bool {
        self.recipients.iter().any(|r| r.state().is_pending())
    }

    pub fn count_in(&self, state: RecipientState) -> usize {
        self.recipients.iter().filter(|r| r.state() == state).count()
    }

    /// Splits off one envelope per distinct recipient owner.
    ///
    /// Recipients without an owner stay with `self`. Each sibling shares the
    /// body and sender and is flagged as split; the returned list never
    /// includes `self`.
    pub fn split_by_owner(&mut self) -> Vec<Self> {
        let mut siblings: Vec<Self> = Vec::new();
        let mut remaining = Vec::with_capacity(self.recipients.len());

        for recipient in self.recipients.drain(..) {
            let Some(owner) = recipient.owner.clone() else {
                remaining.push(recipient);
                continue;
            };

            if let Some(sibling) = siblings
                .iter_mut()
                .find(|s| s.owner.as_deref() == Some(owner.as_str()))
            {
                sibling.recipients.push(recipient);
            } else {
                let mut sibling = Self {
                    id: Ulid::new(),
                    sender: self.sender.clone(),
                    recipients: vec![recipient],
                    size: self.size,
                    body_type: self.body_type,
                    envid: self.envid.clone(),
                    ret: self.ret,
                    hop_count: self.hop_count,
                    flags: self.flags,
                    priority: self.priority,
                    owner: Some(owner),
                    macros: self.macros.clone(),
                    body: self.body.clone(),
                };
                sibling.flags.split = true;
                siblings.push(sibling);
            }
        }

        self.recipients = remaining;
        siblings
    }
}
