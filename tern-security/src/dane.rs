//! DANE (RFC 7672) certificate matching against TLSA records.
//!
//! The TLSA lookup itself belongs to the resolver; this module only decides
//! which records are usable and whether a presented chain matches them.

use core::fmt::{self, Display, Formatter};

use sha2::{Digest, Sha256, Sha512};

use crate::error::DaneError;

/// Certificate usage field of a TLSA record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Usage {
    PkixTa,
    PkixEe,
    DaneTa,
    DaneEe,
}

impl Usage {
    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::PkixTa),
            1 => Some(Self::PkixEe),
            2 => Some(Self::DaneTa),
            3 => Some(Self::DaneEe),
            _ => None,
        }
    }

    const fn needs_pkix(self) -> bool {
        matches!(self, Self::PkixTa | Self::PkixEe)
    }

    const fn is_end_entity(self) -> bool {
        matches!(self, Self::PkixEe | Self::DaneEe)
    }
}

/// A single TLSA resource record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsaRecord {
    pub usage: u8,
    pub selector: u8,
    pub matching: u8,
    pub data: Vec<u8>,
}

impl TlsaRecord {
    pub const fn new(usage: u8, selector: u8, matching: u8, data: Vec<u8>) -> Self {
        Self {
            usage,
            selector,
            matching,
            data,
        }
    }

    /// Records with unknown parameters, or digests of the wrong length,
    /// are ignored as if they were absent.
    pub fn is_usable(&self) -> bool {
        let digest_ok = match self.matching {
            0 => !self.data.is_empty(),
            1 => self.data.len() == 32,
            2 => self.data.len() == 64,
            _ => false,
        };

        Usage::from_u8(self.usage).is_some() && self.selector <= 1 && digest_ok
    }

    /// Whether `cert` (DER) matches this record's selector and digest
    pub fn matches(&self, cert: &[u8]) -> bool {
        let selected = match self.selector {
            0 => cert,
            1 => match subject_public_key_info(cert) {
                Some(spki) => spki,
                None => return false,
            },
            _ => return false,
        };

        match self.matching {
            0 => selected == self.data.as_slice(),
            1 => Sha256::digest(selected).as_slice() == self.data.as_slice(),
            2 => Sha512::digest(selected).as_slice() == self.data.as_slice(),
            _ => false,
        }
    }
}

/// DANE status of one destination host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DaneState {
    /// No lookup has been made for this host yet
    #[default]
    NotRequested,
    /// DANE does not apply (disabled, or the MX answer was not authenticated)
    NotApplicable,
    /// The authenticated lookup returned no TLSA records
    NoRecords,
    /// Records were found but none is usable
    Unusable,
    /// The lookup failed and may succeed later
    TempFail(String),
    /// At least one usable record
    Secure(Vec<TlsaRecord>),
}

impl DaneState {
    /// Builds the state from a completed authenticated lookup
    pub fn from_records(records: Vec<TlsaRecord>) -> Self {
        if records.is_empty() {
            return Self::NoRecords;
        }

        let usable = records
            .into_iter()
            .filter(TlsaRecord::is_usable)
            .collect::<Vec<_>>();

        if usable.is_empty() {
            Self::Unusable
        } else {
            Self::Secure(usable)
        }
    }

    /// Whether the destination must only be reached over a DANE-verified
    /// channel, which also rules out any clear text fallback.
    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Secure(_))
    }

    pub fn records(&self) -> Option<&[TlsaRecord]> {
        match self {
            Self::Secure(records) => Some(records),
            _ => None,
        }
    }

    /// Converts a lookup that must be retried into an error for the caller
    pub fn check(&self) -> Result<(), DaneError> {
        match self {
            Self::TempFail(reason) => Err(DaneError::Temporary(reason.clone())),
            _ => Ok(()),
        }
    }
}

/// The DANE result of one handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DaneOutcome {
    /// No TLSA records were supplied for the handshake
    #[default]
    NotApplicable,
    Matched(Usage),
    Mismatch,
}

impl Display for DaneOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotApplicable => "NONE",
            Self::Matched(_) => "DANE",
            Self::Mismatch => "DANE_FAIL",
        })
    }
}

/// Matches a presented chain against a destination's usable records.
///
/// `pkix_ok` is whether ordinary path validation succeeded; it is only
/// consulted for the PKIX usages. DANE-EE ignores names and expiry.
pub fn verify_chain(
    records: &[TlsaRecord],
    end_entity: &[u8],
    intermediates: &[&[u8]],
    pkix_ok: bool,
) -> DaneOutcome {
    for record in records.iter().filter(|r| r.is_usable()) {
        let Some(usage) = Usage::from_u8(record.usage) else {
            continue;
        };

        if usage.needs_pkix() && !pkix_ok {
            continue;
        }

        let matched = if usage.is_end_entity() {
            record.matches(end_entity)
        } else {
            intermediates.iter().any(|cert| record.matches(cert))
        };

        if matched {
            return DaneOutcome::Matched(usage);
        }
    }

    DaneOutcome::Mismatch
}

/// Reads one DER TLV at the start of `input`.
///
/// Returns the tag, the whole element and the remainder.
fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;

    let (len, rest) = if first & 0x80 == 0 {
        (usize::from(first), rest)
    } else {
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 || rest.len() < count {
            return None;
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        (len, &rest[count..])
    };

    if rest.len() < len {
        return None;
    }

    let header = input.len() - rest.len();
    let element = &input[..header + len];
    let content = &rest[..len];
    Some((tag, element, content, &rest[len..]))
}

/// Extracts the `subjectPublicKeyInfo` element of an X.509 certificate.
pub fn subject_public_key_info(cert: &[u8]) -> Option<&[u8]> {
    const SEQUENCE: u8 = 0x30;
    const EXPLICIT_VERSION: u8 = 0xa0;

    let (tag, _, certificate, _) = read_tlv(cert)?;
    if tag != SEQUENCE {
        return None;
    }

    let (tag, _, mut tbs, _) = read_tlv(certificate)?;
    if tag != SEQUENCE {
        return None;
    }

    if tbs.first() == Some(&EXPLICIT_VERSION) {
        tbs = read_tlv(tbs)?.3;
    }

    // serialNumber, signature, issuer, validity, subject
    for _ in 0..5 {
        tbs = read_tlv(tbs)?.3;
    }

    let (tag, spki, _, _) = read_tlv(tbs)?;
    (tag == SEQUENCE).then_some(spki)
}
