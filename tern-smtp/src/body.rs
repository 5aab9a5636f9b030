//! Collection of the message body after `354`.

use std::sync::Arc;

/// Whether the collector wants more lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    More,
    Complete,
}

/// A received message
#[derive(Debug, Clone)]
pub struct Body {
    pub data: Arc<[u8]>,
    /// Number of `Received` headers, the hop count
    pub hops: usize,
    pub eight_bit: bool,
}

/// Accumulates `DATA` lines until the lone `.`.
///
/// Lines are dot-unstuffed and stored with CRLF endings. Once the size limit
/// is passed the remaining lines are still read, so the client can be
/// answered after its terminator, but no longer stored.
#[derive(Debug)]
pub struct BodyCollector {
    data: Vec<u8>,
    limit: usize,
    size: usize,
    eight_bit: bool,
}

impl BodyCollector {
    /// `limit` of `0` means unlimited
    pub const fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            size: 0,
            eight_bit: false,
        }
    }

    fn exceeded(&self) -> bool {
        self.limit > 0 && self.size > self.limit
    }

    /// Adds one line, including its terminator if there is one
    pub fn push_line(&mut self, line: &[u8]) -> Progress {
        let content = line
            .strip_suffix(b"\n")
            .map_or(line, |l| l.strip_suffix(b"\r").unwrap_or(l));

        if content == b"." {
            return Progress::Complete;
        }

        let content = content.strip_prefix(b".").unwrap_or(content);
        self.size += content.len() + 2;
        self.eight_bit |= !content.is_ascii();

        if !self.exceeded() {
            self.data.extend_from_slice(content);
            self.data.extend_from_slice(b"\r\n");
        }

        Progress::More
    }

    /// Bytes seen so far, including those past the limit
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Finishes collection.
    ///
    /// # Errors
    /// The full size of the message when it exceeded the limit
    pub fn finish(self) -> Result<Body, usize> {
        if self.exceeded() {
            return Err(self.size);
        }

        let hops = mailparse::parse_headers(&self.data).map_or(0, |(headers, _)| {
            headers
                .iter()
                .filter(|h| h.get_key_ref().eq_ignore_ascii_case("Received"))
                .count()
        });

        Ok(Body {
            data: Arc::from(self.data),
            hops,
            eight_bit: self.eight_bit,
        })
    }
}
