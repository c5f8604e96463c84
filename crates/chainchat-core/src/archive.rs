//! The chat archive: a proof-of-work-sealed, tamper-evident message log.
//!
//! # Serialized layout
//!
//! The archive is kept in the exact byte form it travels in:
//!
//! ```text
//! +------+---------------------+---------+---------+-----+
//! | 0x04 | entry count (4, BE) | entry 1 | entry 2 | ... |
//! +------+---------------------+---------+---------+-----+
//! ```
//!
//! with each entry laid out as
//!
//! ```text
//! +-----------+---------------+------------+-------------+
//! | len (1)   | payload (len) | nonce (16) | digest (16) |
//! +-----------+---------------+------------+-------------+
//! ```
//!
//! The leading `0x04` doubles as the ArchiveResponse message type, so
//! [`Archive::as_bytes`] is the wire frame.
//!
//! # The sliding hash window
//!
//! Entry `k`'s digest is MD5 over a window ending at `k`'s nonce: the
//! stored bytes of the previous up-to-19 entries (all fields, digests
//! included) followed by `k`'s length byte, payload, and nonce. The digest
//! must start with two zero bytes, which is what the miner's nonce search
//! buys. Because each window overlaps the previous entries' digests,
//! rewriting any old message invalidates every digest after it; changing
//! history means re-mining the whole suffix.
//!
//! `offset` tracks where the next append's window begins so appends never
//! retraverse the archive. [`Archive::validate`] repairs `offset` while it
//! walks a received archive; its bookkeeping (including which entry it
//! advances past once the window is saturated) matches the appender's
//! historical behavior byte for byte, since every digest already on the
//! network was produced by that exact procedure.

use crate::codec::{self, MessageError};
use crate::miner;
use md5::{Digest, Md5};
use std::fmt::Write as _;
use thiserror::Error;

/// First byte of every serialized archive (and the ArchiveResponse type).
pub const FRAME_TYPE: u8 = 4;

/// Bytes before the first entry: type byte plus the 4-byte entry count.
pub const HEADER_LEN: usize = 5;

/// Per-entry bytes besides the payload: length byte, nonce, digest.
const ENTRY_OVERHEAD: usize = 33;

/// Errors rejecting a received archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive frame does not start with type byte 4 (got {0:#04x})")]
    BadFrameType(u8),

    #[error("archive data is truncated or malformed")]
    Truncated,

    #[error("archive has {trailing} trailing bytes after the last entry")]
    TrailingBytes { trailing: usize },

    #[error("non-zero bytes in MD5 hash of entry {index}")]
    NonZeroHashPrefix { index: u32 },

    #[error("hash mismatch at entry {index}")]
    HashMismatch { index: u32 },
}

/// The archive of chat messages, in canonical serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    /// The serialized byte form described in the module docs.
    bytes: Vec<u8>,
    /// Number of entries; mirrored in the 4-byte header field.
    size: u32,
    /// Byte index where the next append's hash window begins.
    offset: usize,
}

impl Default for Archive {
    fn default() -> Self {
        Self::new()
    }
}

impl Archive {
    /// A fresh, empty archive: header only, window at the first entry slot.
    pub fn new() -> Self {
        Self {
            bytes: vec![FRAME_TYPE, 0, 0, 0, 0],
            size: 0,
            offset: HEADER_LEN,
        }
    }

    /// Number of entries.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Length of the serialized form in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the archive holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The serialized archive; also the ArchiveResponse wire frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Validates, seals, and appends a chat message.
    ///
    /// The mining window is the stored tail from `offset` onward plus the
    /// new entry's length byte and payload; the miner extends it with the
    /// nonce. On success the archive grows by `payload_len + 33` bytes,
    /// the header count is rewritten, and once the window holds 20 entries
    /// it slides forward past one entry per append.
    ///
    /// An invalid message leaves the archive untouched.
    pub fn append(&mut self, msg: &[u8]) -> Result<(), MessageError> {
        let payload_len = codec::validate_payload(msg)?;
        let payload = &msg[..payload_len];

        let tail = &self.bytes[self.offset..];
        let mut window = Vec::with_capacity(tail.len() + 1 + payload_len);
        window.extend_from_slice(tail);
        window.push(payload_len as u8);
        window.extend_from_slice(payload);

        let pow = miner::mine(&window);

        self.bytes.push(payload_len as u8);
        self.bytes.extend_from_slice(payload);
        self.bytes.extend_from_slice(&pow.nonce);
        self.bytes.extend_from_slice(&pow.digest);

        self.size += 1;
        self.bytes[1..HEADER_LEN].copy_from_slice(&codec::encode_u32_be(self.size));

        if self.size as usize >= 20 {
            self.offset += self.bytes[self.offset] as usize + ENTRY_OVERHEAD;
        }
        Ok(())
    }

    /// Verifies the whole hash chain and repairs `offset` for future
    /// appends.
    ///
    /// Walks the entries front to back, maintaining the same sliding
    /// window the appender used: each entry contributes its length byte,
    /// payload, and nonce before its digest is checked, and its digest
    /// afterwards; past 20 entries the window head sheds one entry per
    /// step. Every stored digest must start with two zero bytes and equal
    /// MD5 of the current window.
    ///
    /// Bounds are checked before every access, so a malformed candidate
    /// fails with [`ArchiveError::Truncated`] rather than panicking.
    pub fn validate(&mut self) -> Result<(), ArchiveError> {
        let bytes = &self.bytes;
        let mut begin = HEADER_LEN;
        let mut end = HEADER_LEN;
        let mut hashed_len = 0usize;
        self.offset = HEADER_LEN;

        for index in 1..=self.size {
            let payload_len = *bytes.get(end).ok_or(ArchiveError::Truncated)? as usize;

            // Everything up to and including this entry's nonce joins the
            // hash input; `end` lands on the stored digest.
            end += payload_len + 17;
            hashed_len += payload_len + 17;
            if end + 16 > bytes.len() {
                return Err(ArchiveError::Truncated);
            }

            if bytes[end] != 0 || bytes[end + 1] != 0 {
                return Err(ArchiveError::NonZeroHashPrefix { index });
            }

            // Repair the append offset from the 20th entry onward. The
            // entry skipped is the window head before this iteration's
            // slide.
            if index > 19 {
                self.offset += bytes[begin] as usize + ENTRY_OVERHEAD;
            }

            // Past 20 entries, shed the oldest entry from the window.
            if index > 20 {
                let head = bytes[begin] as usize + ENTRY_OVERHEAD;
                hashed_len -= head;
                begin += head;
            }

            let computed: [u8; 16] = Md5::digest(&bytes[begin..begin + hashed_len]).into();
            if computed[..] != bytes[end..end + 16] {
                return Err(ArchiveError::HashMismatch { index });
            }

            // The verified digest becomes part of the next entry's window.
            end += 16;
            hashed_len += 16;
        }
        Ok(())
    }

    /// Parses the canonical serialized form, checking structure only.
    ///
    /// The entry walk confirms that the advertised count matches the byte
    /// length exactly; hashes are not checked, and `offset` stays at the
    /// first entry until [`Archive::validate`] repairs it.
    pub fn from_serialized(bytes: Vec<u8>) -> Result<Self, ArchiveError> {
        if bytes.len() < HEADER_LEN {
            return Err(ArchiveError::Truncated);
        }
        if bytes[0] != FRAME_TYPE {
            return Err(ArchiveError::BadFrameType(bytes[0]));
        }
        let size = codec::decode_u32_be([bytes[1], bytes[2], bytes[3], bytes[4]]);

        let mut pos = HEADER_LEN;
        for _ in 0..size {
            let payload_len = *bytes.get(pos).ok_or(ArchiveError::Truncated)? as usize;
            pos += payload_len + ENTRY_OVERHEAD;
            if pos > bytes.len() {
                return Err(ArchiveError::Truncated);
            }
        }
        if pos != bytes.len() {
            return Err(ArchiveError::TrailingBytes {
                trailing: bytes.len() - pos,
            });
        }

        Ok(Self {
            bytes,
            size,
            offset: HEADER_LEN,
        })
    }

    /// Iterates over the parsed entries.
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            bytes: &self.bytes,
            pos: HEADER_LEN,
            remaining: self.size,
        }
    }

    /// Renders the archive as a human-readable dump: one block per entry
    /// with the payload text and the hex nonce and digest. Shown to the
    /// operator after an append and written to peer logs on receipt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "size: {}, length: {}", self.size, self.bytes.len());
        for entry in self.entries() {
            let _ = writeln!(
                out,
                "msg[{}]: {}",
                entry.payload.len(),
                String::from_utf8_lossy(entry.payload)
            );
            let _ = writeln!(out, "code: {}", hex::encode(entry.nonce));
            let _ = writeln!(out, "md5: {}", hex::encode(entry.digest));
        }
        out
    }
}

/// One parsed archive entry, borrowing from the serialized form.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    pub payload: &'a [u8],
    pub nonce: &'a [u8],
    pub digest: &'a [u8],
}

/// Iterator over an archive's entries.
pub struct Entries<'a> {
    bytes: &'a [u8],
    pos: usize,
    remaining: u32,
}

impl<'a> Iterator for Entries<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Entry<'a>> {
        if self.remaining == 0 {
            return None;
        }
        let len = *self.bytes.get(self.pos)? as usize;
        let payload = self.bytes.get(self.pos + 1..self.pos + 1 + len)?;
        let nonce = self.bytes.get(self.pos + 1 + len..self.pos + 17 + len)?;
        let digest = self.bytes.get(self.pos + 17 + len..self.pos + 33 + len)?;
        self.pos += len + ENTRY_OVERHEAD;
        self.remaining -= 1;
        Some(Entry {
            payload,
            nonce,
            digest,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
