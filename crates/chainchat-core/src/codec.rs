//! Chat payload validation and the integer codec shared by all wire frames.
//!
//! A chat message travels as raw bytes, not UTF-8: the protocol only admits
//! the printable ASCII range. Validation happens once, at the edge, so the
//! archive engine can treat payloads as opaque bytes afterwards.
//!
//! # Byte-order conventions
//!
//! The protocol mixes two conventions and they must not be normalized:
//!
//! - every 4-byte *count* field (archive entry count, peer-list length) is
//!   big-endian, handled by [`encode_u32_be`]/[`decode_u32_be`];
//! - the 4 bytes of each IP inside a PeerList frame are the raw octets in
//!   network order, copied verbatim with no host-order round trip;
//! - the 16-byte proof-of-work nonce is an opaque little-endian counter
//!   (see [`crate::miner`]).

use thiserror::Error;

/// Lowest byte value a payload may contain (ASCII space).
pub const PRINTABLE_MIN: u8 = 32;

/// Highest byte value a payload may contain (ASCII `~`).
pub const PRINTABLE_MAX: u8 = 126;

/// Maximum payload length; the entry length field is a single byte.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Errors rejecting an operator-submitted chat message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is empty")]
    Empty,

    #[error("illegal byte {byte:#04x} at position {position} (printable range is 32..=126)")]
    IllegalByte { position: usize, byte: u8 },

    #[error("message is {len} bytes long (maximum 255)")]
    TooLong { len: usize },
}

/// Validates a chat message and returns its payload length.
///
/// Scanning stops at the first `\n`, which marks end-of-input and is not
/// part of the payload. Every byte before it must lie in the printable
/// range 32..=126. Empty payloads and payloads longer than one length byte
/// can describe are rejected.
pub fn validate_payload(input: &[u8]) -> Result<usize, MessageError> {
    let mut len = 0;
    for (position, &byte) in input.iter().enumerate() {
        if byte == b'\n' {
            break;
        }
        if !(PRINTABLE_MIN..=PRINTABLE_MAX).contains(&byte) {
            return Err(MessageError::IllegalByte { position, byte });
        }
        len += 1;
    }
    if len == 0 {
        return Err(MessageError::Empty);
    }
    if len > MAX_PAYLOAD_LEN {
        return Err(MessageError::TooLong { len });
    }
    Ok(len)
}

/// Encodes a count field as 4 big-endian bytes.
pub fn encode_u32_be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decodes a 4-byte big-endian count field.
pub fn decode_u32_be(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_accepted() {
        assert_eq!(validate_payload(b"hello").unwrap(), 5);
    }

    #[test]
    fn newline_terminates_but_is_not_payload() {
        assert_eq!(validate_payload(b"hi\n").unwrap(), 2);
    }

    #[test]
    fn bytes_after_newline_are_ignored() {
        // Anything after the terminator is end-of-input garbage, not payload.
        assert_eq!(validate_payload(b"abc\n\tdef").unwrap(), 3);
    }

    #[test]
    fn empty_rejected() {
        assert!(matches!(validate_payload(b""), Err(MessageError::Empty)));
        assert!(matches!(validate_payload(b"\n"), Err(MessageError::Empty)));
    }

    #[test]
    fn tab_rejected() {
        let err = validate_payload(b"a\tb").unwrap_err();
        assert!(matches!(
            err,
            MessageError::IllegalByte { position: 1, byte: 9 }
        ));
    }

    #[test]
    fn printable_boundaries() {
        assert!(validate_payload(&[32]).is_ok());
        assert!(validate_payload(&[126]).is_ok());
        assert!(validate_payload(&[31]).is_err());
        assert!(validate_payload(&[127]).is_err());
    }

    #[test]
    fn max_length_boundary() {
        let max = vec![b'a'; MAX_PAYLOAD_LEN];
        assert_eq!(validate_payload(&max).unwrap(), MAX_PAYLOAD_LEN);

        let over = vec![b'a'; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            validate_payload(&over),
            Err(MessageError::TooLong { len: 256 })
        ));
    }

    #[test]
    fn u32_codec_roundtrip() {
        for value in [0u32, 1, 255, 256, 0xdead_beef, u32::MAX] {
            assert_eq!(decode_u32_be(encode_u32_be(value)), value);
        }
    }

    #[test]
    fn u32_codec_is_big_endian() {
        assert_eq!(encode_u32_be(1), [0, 0, 0, 1]);
        assert_eq!(encode_u32_be(0x0102_0304), [1, 2, 3, 4]);
    }
}
