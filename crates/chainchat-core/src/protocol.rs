//! Peer-to-peer wire protocol for chainchat.
//!
//! This module defines the messages exchanged between chainchat daemons
//! over TCP connections on port 51511.
//!
//! # Wire Format
//!
//! Every message begins with a one-byte type; two of the four messages
//! carry a body:
//!
//! ```text
//! +------+----------------------------------------------+
//! | type | body                                         |
//! +------+----------------------------------------------+
//! |  1   | PeerRequest     (none)                       |
//! |  2   | PeerList        count (4, BE) | ip (4) | ... |
//! |  3   | ArchiveRequest  (none)                       |
//! |  4   | ArchiveResponse count (4, BE) | entry | ...  |
//! +------+----------------------------------------------+
//! ```
//!
//! Count fields are big-endian; the 4 bytes of each PeerList IP are the
//! raw octets in network order. An archive entry is
//! `len (1) | payload (len) | nonce (16) | digest (16)`, so a serialized
//! [`Archive`] with its leading `0x04` is itself a complete
//! ArchiveResponse frame.
//!
//! There is no length prefix around a whole frame: the receiver knows how
//! much to read from the type byte and the embedded counts.

use crate::archive::{Archive, ArchiveError};
use crate::codec;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// TCP port every daemon listens on. A protocol constant, not a setting.
pub const TCP_PORT: u16 = 51511;

/// Message type byte: ask a peer for its neighbor list.
pub const MSG_PEER_REQUEST: u8 = 1;
/// Message type byte: a list of connected peers' IPv4 addresses.
pub const MSG_PEER_LIST: u8 = 2;
/// Message type byte: ask a peer for its full archive.
pub const MSG_ARCHIVE_REQUEST: u8 = 3;
/// Message type byte: a full serialized archive.
pub const MSG_ARCHIVE_RESPONSE: u8 = 4;

/// Cap on upfront buffer reservation for peer-supplied counts. Bodies are
/// still read in full; only the pre-allocation is clamped so a hostile
/// count cannot balloon memory before any data arrives.
const PREALLOC_LIMIT: usize = 1024;

/// Errors that can occur while reading or writing protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("unknown message type byte {0:#04x}")]
    UnknownType(u8),

    #[error("invalid archive frame: {0}")]
    Archive(#[from] ArchiveError),
}

/// A message exchanged between two chainchat daemons over TCP.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Ask the peer to send its PeerList.
    PeerRequest,
    /// The peer's currently connected neighbors.
    PeerList(Vec<Ipv4Addr>),
    /// Ask the peer to send its full archive.
    ArchiveRequest,
    /// The peer's full archive, structurally parsed but not yet validated.
    ArchiveResponse(Archive),
}

/// Encodes a PeerList frame for the given addresses.
///
/// Shared with the peer registry, which keeps this frame pre-computed so
/// answering a PeerRequest is a single write.
pub fn encode_peer_list(ips: &[Ipv4Addr]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + ips.len() * 4);
    frame.push(MSG_PEER_LIST);
    frame.extend_from_slice(&codec::encode_u32_be(ips.len() as u32));
    for ip in ips {
        frame.extend_from_slice(&ip.octets());
    }
    frame
}

/// Encodes any `PeerMessage` into its wire byte form.
pub fn encode(msg: &PeerMessage) -> Vec<u8> {
    match msg {
        PeerMessage::PeerRequest => vec![MSG_PEER_REQUEST],
        PeerMessage::PeerList(ips) => encode_peer_list(ips),
        PeerMessage::ArchiveRequest => vec![MSG_ARCHIVE_REQUEST],
        PeerMessage::ArchiveResponse(archive) => archive.as_bytes().to_vec(),
    }
}

/// Writes a `PeerMessage` to an async writer (e.g., a TCP stream).
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &PeerMessage,
) -> Result<(), ProtocolError> {
    writer.write_all(&encode(msg)).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one `PeerMessage` from an async reader.
///
/// An unknown type byte consumes exactly that byte and returns
/// [`ProtocolError::UnknownType`]; the stream stays positioned on the next
/// byte, so the caller can log the garbage and keep the connection.
/// A clean EOF before the type byte returns
/// [`ProtocolError::ConnectionClosed`].
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<PeerMessage, ProtocolError> {
    let mut type_buf = [0u8; 1];
    match reader.read_exact(&mut type_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }

    match type_buf[0] {
        MSG_PEER_REQUEST => Ok(PeerMessage::PeerRequest),
        MSG_ARCHIVE_REQUEST => Ok(PeerMessage::ArchiveRequest),
        MSG_PEER_LIST => read_peer_list(reader).await,
        MSG_ARCHIVE_RESPONSE => read_archive(reader).await,
        other => Err(ProtocolError::UnknownType(other)),
    }
}

/// Reads a PeerList body: a count followed by that many raw IPv4 octets.
async fn read_peer_list<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<PeerMessage, ProtocolError> {
    let mut count_buf = [0u8; 4];
    reader.read_exact(&mut count_buf).await?;
    let count = codec::decode_u32_be(count_buf);

    let mut ips = Vec::with_capacity((count as usize).min(PREALLOC_LIMIT));
    for _ in 0..count {
        let mut octets = [0u8; 4];
        reader.read_exact(&mut octets).await?;
        ips.push(Ipv4Addr::from(octets));
    }
    Ok(PeerMessage::PeerList(ips))
}

/// Reads an ArchiveResponse body entry by entry, reassembling the
/// canonical serialized form as it goes.
async fn read_archive<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<PeerMessage, ProtocolError> {
    let mut count_buf = [0u8; 4];
    reader.read_exact(&mut count_buf).await?;
    let count = codec::decode_u32_be(count_buf);

    // Largest possible entry body after the length byte: 255 payload
    // bytes plus the 32-byte nonce+digest tail.
    let mut body = [0u8; 287];

    let mut bytes = Vec::with_capacity(5 + (count as usize).min(PREALLOC_LIMIT) * 288);
    bytes.push(MSG_ARCHIVE_RESPONSE);
    bytes.extend_from_slice(&count_buf);

    for _ in 0..count {
        let mut len_buf = [0u8; 1];
        reader.read_exact(&mut len_buf).await?;
        let body_len = len_buf[0] as usize + 32;
        reader.read_exact(&mut body[..body_len]).await?;
        bytes.push(len_buf[0]);
        bytes.extend_from_slice(&body[..body_len]);
    }

    let archive = Archive::from_serialized(bytes)?;
    Ok(PeerMessage::ArchiveResponse(archive))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Structurally valid single-entry archive; hashes are garbage, which
    /// the protocol layer does not care about.
    fn stub_archive() -> Archive {
        let mut bytes = vec![4, 0, 0, 0, 1];
        bytes.push(3);
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(&[0u8; 32]);
        Archive::from_serialized(bytes).unwrap()
    }

    #[test]
    fn peer_list_frame_layout() {
        let ips = vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 20)];
        let frame = encode_peer_list(&ips);
        assert_eq!(&frame[..5], &[2, 0, 0, 0, 2]);
        assert_eq!(&frame[5..9], &[10, 0, 0, 1]);
        assert_eq!(&frame[9..13], &[192, 168, 1, 20]);
    }

    #[test]
    fn bare_requests_are_one_byte() {
        assert_eq!(encode(&PeerMessage::PeerRequest), vec![1]);
        assert_eq!(encode(&PeerMessage::ArchiveRequest), vec![3]);
    }

    #[test]
    fn archive_response_is_the_serialized_archive() {
        let archive = stub_archive();
        assert_eq!(
            encode(&PeerMessage::ArchiveResponse(archive.clone())),
            archive.as_bytes()
        );
    }

    #[tokio::test]
    async fn async_write_read_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);

        let messages = vec![
            PeerMessage::PeerRequest,
            PeerMessage::ArchiveRequest,
            PeerMessage::PeerList(vec![Ipv4Addr::new(127, 0, 0, 1)]),
            PeerMessage::ArchiveResponse(stub_archive()),
        ];

        for msg in &messages {
            write_message(&mut writer, msg).await.unwrap();
        }
        for expected in &messages {
            let received = read_message(&mut reader).await.unwrap();
            assert_eq!(&received, expected);
        }
    }

    #[tokio::test]
    async fn empty_peer_list_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        write_message(&mut writer, &PeerMessage::PeerList(vec![]))
            .await
            .unwrap();
        let received = read_message(&mut reader).await.unwrap();
        assert_eq!(received, PeerMessage::PeerList(vec![]));
    }

    #[tokio::test]
    async fn unknown_type_preserves_stream_position() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&[9, 1]).await.unwrap();

        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(9)));

        // The bogus byte is consumed; the next message parses normally.
        let next = read_message(&mut reader).await.unwrap();
        assert_eq!(next, PeerMessage::PeerRequest);
    }

    #[tokio::test]
    async fn eof_at_type_byte_is_connection_closed() {
        let (writer, mut reader) = tokio::io::duplex(64);
        drop(writer);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn truncated_body_is_an_io_error() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        // PeerList claiming one address, then the stream ends.
        writer.write_all(&[2, 0, 0, 0, 1, 10, 0]).await.unwrap();
        drop(writer);

        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
