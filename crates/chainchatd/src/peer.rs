//! Per-peer tasks: the receive state machine and the periodic requester.
//!
//! Every connection, dialed or accepted, runs the same pair of tasks:
//!
//! - the **receiver** reads one message at a time under an idle deadline
//!   and dispatches it: answer PeerRequests with the cached registry
//!   frame, dial unknown addresses out of PeerLists, answer
//!   ArchiveRequests with the full archive, and run the convergence rule
//!   on ArchiveResponses;
//! - the **requester** asks the peer for its neighbor list every 5
//!   seconds and for its archive on every 12th tick.
//!
//! The receiver owns the connection's lifecycle: when a read errors or
//! the 60-second deadline passes, it deregisters the peer, aborts the
//! requester, and both socket halves drop. Errors never cross a task
//! boundary and never take the process down.
//!
//! # Convergence
//!
//! The active archive is replaced only by a strictly longer candidate
//! that passes full validation; ties keep the incumbent. The size check
//! and validation run under the archive read lock, the swap under the
//! write lock, with a window in between: a concurrent swap can at worst
//! supersede an equally large candidate, never corrupt state.

use crate::dial;
use crate::peer_log::PeerLog;
use crate::state::{NodeState, PeerHandle};
use chainchat_core::archive::Archive;
use chainchat_core::protocol::{self, PeerMessage, ProtocolError};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Idle deadline on the receive side; expiry counts as peer death.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of PeerRequest messages.
pub const PEER_REQUEST_INTERVAL: Duration = Duration::from_secs(5);

/// An ArchiveRequest piggybacks on every Nth PeerRequest tick.
pub const ARCHIVE_REQUEST_EVERY: u32 = 12;

/// Registers a connection and starts its receiver and requester tasks.
///
/// The peer's IPv4 address is its identity. If that address is already
/// registered (the other side dialed us while we dialed them), the
/// first registration wins and this connection is dropped.
pub fn spawn_peer(state: Arc<NodeState>, stream: TcpStream) {
    let peer_ip = match stream.peer_addr() {
        Ok(SocketAddr::V4(addr)) => *addr.ip(),
        Ok(addr) => {
            warn!(%addr, "dropping non-IPv4 peer connection");
            return;
        }
        Err(e) => {
            warn!(error = %e, "could not read peer address, dropping connection");
            return;
        }
    };
    let sockfd = stream.as_raw_fd();
    let (reader, writer) = stream.into_split();
    let handle: PeerHandle = Arc::new(Mutex::new(writer));

    tokio::spawn(async move {
        {
            let mut registry = state.registry.lock().await;
            if !registry.add(peer_ip, Arc::clone(&handle)) {
                warn!(peer = %peer_ip, "already connected, dropping duplicate connection");
                return;
            }
        }
        info!(peer = %peer_ip, "connected to peer");

        let requester = tokio::spawn(requester_loop(
            Arc::clone(&handle),
            PeerLog::open(&state.log_dir, sockfd),
        ));

        let log = PeerLog::open(&state.log_dir, sockfd);
        receiver_loop(&state, reader, &handle, peer_ip, log).await;

        requester.abort();
        state.registry.lock().await.remove(peer_ip);
        info!(peer = %peer_ip, "peer disconnected");
    });
}

/// Sends PeerRequests every 5 seconds and an ArchiveRequest on every 12th
/// tick, until a write fails. Registry cleanup is the receiver's job.
async fn requester_loop(handle: PeerHandle, mut log: PeerLog) {
    let mut ticks = 0u32;
    loop {
        if let Err(e) = send(&handle, &[protocol::MSG_PEER_REQUEST]).await {
            log.line(&format!("error sending peer request, broken pipe? ({e})"));
            return;
        }
        ticks += 1;
        if ticks == ARCHIVE_REQUEST_EVERY {
            if let Err(e) = send(&handle, &[protocol::MSG_ARCHIVE_REQUEST]).await {
                log.line(&format!("error sending archive request, broken pipe? ({e})"));
                return;
            }
            ticks = 0;
        }
        sleep(PEER_REQUEST_INTERVAL).await;
    }
}

/// Reads and dispatches messages until the peer dies.
async fn receiver_loop(
    state: &Arc<NodeState>,
    mut reader: OwnedReadHalf,
    handle: &PeerHandle,
    peer_ip: Ipv4Addr,
    mut log: PeerLog,
) {
    loop {
        let message = match timeout(READ_TIMEOUT, protocol::read_message(&mut reader)).await {
            Err(_) => {
                warn!(peer = %peer_ip, "timed out waiting for peer, closing connection");
                log.line("timed out waiting for peer, closing connection");
                return;
            }
            Ok(Err(ProtocolError::ConnectionClosed)) => {
                debug!(peer = %peer_ip, "peer closed the connection");
                log.line("peer closed the connection");
                return;
            }
            Ok(Err(ProtocolError::UnknownType(byte))) => {
                log.line(&format!("unknown message type {byte}, ignoring"));
                continue;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer_ip, error = %e, "read error, closing connection");
                log.line(&format!("read error, closing connection ({e})"));
                return;
            }
            Ok(Ok(message)) => message,
        };

        match message {
            PeerMessage::PeerRequest => handle_peer_request(state, handle, &mut log).await,
            PeerMessage::PeerList(ips) => handle_peer_list(state, ips, &mut log).await,
            PeerMessage::ArchiveRequest => handle_archive_request(state, handle, &mut log).await,
            PeerMessage::ArchiveResponse(candidate) => {
                handle_archive_response(state, candidate, &mut log).await;
            }
        }
    }
}

/// Answers a PeerRequest with the registry's cached PeerList frame.
async fn handle_peer_request(state: &Arc<NodeState>, handle: &PeerHandle, log: &mut PeerLog) {
    log.line("received PeerRequest, sending peer list");
    let frame = { state.registry.lock().await.frame().to_vec() };
    if let Err(e) = send(handle, &frame).await {
        log.line(&format!("failed to send peer list ({e})"));
    }
}

/// Dials every address in a received PeerList that is neither ourselves
/// nor already connected.
async fn handle_peer_list(state: &Arc<NodeState>, ips: Vec<Ipv4Addr>, log: &mut PeerLog) {
    log.line(&format!("processing peer list with {} entries", ips.len()));
    for ip in ips {
        log.line(&format!("  {ip}"));
        if ip == state.public_ip {
            continue;
        }

        // The registry stays locked across the membership check and the
        // dial so two handlers cannot race to connect the same address.
        let registry = state.registry.lock().await;
        if registry.contains(ip) {
            continue;
        }
        info!(peer = %ip, "attempting to connect to new peer");
        match dial::connect(&ip.to_string()).await {
            Ok(stream) => {
                drop(registry);
                spawn_peer(Arc::clone(state), stream);
            }
            Err(e) => {
                warn!(peer = %ip, error = %e, "failed to connect to peer");
                log.line(&format!("failed to connect to {ip} ({e})"));
            }
        }
    }
    log.line("done processing peer list");
}

/// Answers an ArchiveRequest with the full serialized archive, unless the
/// archive is still empty.
async fn handle_archive_request(state: &Arc<NodeState>, handle: &PeerHandle, log: &mut PeerLog) {
    log.line("received ArchiveRequest");
    let (bytes, size) = state.snapshot_archive().await;
    if size == 0 {
        log.line("current archive is empty, ignoring request");
        return;
    }
    log.line("sending archive");
    if let Err(e) = send(handle, &bytes).await {
        log.line(&format!("failed to send archive ({e})"));
    }
}

/// The convergence rule: adopt a received archive iff it is strictly
/// longer than the active one and its hash chain checks out.
async fn handle_archive_response(state: &Arc<NodeState>, mut candidate: Archive, log: &mut PeerLog) {
    log.line(&format!(
        "received ArchiveResponse with {} entries",
        candidate.size()
    ));
    log.line(&candidate.render());

    let adopt = {
        let active = state.archive.read().await;
        if candidate.size() <= active.size() {
            log.line(&format!(
                "candidate size {} does not beat active size {}, keeping current archive",
                candidate.size(),
                active.size()
            ));
            false
        } else {
            match candidate.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "received invalid archive");
                    log.line(&format!("invalid archive: {e}"));
                    false
                }
            }
        }
    };

    if adopt {
        let mut active = state.archive.write().await;
        *active = candidate;
        info!(size = active.size(), "active archive replaced");
        log.line("active archive replaced");
    }
}

/// Writes raw frame bytes to the peer under its write-half lock.
async fn send(handle: &PeerHandle, bytes: &[u8]) -> std::io::Result<()> {
    let mut writer = handle.lock().await;
    writer.write_all(bytes).await?;
    writer.flush().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn test_state() -> Arc<NodeState> {
        Arc::new(NodeState::new(
            Ipv4Addr::new(203, 0, 113, 9),
            std::env::temp_dir(),
        ))
    }

    fn archive_of(messages: &[&[u8]]) -> Archive {
        let mut archive = Archive::new();
        for msg in messages {
            archive.append(msg).unwrap();
        }
        archive
    }

    /// Structurally sound two-entry archive whose second digest was never
    /// mined (its first byte is non-zero).
    fn forged_archive() -> Archive {
        let mut bytes = archive_of(&[b"a"]).as_bytes().to_vec();
        bytes[4] = 2;
        bytes.push(1);
        bytes.push(b'x');
        bytes.extend_from_slice(&[0u8; 16]);
        let mut digest = [0u8; 16];
        digest[0] = 0xab;
        bytes.extend_from_slice(&digest);
        Archive::from_serialized(bytes).unwrap()
    }

    #[test]
    fn archive_requests_fire_once_a_minute() {
        assert_eq!(PEER_REQUEST_INTERVAL * ARCHIVE_REQUEST_EVERY, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn longer_valid_archive_is_adopted() {
        let state = test_state();
        let candidate = archive_of(&[b"a", b"b", b"c"]);

        handle_archive_response(&state, candidate, &mut PeerLog::disabled()).await;

        let archive = state.archive.read().await;
        assert_eq!(archive.size(), 3);
    }

    #[tokio::test]
    async fn equal_size_keeps_the_incumbent() {
        let state = test_state();
        let incumbent = archive_of(&[b"ours", b"kept"]);
        let incumbent_bytes = incumbent.as_bytes().to_vec();
        *state.archive.write().await = incumbent;

        let challenger = archive_of(&[b"theirs", b"lost"]);
        handle_archive_response(&state, challenger, &mut PeerLog::disabled()).await;

        let archive = state.archive.read().await;
        assert_eq!(archive.as_bytes(), &incumbent_bytes[..]);
    }

    #[tokio::test]
    async fn shorter_archive_is_ignored() {
        let state = test_state();
        *state.archive.write().await = archive_of(&[b"a", b"b", b"c"]);

        handle_archive_response(&state, archive_of(&[b"x"]), &mut PeerLog::disabled()).await;

        let archive = state.archive.read().await;
        assert_eq!(archive.size(), 3);
    }

    #[tokio::test]
    async fn forged_archive_is_rejected() {
        let state = test_state();

        handle_archive_response(&state, forged_archive(), &mut PeerLog::disabled()).await;

        let archive = state.archive.read().await;
        assert_eq!(archive.size(), 0);
    }

    #[tokio::test]
    async fn adopted_archive_can_be_extended_and_readopted() {
        // A adopts B's three entries, appends one, and B takes the result
        // back: both converge on the four-entry archive.
        let state_a = test_state();
        let state_b = test_state();

        let three = archive_of(&[b"a", b"b", b"c"]);
        handle_archive_response(&state_a, three.clone(), &mut PeerLog::disabled()).await;
        handle_archive_response(&state_b, three, &mut PeerLog::disabled()).await;

        {
            let mut archive = state_b.archive.write().await;
            archive.append(b"d").unwrap();
        }
        let (bytes, size) = state_b.snapshot_archive().await;
        assert_eq!(size, 4);

        let candidate = Archive::from_serialized(bytes).unwrap();
        handle_archive_response(&state_a, candidate, &mut PeerLog::disabled()).await;

        let a = state_a.archive.read().await;
        let b = state_b.archive.read().await;
        assert_eq!(a.size(), 4);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[tokio::test]
    async fn receiver_adopts_longer_archive_from_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let tmp = TempDir::new().unwrap();
        let state = Arc::new(NodeState::new(
            Ipv4Addr::new(203, 0, 113, 9),
            tmp.path().to_path_buf(),
        ));
        spawn_peer(Arc::clone(&state), server);

        let (mut reader, mut writer) = client.into_split();
        let archive = archive_of(&[b"a", b"b", b"c"]);
        writer.write_all(archive.as_bytes()).await.unwrap();

        for _ in 0..100 {
            if state.archive.read().await.size() == 3 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.archive.read().await.size(), 3);

        // The requester task greets us immediately with a PeerRequest.
        let first = protocol::read_message(&mut reader).await.unwrap();
        assert_eq!(first, PeerMessage::PeerRequest);
    }

    #[tokio::test]
    async fn duplicate_connection_for_an_ip_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let tmp = TempDir::new().unwrap();
        let state = Arc::new(NodeState::new(
            Ipv4Addr::new(203, 0, 113, 9),
            tmp.path().to_path_buf(),
        ));

        let _client_a = TcpStream::connect(addr).await.unwrap();
        let (server_a, _) = listener.accept().await.unwrap();
        spawn_peer(Arc::clone(&state), server_a);

        let _client_b = TcpStream::connect(addr).await.unwrap();
        let (server_b, _) = listener.accept().await.unwrap();
        spawn_peer(Arc::clone(&state), server_b);

        for _ in 0..100 {
            if !state.registry.lock().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(50)).await;

        // Both connections came from 127.0.0.1; only one registration
        // survives.
        assert_eq!(state.registry.lock().await.len(), 1);
    }
}
