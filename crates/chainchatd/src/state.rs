//! Shared node state.
//!
//! `NodeState` owns the two pieces of state every task touches: the peer
//! registry and the active archive. `main` creates one and hands an `Arc`
//! to the listener, the per-peer tasks, and the operator prompt; there
//! are no globals.
//!
//! # Lock discipline
//!
//! - The registry sits behind an async `Mutex`. Mutations and the
//!   PeerList handler's check-then-dial sequence hold it; broadcast only
//!   takes it long enough to snapshot the peer handles.
//! - The archive sits behind an async `RwLock`. Readers serve
//!   ArchiveRequests and snapshots; writers are the operator's append and
//!   the convergence swap.
//! - Each peer's socket write half sits behind its own `Mutex`, shared by
//!   the requester task, the receiver's responses, and broadcast.
//!
//! Broadcast never writes to a socket while holding the registry or
//! archive lock: both are snapshotted first and released.

use chainchat_core::archive::Archive;
use chainchat_core::codec::MessageError;
use chainchat_core::peerlist::PeerRegistry;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Shared write half of a peer's socket.
pub type PeerHandle = Arc<Mutex<OwnedWriteHalf>>;

/// All state shared between the daemon's tasks.
pub struct NodeState {
    /// Connected peers, keyed by IPv4 address.
    pub registry: Mutex<PeerRegistry<PeerHandle>>,
    /// The archive this node currently believes in.
    pub archive: RwLock<Archive>,
    /// Our public address; peer lists containing it are not self-dialed.
    pub public_ip: Ipv4Addr,
    /// Directory receiving the per-peer log files.
    pub log_dir: PathBuf,
}

impl NodeState {
    /// Fresh state: no peers, empty archive.
    pub fn new(public_ip: Ipv4Addr, log_dir: PathBuf) -> Self {
        Self {
            registry: Mutex::new(PeerRegistry::new()),
            archive: RwLock::new(Archive::new()),
            public_ip,
            log_dir,
        }
    }

    /// Appends an operator-submitted message and broadcasts the grown
    /// archive to every peer. Returns the rendered archive for display.
    ///
    /// Mining happens under the archive write lock, as appends always
    /// have: readers see either the old archive or the fully sealed new
    /// one, never a half-built entry.
    pub async fn submit_message(&self, msg: &[u8]) -> Result<String, MessageError> {
        let (bytes, rendered) = {
            let mut archive = self.archive.write().await;
            archive.append(msg)?;
            (archive.as_bytes().to_vec(), archive.render())
        };
        self.broadcast(&bytes).await;
        Ok(rendered)
    }

    /// Writes the given serialized archive to every connected peer.
    ///
    /// Best-effort: a failed write is logged and the peer is left for its
    /// receiver task to reap on the next read error.
    pub async fn broadcast(&self, bytes: &[u8]) {
        let peers = { self.registry.lock().await.handles() };
        debug!(peers = peers.len(), "broadcasting archive");
        for (ip, handle) in peers {
            let mut writer = handle.lock().await;
            if let Err(e) = writer.write_all(bytes).await {
                warn!(peer = %ip, error = %e, "failed to send archive to peer");
            }
        }
    }

    /// A coherent copy of the serialized archive and its entry count.
    pub async fn snapshot_archive(&self) -> (Vec<u8>, u32) {
        let archive = self.archive.read().await;
        (archive.as_bytes().to_vec(), archive.size())
    }

    /// The currently connected peer addresses.
    pub async fn list_peers(&self) -> Vec<Ipv4Addr> {
        self.registry.lock().await.ips()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chainchat_core::protocol::{self, PeerMessage};
    use tokio::net::{TcpListener, TcpStream};

    fn test_state() -> NodeState {
        NodeState::new(Ipv4Addr::new(203, 0, 113, 9), std::env::temp_dir())
    }

    #[tokio::test]
    async fn submit_message_grows_archive() {
        let state = test_state();
        let rendered = state.submit_message(b"hello").await.unwrap();
        assert!(rendered.contains("msg[5]: hello"));

        let (bytes, size) = state.snapshot_archive().await;
        assert_eq!(size, 1);
        assert_eq!(bytes.len(), 43);
    }

    #[tokio::test]
    async fn invalid_message_is_rejected() {
        let state = test_state();
        assert!(state.submit_message(b"bad\tbyte").await.is_err());
        let (_, size) = state.snapshot_archive().await;
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn list_peers_starts_empty() {
        let state = test_state();
        assert!(state.list_peers().await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let state = test_state();
        let (_read_half, write_half) = client.into_split();
        let handle: PeerHandle = Arc::new(Mutex::new(write_half));
        state
            .registry
            .lock()
            .await
            .add(Ipv4Addr::new(127, 0, 0, 1), handle);

        state.submit_message(b"hi").await.unwrap();

        // The peer receives the grown archive as a full wire frame.
        let msg = protocol::read_message(&mut server).await.unwrap();
        match msg {
            PeerMessage::ArchiveResponse(archive) => assert_eq!(archive.size(), 1),
            other => panic!("expected ArchiveResponse, got {other:?}"),
        }
    }
}
