//! Registry of currently connected peers.
//!
//! Peers are keyed by IPv4 address (the protocol assumes one connection
//! per machine) and stored in insertion order alongside an opaque
//! connection handle. The registry keeps its serialized PeerList frame
//! pre-computed, so answering a PeerRequest never walks the list; every
//! mutation rebuilds the frame in full, which stays cheap at the peer
//! counts gossip produces.
//!
//! The handle type is generic: the daemon stores the shared write half of
//! the peer's socket, tests store `()`.

use crate::protocol;
use std::net::Ipv4Addr;

/// Insertion-ordered set of connected peers with a cached PeerList frame.
pub struct PeerRegistry<H> {
    peers: Vec<Peer<H>>,
    frame: Vec<u8>,
}

struct Peer<H> {
    ip: Ipv4Addr,
    handle: H,
}

impl<H> PeerRegistry<H> {
    /// An empty registry; the cached frame already encodes a zero count.
    pub fn new() -> Self {
        Self {
            peers: Vec::new(),
            frame: protocol::encode_peer_list(&[]),
        }
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are connected.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether the given IP is already registered.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.peers.iter().any(|peer| peer.ip == ip)
    }

    /// Registers a peer. Returns `false` and leaves the registry unchanged
    /// if the IP is already present; the first connection for an IP wins
    /// regardless of which side dialed.
    pub fn add(&mut self, ip: Ipv4Addr, handle: H) -> bool {
        if self.contains(ip) {
            return false;
        }
        self.peers.push(Peer { ip, handle });
        self.rebuild_frame();
        true
    }

    /// Deregisters a peer, returning its handle if it was present.
    pub fn remove(&mut self, ip: Ipv4Addr) -> Option<H> {
        let index = self.peers.iter().position(|peer| peer.ip == ip)?;
        let peer = self.peers.remove(index);
        self.rebuild_frame();
        Some(peer.handle)
    }

    /// The pre-computed PeerList frame, ready to write to a socket.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// The registered addresses in insertion order.
    pub fn ips(&self) -> Vec<Ipv4Addr> {
        self.peers.iter().map(|peer| peer.ip).collect()
    }

    fn rebuild_frame(&mut self) {
        self.frame = protocol::encode_peer_list(&self.ips());
    }
}

impl<H: Clone> PeerRegistry<H> {
    /// A snapshot of every peer's handle, for broadcasting outside the
    /// registry lock.
    pub fn handles(&self) -> Vec<(Ipv4Addr, H)> {
        self.peers
            .iter()
            .map(|peer| (peer.ip, peer.handle.clone()))
            .collect()
    }
}

impl<H> Default for PeerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
