//! Passive TCP listener for incoming peers.
//!
//! Binds the wildcard IPv4 address on the fixed protocol port with
//! address reuse, then accepts connections forever. Each accepted stream
//! is handed to [`crate::peer::spawn_peer`], which registers the peer and
//! starts its receiver and requester tasks.

use crate::peer;
use crate::state::NodeState;
use chainchat_core::protocol::TCP_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, error, info};

/// Accept backlog for the listen socket.
const BACKLOG: u32 = 10;

/// TCP server that accepts connections from other chainchat daemons.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Binds `0.0.0.0:51511` with `SO_REUSEADDR` set.
    pub fn bind() -> std::io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, TCP_PORT)))?;
        let listener = socket.listen(BACKLOG)?;
        info!(port = TCP_PORT, "listening for incoming peers");
        Ok(Self { listener })
    }

    /// Accepts connections forever, spawning peer tasks for each.
    ///
    /// Accept errors are usually transient (out of file descriptors and
    /// the like), so they are logged and the loop continues after a short
    /// pause.
    pub async fn accept_loop(self, state: Arc<NodeState>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "accepted incoming connection");
                    peer::spawn_peer(Arc::clone(&state), stream);
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
