//! Outbound connections to peers.
//!
//! Every peer listens on the fixed protocol port, so dialing only needs a
//! host or address. Resolution can return several candidates; each is
//! tried in turn under a hard half-second deadline, the async equivalent
//! of the classic non-blocking `connect` + `select` dance. Unresponsive
//! peers therefore cost a dialing task at most 500 ms per address.

use chainchat_core::protocol::TCP_PORT;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Hard deadline for a single connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors that can occur when dialing a peer.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },

    #[error("{host} has no IPv4 address")]
    NoAddress { host: String },

    #[error("connection to {addr} timed out after 500 ms")]
    Timeout { addr: SocketAddr },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Dials a peer on the protocol port, trying every resolved IPv4 address
/// until one connects within the deadline.
pub async fn connect(host: &str) -> Result<TcpStream, DialError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, TCP_PORT))
        .await
        .map_err(|source| DialError::Resolve {
            host: host.to_string(),
            source,
        })?
        .filter(|addr| addr.is_ipv4())
        .collect();

    if addrs.is_empty() {
        return Err(DialError::NoAddress {
            host: host.to_string(),
        });
    }

    let mut last_error = None;
    for addr in addrs {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "connected to peer");
                return Ok(stream);
            }
            Ok(Err(source)) => last_error = Some(DialError::Connect { addr, source }),
            Err(_) => last_error = Some(DialError::Timeout { addr }),
        }
    }

    Err(last_error.unwrap_or(DialError::NoAddress {
        host: host.to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unresolvable_host_is_a_resolve_error() {
        let err = connect("definitely-not-a-real-host.invalid").await.unwrap_err();
        assert!(matches!(err, DialError::Resolve { .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        // 127.0.0.1 resolves instantly; nothing listens on the protocol
        // port in the test environment, so the dial is refused (or, on a
        // filtered network, times out).
        let err = connect("127.0.0.1").await.unwrap_err();
        assert!(matches!(
            err,
            DialError::Connect { .. } | DialError::Timeout { .. }
        ));
    }
}
