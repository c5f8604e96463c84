//! Per-peer log files.
//!
//! Every peer connection gets an append-only text log named after its
//! socket fd (`<sockfd>.log`) in the configured log directory. The
//! requester and receiver tasks each hold their own handle on the file,
//! and protocol events (requests answered, peer lists processed,
//! archives received or rejected) are written there, one line each.
//!
//! Logging is strictly best-effort: a file that cannot be opened or
//! written disables itself and never fails a peer task.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Append-only log for one peer connection.
pub struct PeerLog {
    file: Option<File>,
}

impl PeerLog {
    /// Opens `<sockfd>.log` in the given directory for appending. On
    /// failure the log is disabled rather than the connection refused.
    pub fn open(dir: &Path, sockfd: i32) -> Self {
        let path = dir.join(format!("{sockfd}.log"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Self { file: Some(file) },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not open peer log");
                Self { file: None }
            }
        }
    }

    /// A log that discards everything; used in tests.
    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Appends one line. The first write error disables the log.
    pub fn line(&mut self, line: &str) {
        if let Some(file) = &mut self.file {
            if writeln!(file, "{line}").is_err() {
                self.file = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
