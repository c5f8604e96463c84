//! Proof-of-work miner for archive entries.
//!
//! Sealing an entry means finding a 16-byte nonce such that the MD5 digest
//! of `window || nonce` starts with two zero bytes. The nonce is a 128-bit
//! little-endian counter: the search starts at zero and increments the
//! lowest byte first, so the byte layout written into the archive is the
//! little-endian representation of the number of attempts.
//!
//! At 16 bits of required zero prefix the search takes ~65,536 MD5
//! evaluations on average. It runs synchronously on the calling thread and
//! is deterministic for a given window: every node mining the same bytes
//! finds the same nonce.

use md5::{Digest, Md5};

/// Size of the proof-of-work nonce in bytes.
pub const NONCE_LEN: usize = 16;

/// Size of an MD5 digest in bytes.
pub const DIGEST_LEN: usize = 16;

/// A mined seal: the winning nonce and the digest it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofOfWork {
    pub nonce: [u8; NONCE_LEN],
    pub digest: [u8; DIGEST_LEN],
}

/// Whether a digest satisfies the fixed 16-bit difficulty.
pub fn meets_difficulty(digest: &[u8; DIGEST_LEN]) -> bool {
    digest[0] == 0 && digest[1] == 0
}

/// Searches for a nonce that makes `MD5(window || nonce)` meet the
/// difficulty, starting from nonce zero.
///
/// The search is unbounded in principle; with a 16-bit target it
/// terminates quickly in practice.
pub fn mine(window: &[u8]) -> ProofOfWork {
    let mut buf = Vec::with_capacity(window.len() + NONCE_LEN);
    buf.extend_from_slice(window);
    buf.extend_from_slice(&[0u8; NONCE_LEN]);
    let nonce_at = window.len();

    loop {
        let digest: [u8; DIGEST_LEN] = Md5::digest(&buf).into();
        if meets_difficulty(&digest) {
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&buf[nonce_at..]);
            return ProofOfWork { nonce, digest };
        }
        increment(&mut buf[nonce_at..]);
    }
}

/// Increments a little-endian counter in place, carrying upward.
fn increment(counter: &mut [u8]) {
    for byte in counter.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
