// src/hasher.rs
use sha2::{Digest, Sha256};

/// Length of a routing digest in hex characters (256 bits).
pub const DIGEST_HEX_LEN: usize = 64;

/// Computes the routing digest for an item id: the SHA-256 of the id bytes
/// as 64 lowercase hex characters.
///
/// Routing is a pure function of the id — no salt, no per-packer key. The
/// algorithm is frozen: changing it after data exists silently corrupts
/// routing for every stored item.
pub fn digest(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    format!("{:x}", hasher.finalize())
}
