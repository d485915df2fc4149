// src/locks.rs
use std::hash::Hasher;
use std::sync::RwLock;

use fnv::FnvHasher;

/// Number of locks in the pool. Must be a power of two so the hash can be
/// masked instead of divided.
pub const LOCK_COUNT: usize = 256;

/// A fixed pool of readers-writer locks indexed by a fast hash of a string
/// key. The same key always maps to the same lock; two different keys may
/// collide, which costs extra serialization but never correctness.
///
/// Lock ordering across the packer is always pool lock first, then the
/// bucket's own lock, never the reverse.
pub struct LockPool {
    locks: Vec<RwLock<()>>,
}

impl LockPool {
    pub fn new() -> Self {
        Self {
            locks: (0..LOCK_COUNT).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Returns the lock guarding `key`.
    pub fn lock_for(&self, key: &str) -> &RwLock<()> {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        let slot = (hasher.finish() as usize) & (LOCK_COUNT - 1);
        &self.locks[slot]
    }
}

impl Default for LockPool {
    fn default() -> Self {
        Self::new()
    }
}
