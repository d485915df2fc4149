use anyhow::Result;
use std::sync::Arc;

use shardpack::{Backend, CancelToken, MemoryBackend, Options, Packer, StorageView};

/// Prefix the bucket view is mounted under in these tests; the packer adds
/// its own "v2/" below it.
pub const BUCKET_PREFIX: &str = "packer/buckets/";

pub fn ctx() -> CancelToken {
    CancelToken::new()
}

/// Opens a packer over the shared in-memory backend, the way the identity
/// store mounts one: config at the storage root, buckets in their own view.
pub fn open_packer(backend: &Arc<MemoryBackend>, options: Options) -> Result<Packer> {
    let storage: Arc<dyn Backend> = backend.clone();
    let config_view = StorageView::new(storage.clone(), "");
    let bucket_view = StorageView::new(storage, BUCKET_PREFIX);
    Ok(Packer::open(&ctx(), &config_view, &bucket_view, options)?)
}

/// Bucket keys currently stored in the backend, relative to the packer's
/// bucket view (so directly comparable with `Packer::bucket_keys`).
pub fn stored_bucket_keys(backend: &MemoryBackend) -> Result<Vec<String>> {
    let prefix = format!("{BUCKET_PREFIX}v2/");
    Ok(backend
        .list(&prefix)?
        .into_iter()
        .map(|key| key[prefix.len()..].to_string())
        .collect())
}

/// Raw stored payload of one bucket, if present.
pub fn stored_bucket_bytes(backend: &MemoryBackend, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(backend.get(&format!("{BUCKET_PREFIX}v2/{key}"))?)
}

/// Deterministic, incompressible payload bytes: chained SHA-256 output, so
/// compression cannot shrink buckets under the backend's size cap.
#[allow(dead_code)]
pub fn opaque_payload(seed: &str, len: usize) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut out = Vec::with_capacity(len + 32);
    let mut counter: u64 = 0;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(counter.to_le_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

/// Finds `count` item ids whose routing digests all start with the same
/// base-level prefix, so they land in one bucket.
#[allow(dead_code)]
pub fn ids_sharing_base_prefix(base_chars: usize, count: usize) -> (String, Vec<String>) {
    let target = shardpack::hasher::digest("seed-id")[..base_chars].to_string();
    let mut ids = Vec::with_capacity(count);
    let mut i: u64 = 0;
    while ids.len() < count {
        let id = format!("packed-{i}");
        if shardpack::hasher::digest(&id).starts_with(&target) {
            ids.push(id);
        }
        i += 1;
    }
    (target, ids)
}

/// Asserts that no key in the set is a proper prefix of another, i.e. the
/// buckets cover disjoint digest ranges.
#[allow(dead_code)]
pub fn assert_prefix_free(keys: &[String]) {
    for a in keys {
        for b in keys {
            assert!(
                a == b || !b.starts_with(a.as_str()),
                "bucket key {a} is a prefix of {b}"
            );
        }
    }
}
