// src/packer.rs
//! The packer façade: routes items to buckets, loads buckets on demand,
//! shards them when the backend rejects an entry as too large, and keeps the
//! in-memory prefix index consistent while doing so.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::backend::StorageView;
use crate::bucket::{cache_key, Bucket, Item, LockedBucket};
use crate::cancel::CancelToken;
use crate::codec;
use crate::config::PackerConfig;
use crate::constants::{BUCKET_VIEW_PREFIX, DEFAULT_BASE_BUCKET_BITS, DEFAULT_SHARD_BUCKET_BITS};
use crate::error::{is_entry_too_large, Error, Result};
use crate::hasher;
use crate::locks::LockPool;
use crate::radix::RadixTree;

/// Overrides accepted by [`Packer::open`]. Unset fields fall back to the
/// stored config, or to the defaults on a fresh store.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub base_bucket_bits: Option<u32>,
    pub shard_bucket_bits: Option<u32>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_bucket_bits(mut self, bits: u32) -> Self {
        self.base_bucket_bits = Some(bits);
        self
    }

    pub fn shard_bucket_bits(mut self, bits: u32) -> Self {
        self.shard_bucket_bits = Some(bits);
        self
    }
}

/// Outcome of a read-through bucket load: either a leaf record (possibly
/// deeper than the key asked for, after descending through shard parents),
/// or the key where the leaf would live if nothing is stored yet.
enum Resolved {
    Found(Arc<LockedBucket>),
    Absent { key: String },
}

/// Packs many items into a bounded number of storage entries.
///
/// Items are routed by a cryptographic digest of their id: a bucket owns
/// every digest its key prefixes. When a bucket outgrows the backend's entry
/// size it splits into `2^shard_bucket_bits` children, each claiming one
/// more label of the digest, and the tree deepens — items never move between
/// unrelated prefixes, so routing stays stable across restarts.
pub struct Packer {
    buckets: StorageView,
    config: PackerConfig,
    locks: LockPool,
    index: RwLock<RadixTree<Arc<LockedBucket>>>,
    queue_mode: AtomicBool,
    queued: Mutex<BTreeMap<String, Arc<LockedBucket>>>,
}

impl Packer {
    /// Opens a packer over the given views. A stored config dictates
    /// `base_bucket_bits` unconditionally — items are already routed by it.
    /// On a fresh store the validated options are persisted first, so a
    /// crash right after open leaves routing parameters durable.
    pub fn open(
        ctx: &CancelToken,
        config_view: &StorageView,
        bucket_view: &StorageView,
        options: Options,
    ) -> Result<Self> {
        let config = match PackerConfig::load(ctx, config_view)? {
            Some(stored) => {
                let config = PackerConfig {
                    base_bucket_bits: stored.base_bucket_bits,
                    shard_bucket_bits: options
                        .shard_bucket_bits
                        .unwrap_or(stored.shard_bucket_bits),
                };
                config.validate()?;
                config
            }
            None => {
                let config = PackerConfig {
                    base_bucket_bits: options
                        .base_bucket_bits
                        .unwrap_or(DEFAULT_BASE_BUCKET_BITS),
                    shard_bucket_bits: options
                        .shard_bucket_bits
                        .unwrap_or(DEFAULT_SHARD_BUCKET_BITS),
                };
                config.validate()?;
                config.persist(ctx, config_view)?;
                config
            }
        };

        let packer = Self {
            buckets: bucket_view.sub_view(BUCKET_VIEW_PREFIX),
            config,
            locks: LockPool::new(),
            index: RwLock::new(RadixTree::new()),
            queue_mode: AtomicBool::new(false),
            queued: Mutex::new(BTreeMap::new()),
        };
        packer.reconcile_interrupted_splits(ctx)?;
        Ok(packer)
    }

    /// The number of hash bits forming root-level bucket keys.
    pub fn base_bucket_bits(&self) -> u32 {
        self.config.base_bucket_bits
    }

    /// The number of hash bits each future split consumes.
    pub fn shard_bucket_bits(&self) -> u32 {
        self.config.shard_bucket_bits
    }

    /// Storage key of the bucket responsible for `item_id`.
    pub fn bucket_key_for(&self, item_id: &str) -> String {
        self.bucket_key_for_digest(&hasher::digest(item_id))
    }

    fn bucket_key_for_digest(&self, digest: &str) -> String {
        {
            let index = self.index.read().unwrap();
            if let Some((_, bucket)) = index.longest_prefix(digest) {
                return bucket.key().to_string();
            }
        }

        // Nothing cached routes this digest. Take the pool lock for the
        // base-level candidate and look again before answering, in case a
        // concurrent writer was mid-insert.
        let candidate = digest[..(self.config.base_bucket_bits / 4) as usize].to_string();
        let _pool = self.locks.lock_for(&candidate).read().unwrap();
        let index = self.index.read().unwrap();
        if let Some((_, bucket)) = index.longest_prefix(digest) {
            return bucket.key().to_string();
        }
        candidate
    }

    /// Stores an item in its bucket, creating the bucket on first write.
    /// Concurrent writes to the same id serialize on the bucket's pool lock;
    /// the last writer's payload is the one that lands.
    pub fn put_item(&self, ctx: &CancelToken, item: &Item) -> Result<()> {
        if item.id.is_empty() {
            return Err(Error::InvalidArgument("missing id in item".to_string()));
        }
        let digest = hasher::digest(&item.id);
        let mut target: Option<String> = None;
        loop {
            let bucket_key = target
                .take()
                .unwrap_or_else(|| self.bucket_key_for_digest(&digest));
            let cache = cache_key(&bucket_key);
            let _pool = self.locks.lock_for(&cache).write().unwrap();

            let cached = {
                let index = self.index.read().unwrap();
                index.longest_prefix(&digest).map(|(_, b)| b.clone())
            };
            let bucket = match cached {
                Some(bucket) => {
                    if cache_key(bucket.key()) != cache {
                        // Routing moved (a split, or a deeper leaf was
                        // indexed) while we waited for the lock; retry
                        // against the bucket that owns the digest now.
                        target = Some(bucket.key().to_string());
                        continue;
                    }
                    bucket
                }
                None => match self.load_bucket(ctx, &digest, &bucket_key)? {
                    Resolved::Found(bucket) => {
                        self.index
                            .write()
                            .unwrap()
                            .insert(&cache_key(bucket.key()), bucket.clone());
                        if cache_key(bucket.key()) != cache {
                            target = Some(bucket.key().to_string());
                            continue;
                        }
                        bucket
                    }
                    Resolved::Absent { key } => {
                        if cache_key(&key) != cache {
                            target = Some(key);
                            continue;
                        }
                        let bucket = Arc::new(LockedBucket::new(Bucket::new(key)));
                        self.index.write().unwrap().insert(&cache, bucket.clone());
                        bucket
                    }
                },
            };

            let mut guard = bucket.write();
            let previous = guard.items.get(&item.id).cloned();
            guard.upsert(item)?;
            let split_leaves = match self.store_bucket(ctx, &bucket, &mut guard) {
                Ok(leaves) => leaves,
                Err(e) => {
                    // Keep memory matching storage so a retry observes
                    // consistent state.
                    match previous {
                        Some(payload) => guard.items.insert(item.id.clone(), payload),
                        None => guard.items.remove(&item.id),
                    };
                    return Err(e);
                }
            };
            drop(guard);
            if let Some(leaves) = split_leaves {
                self.swap_index_after_split(&cache, leaves);
            }
            return Ok(());
        }
    }

    /// Fetches an item by id. Absent bucket, empty bucket, and unknown id
    /// all come back as `None`.
    pub fn get_item(&self, ctx: &CancelToken, id: &str) -> Result<Option<Item>> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("empty item id".to_string()));
        }
        let digest = hasher::digest(id);
        let mut target: Option<String> = None;
        loop {
            let bucket_key = target
                .take()
                .unwrap_or_else(|| self.bucket_key_for_digest(&digest));
            let cache = cache_key(&bucket_key);
            let _pool = self.locks.lock_for(&cache).read().unwrap();

            let cached = {
                let index = self.index.read().unwrap();
                index.longest_prefix(&digest).map(|(_, b)| b.clone())
            };
            let bucket = match cached {
                Some(bucket) => {
                    if cache_key(bucket.key()) != cache {
                        target = Some(bucket.key().to_string());
                        continue;
                    }
                    bucket
                }
                None => match self.load_bucket(ctx, &digest, &bucket_key)? {
                    Resolved::Found(bucket) => {
                        self.index
                            .write()
                            .unwrap()
                            .insert(&cache_key(bucket.key()), bucket.clone());
                        if cache_key(bucket.key()) != cache {
                            target = Some(bucket.key().to_string());
                            continue;
                        }
                        bucket
                    }
                    Resolved::Absent { .. } => return Ok(None),
                },
            };

            let guard = bucket.read();
            return Ok(guard
                .get(id)
                .map(|payload| Item::new(id, payload.to_vec())));
        }
    }

    /// Removes an item. Deleting an absent id is a no-op; the bucket itself
    /// is never deleted, even once empty, so prefix assignments stay stable
    /// under concurrent writers.
    pub fn delete_item(&self, ctx: &CancelToken, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("empty item id".to_string()));
        }
        let digest = hasher::digest(id);
        let mut target: Option<String> = None;
        loop {
            let bucket_key = target
                .take()
                .unwrap_or_else(|| self.bucket_key_for_digest(&digest));
            let cache = cache_key(&bucket_key);
            let _pool = self.locks.lock_for(&cache).write().unwrap();

            let cached = {
                let index = self.index.read().unwrap();
                index.longest_prefix(&digest).map(|(_, b)| b.clone())
            };
            let bucket = match cached {
                Some(bucket) => {
                    if cache_key(bucket.key()) != cache {
                        target = Some(bucket.key().to_string());
                        continue;
                    }
                    bucket
                }
                None => match self.load_bucket(ctx, &digest, &bucket_key)? {
                    Resolved::Found(bucket) => {
                        self.index
                            .write()
                            .unwrap()
                            .insert(&cache_key(bucket.key()), bucket.clone());
                        if cache_key(bucket.key()) != cache {
                            target = Some(bucket.key().to_string());
                            continue;
                        }
                        bucket
                    }
                    Resolved::Absent { .. } => return Ok(()),
                },
            };

            let mut guard = bucket.write();
            let Some(previous) = guard.items.get(id).cloned() else {
                return Ok(());
            };
            guard.remove(id);
            let split_leaves = match self.store_bucket(ctx, &bucket, &mut guard) {
                Ok(leaves) => leaves,
                Err(e) => {
                    guard.items.insert(id.to_string(), previous);
                    return Err(e);
                }
            };
            drop(guard);
            if let Some(leaves) = split_leaves {
                self.swap_index_after_split(&cache, leaves);
            }
            return Ok(());
        }
    }

    /// Deletes a bucket's storage entry and drops it from the index. Shard
    /// children are separate entries and are not touched; walk
    /// [`Packer::bucket_keys`] to remove a subtree.
    pub fn delete_bucket(&self, ctx: &CancelToken, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("missing bucket key".to_string()));
        }
        let cache = cache_key(key);
        let _pool = self.locks.lock_for(&cache).write().unwrap();
        self.buckets.delete(ctx, key)?;
        self.index.write().unwrap().delete(&cache);
        Ok(())
    }

    /// The union of bucket keys present in the backend and keys currently
    /// cached in the index, sorted.
    pub fn bucket_keys(&self, ctx: &CancelToken) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self.buckets.list(ctx, "")?.into_iter().collect();
        let index = self.index.read().unwrap();
        index.walk(|key, _| {
            keys.insert(key.to_string());
            false
        });
        Ok(keys.into_iter().collect())
    }

    /// While queue mode is on, bucket writes accumulate in memory instead of
    /// hitting the backend; [`Packer::flush_queue`] persists them in bulk.
    /// Buckets already mid-write are unaffected by a toggle.
    pub fn set_queue_mode(&self, enabled: bool) {
        self.queue_mode.store(enabled, Ordering::SeqCst);
    }

    /// Drains the pending-writes map, persisting every queued bucket under
    /// its proper locks (splitting where needed). Failures are collected so
    /// one bad bucket does not strand the rest. Idempotent; a no-op when
    /// nothing is queued.
    pub fn flush_queue(&self, ctx: &CancelToken) -> Result<()> {
        let pending: Vec<(String, Arc<LockedBucket>)> = {
            let mut queued = self.queued.lock().unwrap();
            std::mem::take(&mut *queued).into_iter().collect()
        };
        let mut errors = Vec::new();
        for (key, bucket) in pending {
            let cache = cache_key(&key);
            let _pool = self.locks.lock_for(&cache).write().unwrap();
            let mut guard = bucket.write();
            match self.persist_routed(ctx, &mut guard) {
                Ok(None) => {}
                Ok(Some(leaves)) => {
                    drop(guard);
                    self.swap_index_after_split(&cache, leaves);
                }
                Err(e) => {
                    warn!("failed to flush queued bucket {key}: {e}");
                    errors.push(e);
                }
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    // ========================================================================
    // Internal machinery
    // ========================================================================

    /// Read-through load starting at `bucket_key`. Internal records route
    /// the digest down one stored label at a time — label width comes from
    /// the record itself, so splits made under older shard settings keep
    /// resolving — until a leaf record or an unwritten key is reached.
    fn load_bucket(&self, ctx: &CancelToken, digest: &str, bucket_key: &str) -> Result<Resolved> {
        let mut key = bucket_key.to_string();
        loop {
            let Some(bytes) = self.buckets.get(ctx, &key)? else {
                return Ok(Resolved::Absent { key });
            };
            let mut bucket = codec::decode(&bytes)?;
            if !bucket.is_internal() {
                bucket.key = key;
                return Ok(Resolved::Found(Arc::new(LockedBucket::new(bucket))));
            }
            let width = bucket.children.keys().map(|l| l.len()).next().unwrap_or(0);
            let consumed = cache_key(&key).len();
            if width == 0 || consumed + width > digest.len() {
                return Err(Error::CorruptBucket(format!(
                    "sharded bucket {key} has unusable child labels"
                )));
            }
            key.push_str(&digest[consumed..consumed + width]);
        }
    }

    /// Persists a bucket's current contents. Expects the bucket's pool and
    /// writer locks to be held. In queue mode the write is deferred instead.
    /// When the write triggered a split, the new leaf buckets are returned
    /// so the caller can swap the index once the writer guard is dropped.
    fn store_bucket(
        &self,
        ctx: &CancelToken,
        bucket: &Arc<LockedBucket>,
        guard: &mut Bucket,
    ) -> Result<Option<Vec<Bucket>>> {
        // Snapshot the flag once; a toggle mid-write must not leave half of
        // a split queued and the other half persisted.
        if self.queue_mode.load(Ordering::SeqCst) {
            self.queued
                .lock()
                .unwrap()
                .insert(bucket.key().to_string(), bucket.clone());
            return Ok(None);
        }
        self.persist_routed(ctx, guard)
    }

    /// Encode + put for a bucket that is visible to routing, sharding it on
    /// overflow. On a split the guard is rewritten to the internal form and
    /// the new leaves are returned; the caller swaps the index after
    /// releasing the guard, keeping the pool → index → bucket lock order.
    fn persist_routed(
        &self,
        ctx: &CancelToken,
        guard: &mut Bucket,
    ) -> Result<Option<Vec<Bucket>>> {
        let encoded = codec::encode(guard)?;
        match self.buckets.put(ctx, &guard.key, &encoded) {
            Ok(()) => Ok(None),
            Err(e) if is_entry_too_large(&e) => {
                debug!(
                    "bucket {} exceeded the backend entry size, sharding",
                    guard.key
                );
                let (internal, leaves) = self.split_into_shards(ctx, guard)?;
                *guard = internal;
                Ok(Some(leaves))
            }
            Err(e) => Err(e),
        }
    }

    /// Swaps the index from a split parent to its new leaves. The parent's
    /// pool lock must be held; the bucket's own writer guard must already be
    /// dropped so the index lock is never held together with it.
    fn swap_index_after_split(&self, parent_cache: &str, leaves: Vec<Bucket>) {
        let mut index = self.index.write().unwrap();
        index.delete(parent_cache);
        for leaf in leaves {
            index.insert(&cache_key(&leaf.key), Arc::new(LockedBucket::new(leaf)));
        }
    }

    /// Splits an oversized leaf into `2^shard_bucket_bits` children, routing
    /// each item by the next digest label past the parent prefix. Children
    /// are made durable before the parent's rewritten record, otherwise a
    /// crash in between could strand items; an interrupted split leaves the
    /// old parent readable and is reconciled on the next open. The caller's
    /// bucket is never touched: the internal parent form and every stored
    /// leaf descendant — children that overflowed again split recursively —
    /// are returned only once every write has succeeded, so a failed split
    /// leaves the in-memory state exactly as it was.
    fn split_into_shards(
        &self,
        ctx: &CancelToken,
        parent: &Bucket,
    ) -> Result<(Bucket, Vec<Bucket>)> {
        let width = (self.config.shard_bucket_bits / 4) as usize;
        let consumed = cache_key(&parent.key).len();
        if consumed + width > hasher::DIGEST_HEX_LEN {
            return Err(Error::Internal(format!(
                "bucket {} cannot shard further, digest exhausted",
                parent.key
            )));
        }
        let shard_count = 1usize << self.config.shard_bucket_bits;
        debug!("sharding bucket {} into {shard_count} children", parent.key);

        let mut children: BTreeMap<String, Bucket> = (0..shard_count)
            .map(|i| {
                let label = format!("{i:0width$x}");
                let child = Bucket::new(format!("{}{label}", parent.key));
                (label, child)
            })
            .collect();
        for (id, payload) in &parent.items {
            let digest = hasher::digest(id);
            let label = &digest[consumed..consumed + width];
            let child = children.get_mut(label).ok_or_else(|| {
                Error::Internal(format!("no shard child for digest label {label}"))
            })?;
            child.items.insert(id.clone(), payload.clone());
        }

        let mut stored = Vec::new();
        for (_, child) in children {
            if child.items.is_empty() {
                continue;
            }
            let encoded = codec::encode(&child)?;
            match self.buckets.put(ctx, &child.key, &encoded) {
                Ok(()) => stored.push(child),
                Err(e) if is_entry_too_large(&e) => {
                    let (_, mut grandchildren) = self.split_into_shards(ctx, &child)?;
                    stored.append(&mut grandchildren);
                }
                Err(e) => return Err(e),
            }
        }

        let internal = Bucket {
            key: parent.key.clone(),
            items: BTreeMap::new(),
            children: (0..shard_count)
                .map(|i| {
                    let label = format!("{i:0width$x}");
                    let stub = Bucket::new(format!("{}{label}", parent.key));
                    (label, stub)
                })
                .collect(),
            unknown: parent.unknown.clone(),
        };
        let encoded = codec::encode(&internal)?;
        self.buckets.put(ctx, &internal.key, &encoded)?;
        Ok((internal, stored))
    }

    /// A crash between writing shard children and rewriting their parent
    /// leaves the parent stored as a stale leaf — or, if the parent record
    /// itself had never been written, missing — while child entries already
    /// exist. The children win: any key with stored descendants that still
    /// decodes as a leaf is rewritten as an internal record here, and a
    /// missing base-level parent is synthesized, so routing descends past
    /// them instead of shadowing the children with a fresh leaf.
    fn reconcile_interrupted_splits(&self, ctx: &CancelToken) -> Result<()> {
        let stored: BTreeSet<String> = self.buckets.list(ctx, "")?.into_iter().collect();
        let base_chars = (self.config.base_bucket_bits / 4) as usize;
        let mut candidates: BTreeSet<String> = stored.clone();
        for key in &stored {
            if key.len() > base_chars {
                candidates.insert(key[..base_chars].to_string());
            }
        }

        for parent in &candidates {
            let suffixes: Vec<&str> = stored
                .range::<str, _>((
                    std::ops::Bound::Excluded(parent.as_str()),
                    std::ops::Bound::Unbounded,
                ))
                .take_while(|k| k.starts_with(parent.as_str()))
                .map(|k| &k[parent.len()..])
                .collect();
            let Some(width) = suffixes.iter().map(|s| s.len()).min() else {
                continue;
            };
            let labels: BTreeSet<String> = suffixes
                .iter()
                .map(|s| s[..width].to_string())
                .collect();

            let cache = cache_key(parent);
            let _pool = self.locks.lock_for(&cache).write().unwrap();
            let mut bucket = match self.buckets.get(ctx, parent)? {
                Some(bytes) => {
                    let bucket = codec::decode(&bytes)?;
                    if bucket.is_internal() {
                        continue;
                    }
                    warn!("bucket {parent} has shard children but is stored as a leaf, rewriting as internal");
                    bucket
                }
                None => {
                    warn!("bucket {parent} has shard children but no record, synthesizing an internal one");
                    Bucket::default()
                }
            };
            bucket.key = parent.clone();
            bucket.items.clear();
            bucket.children = labels
                .into_iter()
                .map(|label| {
                    let stub = Bucket::new(format!("{parent}{label}"));
                    (label, stub)
                })
                .collect();
            let encoded = codec::encode(&bucket)?;
            self.buckets.put(ctx, parent, &encoded)?;
        }
        Ok(())
    }
}
