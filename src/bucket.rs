// src/bucket.rs
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// A single packed entry: an opaque payload filed under a caller-chosen id.
/// The payload carries its own type tag; the packer never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub payload: Vec<u8>,
}

impl Item {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// The unit of packing: one storage entry holding many items, or — once
/// sharded — a small record pointing at its children.
///
/// A bucket is either a leaf (items, no children) or internal (children, no
/// items). Its key doubles as its routing prefix: every descendant's key
/// extends it by one shard label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    pub key: String,
    pub items: BTreeMap<String, Vec<u8>>,
    pub children: BTreeMap<String, Bucket>,
    /// Raw bytes of wire fields this version does not understand, re-emitted
    /// verbatim on encode so foreign data survives read-modify-write.
    pub unknown: Vec<u8>,
}

impl Bucket {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// True once the bucket has been sharded into children.
    pub fn is_internal(&self) -> bool {
        !self.children.is_empty()
    }

    /// Inserts the item or replaces the payload already stored under its id.
    pub fn upsert(&mut self, item: &Item) -> Result<()> {
        if item.id.is_empty() {
            return Err(Error::InvalidArgument("missing item id".to_string()));
        }
        self.items.insert(item.id.clone(), item.payload.clone());
        Ok(())
    }

    /// Removes the item if present; deleting an absent id is a no-op.
    pub fn remove(&mut self, id: &str) {
        self.items.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<&[u8]> {
        self.items.get(id).map(|payload| payload.as_slice())
    }
}

/// A bucket paired with its own readers-writer lock; the handle form held by
/// the in-memory index. The key is duplicated outside the lock so routing
/// can read it without contending with content mutation.
#[derive(Debug)]
pub struct LockedBucket {
    key: String,
    bucket: RwLock<Bucket>,
}

impl LockedBucket {
    pub fn new(bucket: Bucket) -> Self {
        Self {
            key: bucket.key.clone(),
            bucket: RwLock::new(bucket),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Bucket> {
        self.bucket.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Bucket> {
        self.bucket.write().unwrap()
    }
}

/// Cache form of a bucket storage key: the key with path separators
/// stripped, leaving only routing prefix characters.
pub fn cache_key(storage_key: &str) -> String {
    storage_key.replace('/', "")
}
