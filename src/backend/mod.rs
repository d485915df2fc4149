// src/backend/mod.rs
//! The key-value contract the packer consumes, plus prefix-scoped views and
//! two reference backends (in-memory and one-file-per-key).

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::Result;

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Minimal storage contract. Implementations are consensus-replicated
/// stores, remote KV services, or local files; the packer only assumes these
/// four operations and that `put` reports oversized values as
/// [`crate::Error::EntryTooLarge`] (or error text naming the condition).
pub trait Backend: Send + Sync {
    /// Returns the value stored under `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, overwriting any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removes `key`. Deleting an absent key is a no-op.
    fn delete(&self, key: &str) -> Result<()>;

    /// Lists all keys beginning with `prefix`, in unspecified order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// A prefix-scoped window onto a backend. Views nest: mounting `"v2/"`
/// inside a `"packer/buckets/"` view reads and writes under
/// `"packer/buckets/v2/"`.
///
/// Cancellation is observed here, at the storage boundary, so callers never
/// abort mid-mutation.
#[derive(Clone)]
pub struct StorageView {
    backend: Arc<dyn Backend>,
    prefix: String,
}

impl StorageView {
    pub fn new(backend: Arc<dyn Backend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// A view scoped one level deeper.
    pub fn sub_view(&self, prefix: &str) -> Self {
        Self {
            backend: self.backend.clone(),
            prefix: format!("{}{}", self.prefix, prefix),
        }
    }

    pub fn get(&self, ctx: &CancelToken, key: &str) -> Result<Option<Vec<u8>>> {
        ctx.check()?;
        self.backend.get(&self.full_key(key))
    }

    pub fn put(&self, ctx: &CancelToken, key: &str, value: &[u8]) -> Result<()> {
        ctx.check()?;
        self.backend.put(&self.full_key(key), value)
    }

    pub fn delete(&self, ctx: &CancelToken, key: &str) -> Result<()> {
        ctx.check()?;
        self.backend.delete(&self.full_key(key))
    }

    /// Lists keys under this view, with the view prefix stripped.
    pub fn list(&self, ctx: &CancelToken, prefix: &str) -> Result<Vec<String>> {
        ctx.check()?;
        let full = self.full_key(prefix);
        Ok(self
            .backend
            .list(&full)?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&self.prefix)
                    .map(|stripped| stripped.to_string())
            })
            .collect())
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_view_prefixes_keys() {
        let ctx = CancelToken::new();
        let backend = Arc::new(MemoryBackend::new());
        let view = StorageView::new(backend.clone(), "packer/buckets/");
        view.put(&ctx, "3f", b"x").unwrap();

        assert_eq!(
            backend.get("packer/buckets/3f").unwrap(),
            Some(b"x".to_vec())
        );
        assert_eq!(view.get(&ctx, "3f").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_sub_view_nests() {
        let ctx = CancelToken::new();
        let backend = Arc::new(MemoryBackend::new());
        let view = StorageView::new(backend.clone(), "a/").sub_view("b/");
        view.put(&ctx, "k", b"v").unwrap();
        assert_eq!(backend.get("a/b/k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(view.list(&ctx, "").unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_list_strips_view_prefix() {
        let ctx = CancelToken::new();
        let backend = Arc::new(MemoryBackend::new());
        let view = StorageView::new(backend.clone(), "v2/");
        view.put(&ctx, "00", b"a").unwrap();
        view.put(&ctx, "01", b"b").unwrap();
        backend.put("other/02", b"c").unwrap();

        let mut keys = view.list(&ctx, "").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["00".to_string(), "01".to_string()]);
        assert_eq!(view.list(&ctx, "00").unwrap(), vec!["00".to_string()]);
    }

    #[test]
    fn test_cancellation_observed_at_boundary() {
        let ctx = CancelToken::new();
        let view = StorageView::new(Arc::new(MemoryBackend::new()), "");
        ctx.cancel();
        assert!(matches!(view.get(&ctx, "k"), Err(Error::Aborted)));
        assert!(matches!(view.put(&ctx, "k", b"v"), Err(Error::Aborted)));
        assert!(matches!(view.delete(&ctx, "k"), Err(Error::Aborted)));
        assert!(matches!(view.list(&ctx, ""), Err(Error::Aborted)));
    }
}
