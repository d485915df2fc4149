// src/lib.rs
pub mod backend;
pub mod bucket;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod hasher;
pub mod locks;
pub mod packer;
pub mod radix;

// Re-export main types
pub use backend::{Backend, FileBackend, MemoryBackend, StorageView};
pub use bucket::{cache_key, Bucket, Item, LockedBucket};
pub use cancel::CancelToken;
pub use config::PackerConfig;
pub use error::{is_entry_too_large, Error, Result};
pub use packer::{Options, Packer};
