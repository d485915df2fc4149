// src/constants.rs

/// Storage prefix current-format bucket entries live under. A future format
/// revision gets its own prefix so both can coexist during migration.
pub const BUCKET_VIEW_PREFIX: &str = "v2/";

/// Key the packer's routing parameters persist under, in the config view.
pub const CONFIG_KEY: &str = "config";

/// Hash bits consumed by root-level bucket keys when no stored config
/// dictates otherwise. 8 bits = 256 base buckets.
pub const DEFAULT_BASE_BUCKET_BITS: u32 = 8;

/// Additional hash bits consumed per shard level by default. 4 bits = 16
/// children per split.
pub const DEFAULT_SHARD_BUCKET_BITS: u32 = 4;
