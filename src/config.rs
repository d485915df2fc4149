// src/config.rs
use serde::{Deserialize, Serialize};

use crate::backend::StorageView;
use crate::cancel::CancelToken;
use crate::constants::{CONFIG_KEY, DEFAULT_BASE_BUCKET_BITS, DEFAULT_SHARD_BUCKET_BITS};
use crate::error::{Error, Result};

/// The packer's persisted routing parameters.
///
/// `base_bucket_bits` is frozen the moment data is first written: items are
/// already routed by it, so later opens adopt the stored value and ignore
/// any override. `shard_bucket_bits` may be retuned; the current value only
/// shapes future splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackerConfig {
    pub base_bucket_bits: u32,
    pub shard_bucket_bits: u32,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            base_bucket_bits: DEFAULT_BASE_BUCKET_BITS,
            shard_bucket_bits: DEFAULT_SHARD_BUCKET_BITS,
        }
    }
}

impl PackerConfig {
    /// Both bit widths must map to whole hex characters and describe at
    /// least one character / two shard children, and routing can never
    /// consume more than the digest provides.
    pub fn validate(&self) -> Result<()> {
        for (name, bits) in [
            ("base_bucket_bits", self.base_bucket_bits),
            ("shard_bucket_bits", self.shard_bucket_bits),
        ] {
            if bits < 4 {
                return Err(Error::InvalidArgument(format!(
                    "{name} must be at least 4, got {bits}"
                )));
            }
            if bits % 4 != 0 {
                return Err(Error::InvalidArgument(format!(
                    "{name} must be a multiple of four, got {bits}"
                )));
            }
            if bits > 256 {
                return Err(Error::InvalidArgument(format!(
                    "{name} must not exceed the 256-bit digest, got {bits}"
                )));
            }
        }
        Ok(())
    }

    /// Loads the stored config from the config view, if one exists.
    pub fn load(ctx: &CancelToken, view: &StorageView) -> Result<Option<Self>> {
        match view.get(ctx, CONFIG_KEY)? {
            None => Ok(None),
            Some(bytes) => {
                let config: PackerConfig = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::InvalidArgument(format!("malformed packer config: {e}"))
                })?;
                Ok(Some(config))
            }
        }
    }

    /// Persists the config as JSON under the well-known key.
    pub fn persist(&self, ctx: &CancelToken, view: &StorageView) -> Result<()> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("failed to encode packer config: {e}")))?;
        view.put(ctx, CONFIG_KEY, &bytes)
    }
}
