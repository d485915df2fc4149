// src/error.rs
use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the packer and its storage backends.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid caller input: empty item id, empty bucket key, malformed config.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend rejected a value as exceeding its maximum entry size.
    /// The packer catches this internally and shards the bucket.
    #[error("storage entry is too large")]
    EntryTooLarge,

    /// A stored bucket payload could not be decoded. The packer never
    /// self-heals these; the entry must be repaired or deleted out of band.
    #[error("corrupt bucket: {0}")]
    CorruptBucket(String),

    /// A transient backend failure.
    #[error("io error: {0}")]
    Io(String),

    /// Codec or allocator anomalies.
    #[error("internal error: {0}")]
    Internal(String),

    /// The caller's cancellation token fired.
    #[error("operation aborted")]
    Aborted,

    /// Multiple failures collected while draining the write queue.
    #[error("{} queued writes failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

/// Returns true if `err` indicates an oversized entry. Checks the typed
/// variant first and falls back to substring matching for backends that can
/// only surface the condition as error text.
pub fn is_entry_too_large(err: &Error) -> bool {
    match err {
        Error::EntryTooLarge => true,
        Error::Io(msg) | Error::Internal(msg) => msg.contains("too large"),
        _ => false,
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
