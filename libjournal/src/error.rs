//! Journal error types.
//!
//! All errors surfaced by `libjournal` are represented by the [`JournalError`]
//! enum.  Callers that need to tell "absent" apart from "broken" use the
//! `is_*` helpers instead of matching on message text.

use thiserror::Error;

/// Unified error type for journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// An expected key (or the object holding it) is missing from an omap.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A pool could not be resolved by name or by id.
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    /// An exclusive object create found the object already present.
    #[error("object already exists: {0}")]
    ObjectExists(String),

    /// An object that was to be removed does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// A snapshot request name is already reserved for a different source.
    #[error("snapshot name conflict: {0}")]
    SnapNameConflict(String),

    /// The request did not carry a cluster id.
    #[error("clusterID must be set")]
    ClusterIdNotSet,

    /// The stored journal state disagrees with the request and needs an
    /// operator to repair it.
    #[error("internal state inconsistent: {0}")]
    Corruption(String),

    /// An incompatible operation is already running on the same volume.
    #[error("{0}")]
    OperationConflict(String),

    /// Every generated UUID collided with an existing per-UUID object.
    #[error("uuid conflicts exceeds retry threshold")]
    UuidConflictRetriesExceeded,

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A CSI volume identifier failed to encode or decode.
    #[error("invalid volume id: {0}")]
    InvalidVolumeId(String),

    /// The operation observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A configuration file or option is invalid or missing.
    #[error("configuration error: {0}")]
    Config(String),

    /// A KMS operation failed.
    #[error("kms error: {0}")]
    Kms(String),

    /// No DEK store is configured for the volume encryption instance.
    #[error("DEKStore not found")]
    DekStoreNotFound,

    /// The object store returned an error that has no domain meaning.
    #[error("backend error: {0}")]
    Backend(String),

    /// Local file I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialisation failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, JournalError>;

impl JournalError {
    /// Create a [`JournalError::Backend`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::Backend(e.to_string())
    }

    /// Create a [`JournalError::Kms`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn kms<E: std::fmt::Display>(e: E) -> Self {
        Self::Kms(e.to_string())
    }

    /// Create a [`JournalError::Config`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }

    pub fn is_pool_not_found(&self) -> bool {
        matches!(self, Self::PoolNotFound(_))
    }

    pub fn is_object_exists(&self) -> bool {
        matches!(self, Self::ObjectExists(_))
    }

    pub fn is_object_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_))
    }

    pub fn is_snap_name_conflict(&self) -> bool {
        matches!(self, Self::SnapNameConflict(_))
    }
}
