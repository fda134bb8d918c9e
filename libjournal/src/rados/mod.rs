//! Object-store seam.
//!
//! The journal never talks to a cluster directly.  It goes through three
//! small traits:
//!
//! | Trait | Role |
//! |---|---|
//! | [`Connector`] | Opens a new cluster session for `(monitors, user, key)`. |
//! | [`Cluster`] | A live session: pool lookups and per-pool I/O contexts. |
//! | [`IoContext`] | Object and omap I/O scoped to one `(pool, namespace)`. |
//!
//! [`memory`] provides an in-process implementation.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Raw errors raised by an object-store backend.  The `omap` layer maps
/// these onto [`crate::JournalError`] kinds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadosError {
    /// The pool, object or key does not exist (`ENOENT`).
    #[error("not found: {0}")]
    NotFound(String),
    /// Exclusive create hit an existing object (`EEXIST`).
    #[error("already exists: {0}")]
    Exists(String),
    /// The session was shut down; reconnect through the pool.
    #[error("cluster connection is shut down")]
    Shutdown,
    #[error("{0}")]
    Other(String),
}

/// Opens cluster sessions.  Implemented once per backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        monitors: &str,
        user: &str,
        key: &str,
    ) -> Result<Arc<dyn Cluster>, RadosError>;
}

/// A connected cluster session.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Resolve a pool name to its immutable id.
    async fn pool_id(&self, pool: &str) -> Result<i64, RadosError>;

    /// Resolve a pool id to its current name.
    async fn pool_name(&self, pool_id: i64) -> Result<String, RadosError>;

    /// Open an I/O context on `pool`, scoped to `namespace` when non-empty.
    async fn io_context(&self, pool: &str, namespace: &str)
    -> Result<Box<dyn IoContext>, RadosError>;

    /// Close the session.  Every later call fails with
    /// [`RadosError::Shutdown`].
    fn shutdown(&self);
}

/// Object and omap operations on one `(pool, namespace)`.
#[async_trait]
pub trait IoContext: Send + Sync {
    /// List up to `max` omap entries of `oid` whose keys start with
    /// `prefix` and sort strictly after `start_after`, in key order.
    async fn list_omap_values(
        &self,
        oid: &str,
        start_after: &str,
        prefix: &str,
        max: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, RadosError>;

    /// Insert or replace keys in one atomic write, creating the object if
    /// needed.
    async fn set_omap(&self, oid: &str, pairs: &BTreeMap<String, Vec<u8>>)
    -> Result<(), RadosError>;

    /// Remove keys in one atomic write.
    async fn rm_omap_keys(&self, oid: &str, keys: &[String]) -> Result<(), RadosError>;

    /// Create an empty object.  With `exclusive` an existing object yields
    /// [`RadosError::Exists`].
    async fn create(&self, oid: &str, exclusive: bool) -> Result<(), RadosError>;

    /// Remove an object together with its omap.
    async fn remove(&self, oid: &str) -> Result<(), RadosError>;
}
