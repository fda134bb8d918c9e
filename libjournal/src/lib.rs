//! # libjournal: CSI idempotency journal for RADOS-backed volumes
//!
//! `libjournal` maps orchestrator request names to backend image names so
//! that repeated CreateVolume / CreateSnapshot calls converge on one image.
//! The mapping lives in RADOS object maps (omaps) on the cluster itself and
//! survives driver restarts, pool renames and cross-cluster failover.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`journal`] | Reservation state machine over directory and per-UUID omaps. |
//! | [`omap`] | Paged omap get/set/remove with cancellation. |
//! | [`rados`] | Cluster session traits plus an in-memory backend. |
//! | [`conn_pool`] | Reference-counted, expiring pool of cluster sessions. |
//! | [`volid`] | Versioned, pool-rename-safe CSI volume id encoding. |
//! | [`csi_config`] | Cluster config file: monitors, namespaces, read affinity. |
//! | [`cluster_mapping`] | Cluster and pool id mapping for mirrored failover. |
//! | [`locks`] | Per-request-name and per-operation in-process locks. |
//! | [`kms`] | KMS providers and the DEK store abstraction. |
//! | [`encryption`] | [`VolumeEncryption`] and the journal-backed DEK store. |
//! | [`config`] | [`JournalSettings`] loaded from the environment. |
//! | [`error`] | [`JournalError`] enum covering all failure modes. |

pub mod cluster_mapping;
pub mod config;
pub mod conn_pool;
pub mod csi_config;
pub mod encryption;
pub mod error;
pub mod journal;
pub mod kms;
pub mod locks;
pub mod omap;
pub mod rados;
pub mod types;
pub mod volid;

pub use config::JournalSettings;
pub use conn_pool::ConnPool;
pub use encryption::VolumeEncryption;
pub use error::{JournalError, Result};
pub use journal::{Connection, ImageAttributes, ImageData, JournalConfig};
pub use volid::CsiIdentifier;
pub use types::*;
