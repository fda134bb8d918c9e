//! Idempotency journal.
//!
//! The orchestrator names volumes and snapshots by request name; the
//! backend names them by random UUID.  The journal records the mapping in
//! two kinds of omap object:
//!
//! - a *directory* (`csi.volumes.<instance>` / `csi.snaps.<instance>`)
//!   mapping `csi.volume.<request name>` to the UUID, optionally prefixed by
//!   the hex pool id of the image pool when it differs from the journal pool;
//! - one *per-UUID* object (`csi.volume.<uuid>` / `csi.snap.<uuid>`) in the
//!   image pool holding the back-pointer to the request name and the rest of
//!   the [`ImageAttributes`].
//!
//! A reservation is created as: per-UUID object, then directory entry, then
//! attributes.  It is undone as: per-UUID object, then directory entry.
//! [`Connection::check_reservation`] recognises every partial state those
//! orders can leave behind and garbage collects it.
//!
//! Every operation manipulates omaps keyed by the request name and must be
//! called with that name held in a [`crate::locks::VolumeLocks`].

mod attributes;
mod reservation;

pub use reservation::{CheckRequest, Reservation, ReserveRequest};

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::config::{
    DEFAULT_LIST_EXCESS, DEFAULT_MAX_UUID_ATTEMPTS, DEFAULT_SNAPSHOT_NAMING_PREFIX,
    DEFAULT_VOLUME_NAMING_PREFIX, JournalSettings,
};
use crate::conn_pool::ConnPool;
use crate::error::{JournalError, Result};
use crate::rados::Cluster;
use crate::types::{Credentials, EncryptionType};

// ---------------------------------------------------------------------------
// UUID generation
// ---------------------------------------------------------------------------

/// Source of candidate UUIDs for new reservations.
pub trait UuidSource: Send + Sync {
    /// A lowercase canonical UUID string.
    fn next_uuid(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomUuid;

impl UuidSource for RandomUuid {
    fn next_uuid(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Hands out a fixed list of UUIDs in order, then random ones.
#[derive(Debug, Default)]
pub struct FixedUuids {
    queue: Mutex<VecDeque<String>>,
}

impl FixedUuids {
    pub fn new<I, S>(uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: Mutex::new(uuids.into_iter().map(Into::into).collect()),
        }
    }
}

impl UuidSource for FixedUuids {
    fn next_uuid(&self) -> String {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| RandomUuid.next_uuid())
    }
}

// ---------------------------------------------------------------------------
// Journal configuration
// ---------------------------------------------------------------------------

/// Key layout of one journal flavour plus its tunables.
///
/// The key names are part of the on-disk format.
#[derive(Clone)]
pub struct JournalConfig {
    csi_directory: String,
    csi_name_key_prefix: String,
    ceph_uuid_directory_prefix: String,
    csi_name_key: String,
    csi_image_key: String,
    csi_image_id_key: String,
    csi_journal_pool: String,
    /// Empty for the volume flavour.
    ceph_snap_source_key: String,
    encrypt_kms_key: String,
    encryption_type: String,
    owner_key: String,
    /// Empty for the snapshot flavour.
    backing_snapshot_id_key: String,
    common_prefix: String,
    namespace: String,

    volume_prefix: String,
    snapshot_prefix: String,
    list_excess: usize,
    max_uuid_attempts: u32,
    uuid_source: Arc<dyn UuidSource>,
}

impl fmt::Debug for JournalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalConfig")
            .field("csi_directory", &self.csi_directory)
            .field("csi_name_key_prefix", &self.csi_name_key_prefix)
            .field("namespace", &self.namespace)
            .field("list_excess", &self.list_excess)
            .field("max_uuid_attempts", &self.max_uuid_attempts)
            .finish_non_exhaustive()
    }
}

impl JournalConfig {
    fn base(csi_directory: String, prefix: &str, name_key: &str) -> Self {
        Self {
            csi_directory,
            csi_name_key_prefix: prefix.to_owned(),
            ceph_uuid_directory_prefix: prefix.to_owned(),
            csi_name_key: name_key.to_owned(),
            csi_image_key: "csi.imagename".into(),
            csi_image_id_key: "csi.imageid".into(),
            csi_journal_pool: "csi.journalpool".into(),
            ceph_snap_source_key: String::new(),
            encrypt_kms_key: "csi.volume.encryptKMS".into(),
            encryption_type: "csi.volume.encryptionType".into(),
            owner_key: "csi.volume.owner".into(),
            backing_snapshot_id_key: String::new(),
            common_prefix: "csi.".into(),
            namespace: String::new(),
            volume_prefix: DEFAULT_VOLUME_NAMING_PREFIX.into(),
            snapshot_prefix: DEFAULT_SNAPSHOT_NAMING_PREFIX.into(),
            list_excess: DEFAULT_LIST_EXCESS,
            max_uuid_attempts: DEFAULT_MAX_UUID_ATTEMPTS,
            uuid_source: Arc::new(RandomUuid),
        }
    }

    /// Volume journal with directory `csi.volumes.<suffix>`.
    pub fn new_volume_journal(suffix: &str) -> Self {
        let mut cfg = Self::base(format!("csi.volumes.{suffix}"), "csi.volume.", "csi.volname");
        cfg.backing_snapshot_id_key = "csi.volume.backingsnapshotid".into();
        cfg
    }

    /// Snapshot journal with directory `csi.snaps.<suffix>`.
    pub fn new_snapshot_journal(suffix: &str) -> Self {
        let mut cfg = Self::base(format!("csi.snaps.{suffix}"), "csi.snap.", "csi.snapname");
        cfg.ceph_snap_source_key = "csi.source".into();
        cfg
    }

    pub fn new_volume_journal_with_namespace(suffix: &str, namespace: &str) -> Self {
        let mut cfg = Self::new_volume_journal(suffix);
        cfg.namespace = namespace.to_owned();
        cfg
    }

    pub fn new_snapshot_journal_with_namespace(suffix: &str, namespace: &str) -> Self {
        let mut cfg = Self::new_snapshot_journal(suffix);
        cfg.namespace = namespace.to_owned();
        cfg
    }

    /// Volume journal for `settings.instance_id` with every tunable applied.
    pub fn volume_from_settings(settings: &JournalSettings) -> Self {
        Self::new_volume_journal_with_namespace(&settings.instance_id, &settings.namespace)
            .with_settings(settings)
    }

    /// Snapshot journal for `settings.instance_id` with every tunable applied.
    pub fn snapshot_from_settings(settings: &JournalSettings) -> Self {
        Self::new_snapshot_journal_with_namespace(&settings.instance_id, &settings.namespace)
            .with_settings(settings)
    }

    /// Apply naming prefixes, page slack and the retry ceiling.
    pub fn with_settings(mut self, settings: &JournalSettings) -> Self {
        self.volume_prefix = settings.vol_naming_prefix.clone();
        self.snapshot_prefix = settings.snap_naming_prefix.clone();
        self.list_excess = settings.list_excess;
        self.max_uuid_attempts = settings.max_uuid_attempts;
        self
    }

    pub fn with_uuid_source(mut self, source: Arc<dyn UuidSource>) -> Self {
        self.uuid_source = source;
        self
    }

    pub fn csi_directory(&self) -> &str {
        &self.csi_directory
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the per-UUID omap object for `uuid`.
    pub fn uuid_directory(&self, uuid: &str) -> String {
        format!("{}{uuid}", self.ceph_uuid_directory_prefix)
    }

    /// Directory key for a request name.
    pub fn name_key(&self, req_name: &str) -> String {
        format!("{}{req_name}", self.csi_name_key_prefix)
    }

    fn is_snapshot_flavour(&self) -> bool {
        !self.ceph_snap_source_key.is_empty()
    }

    /// Backend object name for `uuid`: `prefix + uuid`, with the flavour's
    /// default prefix when `prefix` is empty.
    pub fn get_name_for_uuid(&self, prefix: &str, uuid: &str, is_snapshot: bool) -> String {
        let prefix = match prefix {
            "" if is_snapshot => self.snapshot_prefix.as_str(),
            "" => self.volume_prefix.as_str(),
            p => p,
        };
        format!("{prefix}{uuid}")
    }

    /// Open a journal connection through `pool`.
    ///
    /// `namespace` replaces the namespace the config was built with, as the
    /// cluster config may place each cluster's journal in its own namespace.
    pub async fn connect(
        &self,
        pool: &Arc<ConnPool>,
        monitors: &str,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Connection> {
        let conn = pool
            .get(monitors, &credentials.id, &credentials.key_file)
            .await
            .map_err(|e| {
                JournalError::Backend(format!("failed to establish the connection: {e}"))
            })?;

        let mut config = self.clone();
        config.namespace = namespace.to_owned();
        debug!(%monitors, %namespace, directory = %config.csi_directory, "journal connected");

        Ok(Connection {
            config,
            monitors: monitors.to_owned(),
            credentials: credentials.clone(),
            pool: Arc::clone(pool),
            conn,
        })
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Everything the journal stores about one UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageAttributes {
    /// Back-pointer to the request name.
    pub request_name: String,
    /// Source volume, snapshot flavour only.
    pub source_name: String,
    pub image_name: String,
    pub kms_id: String,
    pub encryption_type: EncryptionType,
    /// Tenant owning the volume, used by tenant-scoped KMS.
    pub owner: String,
    pub image_id: String,
    /// [`crate::INVALID_POOL_ID`] unless the directory lives in another pool.
    pub journal_pool_id: i64,
    pub backing_snapshot_id: String,
}

/// Result of a successful [`Connection::check_reservation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub image_uuid: String,
    pub image_pool: String,
    /// [`crate::INVALID_POOL_ID`] when the image lives in the journal pool.
    pub image_pool_id: i64,
    pub image_attributes: ImageAttributes,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A journal bound to one cluster session.  Returns the session to its pool
/// when dropped.
pub struct Connection {
    config: JournalConfig,
    monitors: String,
    credentials: Credentials,
    pool: Arc<ConnPool>,
    conn: Arc<dyn Cluster>,
}

impl Connection {
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn monitors(&self) -> &str {
        &self.monitors
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The underlying cluster session.
    pub fn cluster(&self) -> &dyn Cluster {
        self.conn.as_ref()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("monitors", &self.monitors)
            .field("user", &self.credentials.id)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.pool.put(&self.conn);
    }
}
