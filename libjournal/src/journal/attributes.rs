//! Per-UUID attribute access and volume-handle remapping.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{Connection, ImageAttributes};
use crate::error::{JournalError, Result};
use crate::omap::{self, ObjectRef};
use crate::types::{EncryptionType, INVALID_POOL_ID, decode_pool_id};

impl Connection {
    fn uuid_object<'a>(&'a self, pool: &'a str, oid: &'a str) -> ObjectRef<'a> {
        ObjectRef::new(pool, &self.config.namespace, oid)
    }

    async fn set_uuid_keys(
        &self,
        cancel: &CancellationToken,
        pool: &str,
        uuid: &str,
        pairs: BTreeMap<String, String>,
    ) -> Result<()> {
        let oid = self.config.uuid_directory(uuid);
        omap::set_omap_keys(self.cluster(), cancel, self.uuid_object(pool, &oid), &pairs).await
    }

    /// Read every stored attribute of `uuid` in one round trip.
    ///
    /// Individually missing keys get defaults: the image name falls back to
    /// the default prefix plus the UUID and the journal pool id to
    /// [`INVALID_POOL_ID`].  A missing per-UUID object is
    /// [`JournalError::KeyNotFound`], as is a snapshot without a source.
    #[instrument(skip(self, cancel), fields(directory = %self.config.csi_directory))]
    pub async fn get_image_attributes(
        &self,
        cancel: &CancellationToken,
        pool: &str,
        object_uuid: &str,
        snap_source: bool,
    ) -> Result<ImageAttributes> {
        let cj = &self.config;
        if snap_source && !cj.is_snapshot_flavour() {
            return Err(JournalError::InvalidArgument(
                "invalid request, cephSnapSourceKey is nil".into(),
            ));
        }

        let fetch_keys: Vec<String> = [
            &cj.csi_name_key,
            &cj.csi_image_key,
            &cj.encrypt_kms_key,
            &cj.encryption_type,
            &cj.csi_journal_pool,
            &cj.ceph_snap_source_key,
            &cj.csi_image_id_key,
            &cj.owner_key,
            &cj.backing_snapshot_id_key,
        ]
        .into_iter()
        .filter(|k| !k.is_empty())
        .cloned()
        .collect();

        let oid = cj.uuid_directory(object_uuid);
        let mut values = omap::get_omap_values(
            self.cluster(),
            cancel,
            self.uuid_object(pool, &oid),
            &cj.common_prefix,
            &fetch_keys,
            cj.list_excess,
        )
        .await?;
        let mut attrs = ImageAttributes {
            request_name: values.remove(&cj.csi_name_key).unwrap_or_default(),
            kms_id: values.remove(&cj.encrypt_kms_key).unwrap_or_default(),
            encryption_type: EncryptionType::parse(
                values.remove(&cj.encryption_type).as_deref().unwrap_or_default(),
            ),
            owner: values.remove(&cj.owner_key).unwrap_or_default(),
            image_id: values.remove(&cj.csi_image_id_key).unwrap_or_default(),
            backing_snapshot_id: values.remove(&cj.backing_snapshot_id_key).unwrap_or_default(),
            // older volumes predate the image name key
            image_name: values
                .remove(&cj.csi_image_key)
                .unwrap_or_else(|| cj.get_name_for_uuid("", object_uuid, snap_source)),
            journal_pool_id: INVALID_POOL_ID,
            source_name: String::new(),
        };

        if let Some(encoded) = values.remove(&cj.csi_journal_pool) {
            attrs.journal_pool_id = decode_pool_id(&encoded)?;
        }

        if snap_source {
            attrs.source_name = values.remove(&cj.ceph_snap_source_key).ok_or_else(|| {
                JournalError::KeyNotFound(format!("no snap source in omap for {oid:?}"))
            })?;
        }

        Ok(attrs)
    }

    /// Record the backend-assigned image id once the image exists.
    pub async fn store_image_id(
        &self,
        cancel: &CancellationToken,
        pool: &str,
        reserved_uuid: &str,
        image_id: &str,
    ) -> Result<()> {
        let pairs = BTreeMap::from([(self.config.csi_image_id_key.clone(), image_id.to_owned())]);
        self.set_uuid_keys(cancel, pool, reserved_uuid, pairs).await
    }

    /// Store `value` under `csi.<attribute>` in the per-UUID omap.
    pub async fn store_attribute(
        &self,
        cancel: &CancellationToken,
        pool: &str,
        reserved_uuid: &str,
        attribute: &str,
        value: &str,
    ) -> Result<()> {
        let key = format!("{}{attribute}", self.config.common_prefix);
        let pairs = BTreeMap::from([(key.clone(), value.to_owned())]);
        self.set_uuid_keys(cancel, pool, reserved_uuid, pairs)
            .await
            .map_err(|e| JournalError::Backend(format!("failed to set key {key:?}: {e}")))
    }

    /// Read `csi.<attribute>` from the per-UUID omap.  A missing key is
    /// [`JournalError::KeyNotFound`].
    pub async fn fetch_attribute(
        &self,
        cancel: &CancellationToken,
        pool: &str,
        reserved_uuid: &str,
        attribute: &str,
    ) -> Result<String> {
        let cj = &self.config;
        let key = format!("{}{attribute}", cj.common_prefix);
        let oid = cj.uuid_directory(reserved_uuid);
        let mut values = omap::get_omap_values(
            self.cluster(),
            cancel,
            self.uuid_object(pool, &oid),
            &cj.common_prefix,
            std::slice::from_ref(&key),
            cj.list_excess,
        )
        .await?;
        values.remove(&key).ok_or_else(|| {
            JournalError::KeyNotFound(format!("failed to find key {key:?} in {oid}"))
        })
    }

    /// Remove `csi.<attribute>` from the per-UUID omap.
    pub async fn remove_attribute(
        &self,
        cancel: &CancellationToken,
        pool: &str,
        reserved_uuid: &str,
        attribute: &str,
    ) -> Result<()> {
        let cj = &self.config;
        let key = format!("{}{attribute}", cj.common_prefix);
        let oid = cj.uuid_directory(reserved_uuid);
        omap::remove_map_keys(self.cluster(), cancel, self.uuid_object(pool, &oid), &[key]).await
    }

    /// Replace the stored owner.
    pub async fn reset_volume_owner(
        &self,
        cancel: &CancellationToken,
        pool: &str,
        reserved_uuid: &str,
        owner: &str,
    ) -> Result<()> {
        let pairs = BTreeMap::from([(self.config.owner_key.clone(), owner.to_owned())]);
        self.set_uuid_keys(cancel, pool, reserved_uuid, pairs).await
    }

    /// The volume handle that replaced `volume_handle` on this site, if
    /// any.  Used after a mirrored failover where pool ids differ.
    pub async fn check_new_uuid_mapping(
        &self,
        cancel: &CancellationToken,
        journal_pool: &str,
        volume_handle: &str,
    ) -> Result<Option<String>> {
        let cj = &self.config;
        let key = cj.name_key(volume_handle);
        let dir = ObjectRef::new(journal_pool, &cj.namespace, &cj.csi_directory);
        match omap::get_omap_values(
            self.cluster(),
            cancel,
            dir,
            &cj.common_prefix,
            std::slice::from_ref(&key),
            cj.list_excess,
        )
        .await
        {
            Ok(mut values) => Ok(values.remove(&key)),
            Err(e) if e.is_key_not_found() || e.is_pool_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Record that `old_volume_handle` is served as `new_volume_handle`.
    pub async fn reserve_new_uuid_mapping(
        &self,
        cancel: &CancellationToken,
        journal_pool: &str,
        old_volume_handle: &str,
        new_volume_handle: &str,
    ) -> Result<()> {
        let cj = &self.config;
        let dir = ObjectRef::new(journal_pool, &cj.namespace, &cj.csi_directory);
        let pairs = BTreeMap::from([(
            cj.name_key(old_volume_handle),
            new_volume_handle.to_owned(),
        )]);
        omap::set_omap_keys(self.cluster(), cancel, dir, &pairs).await?;
        debug!(old = %old_volume_handle, new = %new_volume_handle, "volume handle mapping stored");
        Ok(())
    }
}
