//! Reservation state machine: check, reserve and undo.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::{Connection, ImageData};
use crate::error::{JournalError, Result};
use crate::omap::{self, ObjectRef, with_cancel};
use crate::rados::RadosError;
use crate::types::{
    EncryptionType, INVALID_POOL_ID, UUID_ENCODED_LENGTH, decode_pool_id, encode_pool_id,
};

/// Inputs of [`Connection::check_reservation`].
#[derive(Debug, Clone, Default)]
pub struct CheckRequest<'a> {
    /// Pool holding the directory.
    pub journal_pool: &'a str,
    pub req_name: &'a str,
    /// Backend object name prefix, empty for the default.
    pub name_prefix: &'a str,
    /// Source volume, snapshot flavour only.
    pub snap_parent_name: &'a str,
    /// Expected KMS id, empty to skip the check.
    pub kms_config: &'a str,
    /// Expected encryption type, [`EncryptionType::None`] to skip the check.
    pub encryption_type: EncryptionType,
}

/// Inputs of [`Connection::reserve_name`].
#[derive(Debug, Clone, Default)]
pub struct ReserveRequest<'a> {
    pub journal_pool: &'a str,
    pub journal_pool_id: i64,
    /// Pool the backend object will be created in.
    pub image_pool: &'a str,
    pub image_pool_id: i64,
    pub req_name: &'a str,
    pub name_prefix: &'a str,
    /// Source volume, snapshot flavour only.
    pub parent_name: &'a str,
    pub kms_config: &'a str,
    /// Reserve exactly this UUID instead of generating one.
    pub vol_uuid: &'a str,
    pub owner: &'a str,
    /// Snapshot a snapshot-backed volume is based on.
    pub backing_snapshot_id: &'a str,
    pub encryption_type: EncryptionType,
}

/// UUID and backend object name granted by [`Connection::reserve_name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub uuid: String,
    pub image_name: String,
}

impl Connection {
    fn check_snap_source(&self, parent: &str) -> Result<bool> {
        if parent.is_empty() {
            return Ok(false);
        }
        if !self.config.is_snapshot_flavour() {
            return Err(JournalError::InvalidArgument(
                "invalid request, cephSnapSourceKey is nil".into(),
            ));
        }
        Ok(true)
    }

    /// Look up an existing reservation for `req.req_name`.
    ///
    /// Returns `Ok(None)` when there is none, including when a stale partial
    /// reservation was found and garbage collected.  Mismatches between the
    /// stored attributes and the request are errors and are left in place
    /// for an operator.
    #[instrument(skip(self, cancel, req), fields(
        pool = %req.journal_pool,
        req_name = %req.req_name,
        directory = %self.config.csi_directory,
    ))]
    pub async fn check_reservation(
        &self,
        cancel: &CancellationToken,
        req: &CheckRequest<'_>,
    ) -> Result<Option<ImageData>> {
        let cj = &self.config;
        let snap_source = self.check_snap_source(req.snap_parent_name)?;

        let name_key = cj.name_key(req.req_name);
        let dir = ObjectRef::new(req.journal_pool, &cj.namespace, &cj.csi_directory);
        let values = match omap::get_omap_values(
            self.cluster(),
            cancel,
            dir,
            &cj.common_prefix,
            std::slice::from_ref(&name_key),
            cj.list_excess,
        )
        .await
        {
            Ok(values) => values,
            // pool or directory absent: nothing was ever reserved here
            Err(e) if e.is_key_not_found() || e.is_pool_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(uuid_and_pool) = values.get(&name_key) else {
            return Ok(None);
        };

        let (obj_uuid, saved_image_pool, saved_image_pool_id) =
            if uuid_and_pool.len() == UUID_ENCODED_LENGTH {
                (
                    uuid_and_pool.clone(),
                    req.journal_pool.to_owned(),
                    INVALID_POOL_ID,
                )
            } else {
                let Some((pool_hex, obj_uuid)) = uuid_and_pool.split_once('/') else {
                    return Err(JournalError::Corruption(format!(
                        "malformed directory value {uuid_and_pool:?} for request name ({})",
                        req.req_name
                    )));
                };
                let pool_id = decode_pool_id(pool_hex)?;
                match with_cancel(cancel, self.cluster().pool_name(pool_id)).await? {
                    Ok(pool) => (obj_uuid.to_owned(), pool, pool_id),
                    Err(RadosError::NotFound(_)) => {
                        warn!(pool_id, "image pool of reservation is gone, removing stale entry");
                        self.undo_reservation(
                            &CancellationToken::new(),
                            req.journal_pool,
                            "",
                            "",
                            req.req_name,
                        )
                        .await?;
                        return Ok(None);
                    }
                    Err(e) => return Err(JournalError::backend(e)),
                }
            };

        let attrs = match self
            .get_image_attributes(cancel, &saved_image_pool, &obj_uuid, snap_source)
            .await
        {
            Ok(attrs) => attrs,
            Err(e) if e.is_key_not_found() => {
                // per-UUID object missing: the directory entry is dangling
                warn!(uuid = %obj_uuid, error = %e, "dangling reservation, removing it");
                let image_name = cj.get_name_for_uuid(req.name_prefix, &obj_uuid, snap_source);
                self.undo_reservation(
                    &CancellationToken::new(),
                    req.journal_pool,
                    &saved_image_pool,
                    &image_name,
                    req.req_name,
                )
                .await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if attrs.request_name != req.req_name {
            if attrs.request_name.is_empty() {
                error!(
                    uuid = %obj_uuid,
                    "per-UUID omap has no request name, reservation was interrupted before its attributes were written"
                );
                return Err(JournalError::Corruption(format!(
                    "omap names mismatch, request name ({}) volume UUID ({obj_uuid}) has no \
                     stored request name; remove {} from pool {saved_image_pool} and key {name_key} \
                     from {} to recover",
                    req.req_name,
                    cj.uuid_directory(&obj_uuid),
                    cj.csi_directory,
                )));
            }
            error!(uuid = %obj_uuid, stored = %attrs.request_name, "omap names mismatch");
            return Err(JournalError::Corruption(format!(
                "omap names mismatch, request name ({}) volume UUID ({obj_uuid}) volume omap name ({})",
                req.req_name, attrs.request_name
            )));
        }

        if !req.kms_config.is_empty() && attrs.kms_id != req.kms_config {
            return Err(JournalError::Corruption(format!(
                "omap encryption KMS mismatch, request KMS ({}) volume UUID ({obj_uuid}) volume omap KMS ({})",
                req.kms_config, attrs.kms_id
            )));
        }

        if req.encryption_type != EncryptionType::None
            && attrs.encryption_type != req.encryption_type
        {
            return Err(JournalError::Corruption(format!(
                "omap encryption type mismatch, request type {:?} volume UUID ({obj_uuid}) volume omap encryption type {:?}",
                req.encryption_type.as_str(),
                attrs.encryption_type.as_str()
            )));
        }

        if snap_source && attrs.source_name != req.snap_parent_name {
            return Err(JournalError::SnapNameConflict(format!(
                "snapname points to different volume, request name ({}) source name ({}) : saved source name ({})",
                req.req_name, req.snap_parent_name, attrs.source_name
            )));
        }

        debug!(uuid = %obj_uuid, pool = %saved_image_pool, "found existing reservation");
        Ok(Some(ImageData {
            image_uuid: obj_uuid,
            image_pool: saved_image_pool,
            image_pool_id: saved_image_pool_id,
            image_attributes: attrs,
        }))
    }

    /// Remove a reservation, in the reverse order of [`Connection::reserve_name`].
    ///
    /// `csi_journal_pool` holds the directory and `vol_journal_pool` the
    /// per-UUID object.  With an empty `vol_name` only the directory entry
    /// is removed.  Missing objects and keys are not errors.  The backend
    /// object must already be gone.
    #[instrument(skip(self, cancel), fields(directory = %self.config.csi_directory))]
    pub async fn undo_reservation(
        &self,
        cancel: &CancellationToken,
        csi_journal_pool: &str,
        vol_journal_pool: &str,
        vol_name: &str,
        req_name: &str,
    ) -> Result<()> {
        let cj = &self.config;

        if !vol_name.is_empty() {
            let image_uuid = vol_name
                .len()
                .checked_sub(UUID_ENCODED_LENGTH)
                .and_then(|start| vol_name.get(start..))
                .ok_or_else(|| {
                    JournalError::InvalidArgument(format!(
                        "unable to parse UUID from {vol_name}, too short"
                    ))
                })?;
            Uuid::parse_str(image_uuid).map_err(|e| {
                JournalError::InvalidArgument(format!("failed parsing UUID in {vol_name}: {e}"))
            })?;

            let oid = cj.uuid_directory(image_uuid);
            let obj = ObjectRef::new(vol_journal_pool, &cj.namespace, &oid);
            match omap::remove_object(self.cluster(), cancel, obj).await {
                Ok(()) => {}
                Err(e) if e.is_object_not_found() => {
                    debug!(%obj, "per-UUID omap already removed");
                }
                Err(e) => {
                    error!(%obj, error = %e, "failed removing omap");
                    return Err(e);
                }
            }
        }

        let name_key = cj.name_key(req_name);
        let dir = ObjectRef::new(csi_journal_pool, &cj.namespace, &cj.csi_directory);
        let keys = std::slice::from_ref(&name_key);
        if let Err(e) = omap::remove_map_keys(self.cluster(), cancel, dir, keys).await {
            error!(key = %name_key, error = %e, "failed removing omap key");
            return Err(e);
        }
        Ok(())
    }

    /// Exclusively create the per-UUID object for a new reservation.
    ///
    /// With a caller-chosen `vol_uuid` there is exactly one attempt.
    /// Otherwise fresh UUIDs are tried until one is free or the retry
    /// ceiling is hit.
    async fn reserve_omap_name(
        &self,
        cancel: &CancellationToken,
        pool: &str,
        vol_uuid: &str,
    ) -> Result<String> {
        let cj = &self.config;

        if !vol_uuid.is_empty() {
            let oid = cj.uuid_directory(vol_uuid);
            omap::create_object(
                self.cluster(),
                cancel,
                ObjectRef::new(pool, &cj.namespace, &oid),
            )
            .await?;
            return Ok(vol_uuid.to_owned());
        }

        let max_attempts = cj.max_uuid_attempts;
        for attempt in 1..=max_attempts {
            let candidate = cj.uuid_source.next_uuid();
            let oid = cj.uuid_directory(&candidate);
            match omap::create_object(
                self.cluster(),
                cancel,
                ObjectRef::new(pool, &cj.namespace, &oid),
            )
            .await
            {
                Ok(()) => return Ok(candidate),
                Err(e) if e.is_object_exists() => {
                    debug!(
                        uuid = %candidate,
                        attempt,
                        max_attempts,
                        "uuid conflict detected, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(JournalError::UuidConflictRetriesExceeded)
    }

    /// Reserve a UUID for `req.req_name`.
    ///
    /// Creates the per-UUID object, publishes the directory entry and then
    /// writes the attributes.  If the attributes cannot be written the
    /// reservation is rolled back.
    #[instrument(skip(self, cancel, req), fields(
        journal_pool = %req.journal_pool,
        image_pool = %req.image_pool,
        req_name = %req.req_name,
        directory = %self.config.csi_directory,
    ))]
    pub async fn reserve_name(
        &self,
        cancel: &CancellationToken,
        req: &ReserveRequest<'_>,
    ) -> Result<Reservation> {
        let cj = &self.config;
        let snap_source = self.check_snap_source(req.parent_name)?;

        let vol_uuid = if req.vol_uuid.is_empty() {
            String::new()
        } else {
            Uuid::parse_str(req.vol_uuid)
                .map_err(|e| {
                    JournalError::InvalidArgument(format!(
                        "invalid volume UUID {:?}: {e}",
                        req.vol_uuid
                    ))
                })?
                .to_string()
        };

        // a crash after this point and before the directory write leaks the
        // per-UUID object
        let uuid = self
            .reserve_omap_name(cancel, req.image_pool, &vol_uuid)
            .await?;
        let image_name = cj.get_name_for_uuid(req.name_prefix, &uuid, snap_source);

        let name_key_val =
            if req.journal_pool != req.image_pool && req.image_pool_id != INVALID_POOL_ID {
                format!("{}/{uuid}", encode_pool_id(req.image_pool_id))
            } else {
                uuid.clone()
            };

        let dir = ObjectRef::new(req.journal_pool, &cj.namespace, &cj.csi_directory);
        omap::set_omap_keys(
            self.cluster(),
            cancel,
            dir,
            &BTreeMap::from([(cj.name_key(req.req_name), name_key_val)]),
        )
        .await?;

        let mut values = BTreeMap::new();
        values.insert(cj.csi_name_key.clone(), req.req_name.to_owned());
        values.insert(cj.csi_image_key.clone(), image_name.clone());
        if !req.kms_config.is_empty() {
            values.insert(cj.encrypt_kms_key.clone(), req.kms_config.to_owned());
            values.insert(
                cj.encryption_type.clone(),
                req.encryption_type.as_str().to_owned(),
            );
        }
        if !req.owner.is_empty() {
            values.insert(cj.owner_key.clone(), req.owner.to_owned());
        }
        if req.journal_pool != req.image_pool && req.journal_pool_id != INVALID_POOL_ID {
            // store the id, not the name, so pool renames do not break it
            values.insert(
                cj.csi_journal_pool.clone(),
                encode_pool_id(req.journal_pool_id),
            );
        }
        if snap_source {
            values.insert(cj.ceph_snap_source_key.clone(), req.parent_name.to_owned());
        }
        if !req.backing_snapshot_id.is_empty() && !cj.backing_snapshot_id_key.is_empty() {
            values.insert(
                cj.backing_snapshot_id_key.clone(),
                req.backing_snapshot_id.to_owned(),
            );
        }

        let oid = cj.uuid_directory(&uuid);
        let obj = ObjectRef::new(req.image_pool, &cj.namespace, &oid);
        if let Err(e) = omap::set_omap_keys(self.cluster(), cancel, obj, &values).await {
            warn!(error = %e, "reservation failed for volume, rolling back");
            // runs even when the request token has fired
            if let Err(undo) = self
                .undo_reservation(
                    &CancellationToken::new(),
                    req.journal_pool,
                    req.image_pool,
                    &image_name,
                    req.req_name,
                )
                .await
            {
                warn!(error = %undo, "failed undoing reservation of volume");
            }
            return Err(e);
        }

        debug!(%uuid, %image_name, "reserved name");
        Ok(Reservation { uuid, image_name })
    }
}
