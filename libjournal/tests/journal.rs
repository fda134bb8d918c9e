use std::sync::Arc;
use std::time::Duration;

use libjournal::encryption::{DEFAULT_ENCRYPTION_PASSPHRASE_SIZE, JournalDekStore};
use libjournal::journal::{CheckRequest, FixedUuids, ReserveRequest};
use libjournal::kms::secrets::SecretsMetadataKms;
use libjournal::rados::memory::{MemoryConnector, MemoryStore};
use libjournal::{
    ConnPool, Connection, Credentials, EncryptionType, JournalConfig, JournalError,
    VolumeEncryption,
};
use tokio_util::sync::CancellationToken;

const UUID_1: &str = "11111111-2222-3333-4444-555555555555";
const UUID_A: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
const MONITORS: &str = "mon1:6789";

struct Fixture {
    store: Arc<MemoryStore>,
    connector: Arc<MemoryConnector>,
    pool: Arc<ConnPool>,
    creds: Credentials,
    _keydir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let keydir = tempfile::tempdir().unwrap();
        let keyfile = keydir.path().join("keyfile");
        std::fs::write(&keyfile, "AQD0secret==").unwrap();

        let store = MemoryStore::new();
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&store)));
        let pool = Arc::new(ConnPool::new(
            connector.clone(),
            Duration::from_secs(60),
            Duration::from_secs(600),
        ));
        Self {
            store,
            connector,
            pool,
            creds: Credentials::new("csi-provisioner", keyfile),
            _keydir: keydir,
        }
    }

    async fn connect(&self, config: &JournalConfig) -> Connection {
        config
            .connect(&self.pool, MONITORS, "", &self.creds)
            .await
            .unwrap()
    }
}

fn volume_journal(uuids: &[&str]) -> JournalConfig {
    JournalConfig::new_volume_journal("default")
        .with_uuid_source(Arc::new(FixedUuids::new(uuids.iter().copied())))
}

fn same_pool_request<'a>(req_name: &'a str) -> ReserveRequest<'a> {
    ReserveRequest {
        journal_pool: "P",
        journal_pool_id: 7,
        image_pool: "P",
        image_pool_id: 7,
        req_name,
        ..Default::default()
    }
}

fn check<'a>(journal_pool: &'a str, req_name: &'a str) -> CheckRequest<'a> {
    CheckRequest {
        journal_pool,
        req_name,
        ..Default::default()
    }
}

#[tokio::test]
async fn fresh_then_idempotent_create() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1])).await;
    let cancel = CancellationToken::new();

    assert!(conn.check_reservation(&cancel, &check("P", "pvc-1")).await.unwrap().is_none());

    let res = conn.reserve_name(&cancel, &same_pool_request("pvc-1")).await.unwrap();
    assert_eq!(res.uuid, UUID_1);
    assert_eq!(res.image_name, format!("csi-vol-{UUID_1}"));

    let dir = fx.store.omap("P", "", "csi.volumes.default").unwrap();
    assert_eq!(dir["csi.volume.pvc-1"], UUID_1);
    let attrs = fx.store.omap("P", "", &format!("csi.volume.{UUID_1}")).unwrap();
    assert_eq!(attrs["csi.volname"], "pvc-1");
    assert_eq!(attrs["csi.imagename"], res.image_name);
    assert!(!attrs.contains_key("csi.journalpool"));

    // a retried CreateVolume finds the same reservation
    let data = conn.check_reservation(&cancel, &check("P", "pvc-1")).await.unwrap().unwrap();
    assert_eq!(data.image_uuid, UUID_1);
    assert_eq!(data.image_pool, "P");
    assert_eq!(data.image_pool_id, libjournal::INVALID_POOL_ID);
    assert_eq!(data.image_attributes.image_name, res.image_name);
    assert_eq!(data.image_attributes.request_name, "pvc-1");
}

#[tokio::test]
async fn dangling_directory_entry_is_collected() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1])).await;
    let cancel = CancellationToken::new();

    conn.reserve_name(&cancel, &same_pool_request("pvc-1")).await.unwrap();
    assert!(fx.store.remove_object("P", "", &format!("csi.volume.{UUID_1}")));

    assert!(conn.check_reservation(&cancel, &check("P", "pvc-1")).await.unwrap().is_none());
    let dir = fx.store.omap("P", "", "csi.volumes.default").unwrap();
    assert!(!dir.contains_key("csi.volume.pvc-1"));
}

#[tokio::test]
async fn cross_pool_reservation() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("J", 3);
    fx.store.create_pool_with_id("I", 9);
    let conn = fx.connect(&volume_journal(&[UUID_A])).await;
    let cancel = CancellationToken::new();

    let req = ReserveRequest {
        journal_pool: "J",
        journal_pool_id: 3,
        image_pool: "I",
        image_pool_id: 9,
        req_name: "pvc-2",
        ..Default::default()
    };
    let res = conn.reserve_name(&cancel, &req).await.unwrap();
    assert_eq!(res.uuid, UUID_A);

    let dir = fx.store.omap("J", "", "csi.volumes.default").unwrap();
    assert_eq!(dir["csi.volume.pvc-2"], format!("0000000000000009/{UUID_A}"));
    // attributes live next to the image
    let attrs = fx.store.omap("I", "", &format!("csi.volume.{UUID_A}")).unwrap();
    assert_eq!(attrs["csi.journalpool"], "0000000000000003");
    assert!(!fx.store.object_exists("J", "", &format!("csi.volume.{UUID_A}")));

    let data = conn.check_reservation(&cancel, &check("J", "pvc-2")).await.unwrap().unwrap();
    assert_eq!(data.image_pool, "I");
    assert_eq!(data.image_pool_id, 9);
    assert_eq!(data.image_attributes.journal_pool_id, 3);

    // the directory records the pool id, so a rename is transparent
    assert!(fx.store.rename_pool("I", "images"));
    let data = conn.check_reservation(&cancel, &check("J", "pvc-2")).await.unwrap().unwrap();
    assert_eq!(data.image_pool, "images");
    assert_eq!(data.image_uuid, UUID_A);
}

#[tokio::test]
async fn deleted_image_pool_is_collected() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("J", 3);
    fx.store.create_pool_with_id("I", 9);
    let conn = fx.connect(&volume_journal(&[UUID_A])).await;
    let cancel = CancellationToken::new();

    let req = ReserveRequest {
        journal_pool: "J",
        journal_pool_id: 3,
        image_pool: "I",
        image_pool_id: 9,
        req_name: "pvc-2",
        ..Default::default()
    };
    conn.reserve_name(&cancel, &req).await.unwrap();
    fx.store.delete_pool("I");

    assert!(conn.check_reservation(&cancel, &check("J", "pvc-2")).await.unwrap().is_none());
    let dir = fx.store.omap("J", "", "csi.volumes.default").unwrap();
    assert!(dir.is_empty());
}

#[tokio::test]
async fn snapshot_source_must_match() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let config = JournalConfig::new_snapshot_journal("default")
        .with_uuid_source(Arc::new(FixedUuids::new([UUID_1])));
    let conn = fx.connect(&config).await;
    let cancel = CancellationToken::new();

    let req = ReserveRequest {
        parent_name: "volA",
        ..same_pool_request("snap1")
    };
    let res = conn.reserve_name(&cancel, &req).await.unwrap();
    assert_eq!(res.image_name, format!("csi-snap-{UUID_1}"));
    let attrs = fx.store.omap("P", "", &format!("csi.snap.{UUID_1}")).unwrap();
    assert_eq!(attrs["csi.snapname"], "snap1");
    assert_eq!(attrs["csi.source"], "volA");

    let found = conn
        .check_reservation(
            &cancel,
            &CheckRequest {
                snap_parent_name: "volA",
                ..check("P", "snap1")
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.image_attributes.source_name, "volA");

    let err = conn
        .check_reservation(
            &cancel,
            &CheckRequest {
                snap_parent_name: "volB",
                ..check("P", "snap1")
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_snap_name_conflict(), "{err}");
}

#[tokio::test]
async fn volume_journal_rejects_snap_source() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[])).await;
    let cancel = CancellationToken::new();

    let req = ReserveRequest {
        parent_name: "volA",
        ..same_pool_request("pvc-1")
    };
    assert!(matches!(
        conn.reserve_name(&cancel, &req).await,
        Err(JournalError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn uuid_retries_are_bounded() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1; 5])).await;
    let cancel = CancellationToken::new();

    // occupy the only UUID the generator hands out
    let taken = ReserveRequest {
        vol_uuid: UUID_1,
        ..same_pool_request("pvc-0")
    };
    conn.reserve_name(&cancel, &taken).await.unwrap();

    let err = conn.reserve_name(&cancel, &same_pool_request("pvc-1")).await.unwrap_err();
    assert!(matches!(err, JournalError::UuidConflictRetriesExceeded));
    let dir = fx.store.omap("P", "", "csi.volumes.default").unwrap();
    assert!(!dir.contains_key("csi.volume.pvc-1"));

    // an explicit UUID gets exactly one attempt
    let again = ReserveRequest {
        vol_uuid: UUID_1,
        ..same_pool_request("pvc-2")
    };
    assert!(conn.reserve_name(&cancel, &again).await.unwrap_err().is_object_exists());
}

#[tokio::test]
async fn failed_attribute_write_rolls_back() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1])).await;
    let cancel = CancellationToken::new();

    fx.store.fail_next_set_omap(&format!("csi.volume.{UUID_1}"));
    assert!(conn.reserve_name(&cancel, &same_pool_request("pvc-1")).await.is_err());

    assert!(!fx.store.object_exists("P", "", &format!("csi.volume.{UUID_1}")));
    let dir = fx.store.omap("P", "", "csi.volumes.default").unwrap();
    assert!(!dir.contains_key("csi.volume.pvc-1"));
    assert!(conn.check_reservation(&cancel, &check("P", "pvc-1")).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_during_attribute_write_rolls_back() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1])).await;
    let cancel = CancellationToken::new();

    fx.store.cancel_next_set_omap(&format!("csi.volume.{UUID_1}"), cancel.clone());
    let err = conn.reserve_name(&cancel, &same_pool_request("pvc-1")).await.unwrap_err();
    assert!(matches!(err, JournalError::Cancelled));

    // the rollback ran even though the request token had fired
    assert!(!fx.store.object_exists("P", "", &format!("csi.volume.{UUID_1}")));
    let dir = fx.store.omap("P", "", "csi.volumes.default").unwrap();
    assert!(!dir.contains_key("csi.volume.pvc-1"));

    let fresh = CancellationToken::new();
    assert!(conn.check_reservation(&fresh, &check("P", "pvc-1")).await.unwrap().is_none());
}

#[tokio::test]
async fn mismatches_are_not_collected() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1])).await;
    let cancel = CancellationToken::new();

    let req = ReserveRequest {
        kms_config: "vault",
        encryption_type: EncryptionType::Block,
        owner: "tenant-a",
        ..same_pool_request("pvc-1")
    };
    conn.reserve_name(&cancel, &req).await.unwrap();

    let data = conn
        .check_reservation(
            &cancel,
            &CheckRequest {
                kms_config: "vault",
                encryption_type: EncryptionType::Block,
                ..check("P", "pvc-1")
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.image_attributes.owner, "tenant-a");
    assert_eq!(data.image_attributes.encryption_type, EncryptionType::Block);

    let err = conn
        .check_reservation(
            &cancel,
            &CheckRequest {
                kms_config: "other",
                ..check("P", "pvc-1")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JournalError::Corruption(_)));

    let err = conn
        .check_reservation(
            &cancel,
            &CheckRequest {
                encryption_type: EncryptionType::File,
                ..check("P", "pvc-1")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JournalError::Corruption(_)));

    // lose the back-pointer: the operator has to look at this one
    conn.remove_attribute(&cancel, "P", UUID_1, "volname").await.unwrap();
    let err = conn.check_reservation(&cancel, &check("P", "pvc-1")).await.unwrap_err();
    assert!(matches!(err, JournalError::Corruption(_)));
    assert!(fx.store.object_exists("P", "", &format!("csi.volume.{UUID_1}")));
}

#[tokio::test]
async fn undo_is_idempotent() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1])).await;
    let cancel = CancellationToken::new();

    let res = conn.reserve_name(&cancel, &same_pool_request("pvc-1")).await.unwrap();
    for _ in 0..2 {
        conn.undo_reservation(&cancel, "P", "P", &res.image_name, "pvc-1")
            .await
            .unwrap();
    }
    assert!(!fx.store.object_exists("P", "", &format!("csi.volume.{UUID_1}")));
    assert!(conn.check_reservation(&cancel, &check("P", "pvc-1")).await.unwrap().is_none());

    let err = conn
        .undo_reservation(&cancel, "P", "P", "short", "pvc-1")
        .await
        .unwrap_err();
    assert!(matches!(err, JournalError::InvalidArgument(_)));
}

#[tokio::test]
async fn attributes_and_handle_mapping() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1])).await;
    let cancel = CancellationToken::new();

    conn.reserve_name(&cancel, &same_pool_request("pvc-1")).await.unwrap();
    conn.store_image_id(&cancel, "P", UUID_1, "10ab3c").await.unwrap();
    conn.reset_volume_owner(&cancel, "P", UUID_1, "tenant-b").await.unwrap();
    let attrs = conn.get_image_attributes(&cancel, "P", UUID_1, false).await.unwrap();
    assert_eq!(attrs.image_id, "10ab3c");
    assert_eq!(attrs.owner, "tenant-b");

    conn.store_attribute(&cancel, "P", UUID_1, "custom", "v").await.unwrap();
    assert_eq!(conn.fetch_attribute(&cancel, "P", UUID_1, "custom").await.unwrap(), "v");
    conn.remove_attribute(&cancel, "P", UUID_1, "custom").await.unwrap();
    assert!(
        conn.fetch_attribute(&cancel, "P", UUID_1, "custom")
            .await
            .unwrap_err()
            .is_key_not_found()
    );

    let old = "0001-0006-site-a-0000000000000002-11111111-2222-3333-4444-555555555555";
    let new = "0001-0006-site-b-0000000000000007-11111111-2222-3333-4444-555555555555";
    assert_eq!(conn.check_new_uuid_mapping(&cancel, "P", old).await.unwrap(), None);
    conn.reserve_new_uuid_mapping(&cancel, "P", old, new).await.unwrap();
    assert_eq!(
        conn.check_new_uuid_mapping(&cancel, "P", old).await.unwrap().as_deref(),
        Some(new)
    );
}

#[tokio::test]
async fn metadata_dek_lives_in_the_journal() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = Arc::new(fx.connect(&volume_journal(&[UUID_1])).await);
    let cancel = CancellationToken::new();

    let req = ReserveRequest {
        kms_config: "secrets-metadata",
        encryption_type: EncryptionType::Block,
        ..same_pool_request("pvc-1")
    };
    let res = conn.reserve_name(&cancel, &req).await.unwrap();

    let mut ve = VolumeEncryption::new(
        "secrets-metadata",
        Arc::new(SecretsMetadataKms::new("secrets-metadata", "cluster-passphrase")),
    )
    .unwrap();
    assert!(ve.needs_dek_store());
    ve.set_dek_store(Arc::new(JournalDekStore::new(Arc::clone(&conn), "P", UUID_1)));

    ve.store_new_crypto_passphrase(&cancel, &res.image_name, DEFAULT_ENCRYPTION_PASSPHRASE_SIZE)
        .await
        .unwrap();
    let attrs = fx.store.omap("P", "", &format!("csi.volume.{UUID_1}")).unwrap();
    let stored: serde_json::Value = serde_json::from_str(&attrs["csi.volume.dek"]).unwrap();
    assert!(stored["nonce"].is_string());

    let passphrase = ve.get_crypto_passphrase(&cancel, &res.image_name).await.unwrap();
    assert_eq!(passphrase.len(), 28);
    assert_eq!(
        ve.get_crypto_passphrase(&cancel, &res.image_name).await.unwrap(),
        passphrase
    );

    ve.remove_dek(&cancel, &res.image_name).await.unwrap();
    assert!(ve.get_crypto_passphrase(&cancel, &res.image_name).await.is_err());
}

#[tokio::test]
async fn connections_are_pooled() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let config = volume_journal(&[]);

    let first = fx.connect(&config).await;
    let second = fx.connect(&config).await;
    assert_eq!(fx.connector.connects(), 1);
    assert_eq!(fx.pool.len(), 1);
    drop(first);
    drop(second);
    // released sessions stay pooled until they expire
    assert_eq!(fx.pool.len(), 1);

    let _third = fx.connect(&config).await;
    assert_eq!(fx.connector.connects(), 1);
}

#[tokio::test]
async fn cancelled_requests_fail_fast() {
    let fx = Fixture::new();
    fx.store.create_pool_with_id("P", 7);
    let conn = fx.connect(&volume_journal(&[UUID_1])).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = conn.reserve_name(&cancel, &same_pool_request("pvc-1")).await.unwrap_err();
    assert!(matches!(err, JournalError::Cancelled));
    assert!(!fx.store.object_exists("P", "", &format!("csi.volume.{UUID_1}")));
}
