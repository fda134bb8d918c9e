//! Volume encryption glue between a KMS and a DEK store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{JournalError, Result};
use crate::journal::Connection;
use crate::kms::{DEFAULT_KMS_TYPE, DekStore, DekStoreType, EncryptionKms};
use crate::types::EncryptionType;

/// Random bytes in a generated passphrase, before encoding.
pub const DEFAULT_ENCRYPTION_PASSPHRASE_SIZE: usize = 20;

/// Journal attribute holding a volume's encrypted DEK.
pub const DEK_ATTRIBUTE: &str = "volume.dek";

const ENCRYPTION_TYPE_OPTION: &str = "encryptionType";

/// A KMS together with the store its DEKs live in.
pub struct VolumeEncryption {
    kms: Arc<dyn EncryptionKms>,
    dek_store: Option<Arc<dyn DekStore>>,
    id: String,
}

impl fmt::Debug for VolumeEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeEncryption")
            .field("id", &self.id)
            .field("kms", &self.kms.id())
            .field("has_dek_store", &self.dek_store.is_some())
            .finish()
    }
}

impl VolumeEncryption {
    /// Wrap `kms`.  An empty `id` means the default KMS.
    ///
    /// Integrated KMS are their own DEK store.  For metadata-mode KMS the
    /// value is usable but [`VolumeEncryption::needs_dek_store`] stays true
    /// until [`VolumeEncryption::set_dek_store`] is called.
    pub fn new(id: &str, kms: Arc<dyn EncryptionKms>) -> Result<Self> {
        let id = if id.is_empty() { DEFAULT_KMS_TYPE } else { id }.to_owned();

        let dek_store = match kms.requires_dek_store() {
            DekStoreType::Integrated => Some(Arc::clone(&kms).as_dek_store().ok_or_else(|| {
                JournalError::Kms(format!(
                    "KMS {:?} does not implement the DEKStore interface",
                    kms.id()
                ))
            })?),
            DekStoreType::Metadata => None,
        };

        Ok(Self { kms, dek_store, id })
    }

    /// True until a DEK store has been attached.
    pub fn needs_dek_store(&self) -> bool {
        self.dek_store.is_none()
    }

    pub fn set_dek_store(&mut self, dek_store: Arc<dyn DekStore>) {
        self.dek_store = Some(dek_store);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kms(&self) -> &Arc<dyn EncryptionKms> {
        &self.kms
    }

    pub fn destroy(&self) {
        self.kms.destroy();
    }

    fn dek_store(&self) -> Result<&Arc<dyn DekStore>> {
        self.dek_store.as_ref().ok_or(JournalError::DekStoreNotFound)
    }

    /// Encrypt `passphrase` with the KMS and save it in the DEK store.
    #[instrument(skip(self, cancel, passphrase), fields(kms = %self.id))]
    pub async fn store_crypto_passphrase(
        &self,
        cancel: &CancellationToken,
        volume_id: &str,
        passphrase: &str,
    ) -> Result<()> {
        let store = self.dek_store()?;
        let encrypted = self.kms.encrypt_dek(volume_id, passphrase).await.map_err(|e| {
            JournalError::Kms(format!("failed encrypt the passphrase for {volume_id}: {e}"))
        })?;
        store
            .store_dek(cancel, volume_id, &encrypted)
            .await
            .map_err(|e| {
                JournalError::Kms(format!("failed to save the passphrase for {volume_id}: {e}"))
            })?;
        debug!("passphrase stored");
        Ok(())
    }

    /// Generate a passphrase of `length` random bytes and store it.
    pub async fn store_new_crypto_passphrase(
        &self,
        cancel: &CancellationToken,
        volume_id: &str,
        length: usize,
    ) -> Result<()> {
        let passphrase = generate_new_encryption_passphrase(length);
        self.store_crypto_passphrase(cancel, volume_id, &passphrase)
            .await
    }

    /// Fetch and decrypt the passphrase of `volume_id`.
    pub async fn get_crypto_passphrase(
        &self,
        cancel: &CancellationToken,
        volume_id: &str,
    ) -> Result<String> {
        let encrypted = self.dek_store()?.fetch_dek(cancel, volume_id).await?;
        self.kms.decrypt_dek(volume_id, &encrypted).await
    }

    pub async fn remove_dek(&self, cancel: &CancellationToken, volume_id: &str) -> Result<()> {
        self.dek_store()?.remove_dek(cancel, volume_id).await
    }
}

/// URL-safe base64 of `length` random bytes.
pub fn generate_new_encryption_passphrase(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

/// The KMS id to use when the `encrypted` option is `"true"`, else `None`.
pub fn fetch_encryption_kms_id(encrypted: &str, kms_id: &str) -> Result<Option<String>> {
    let is_encrypted = parse_bool(encrypted).ok_or_else(|| {
        JournalError::InvalidArgument(format!(
            "invalid value set in 'encrypted': {encrypted} (should be \"true\" or \"false\")"
        ))
    })?;
    if !is_encrypted {
        return Ok(None);
    }
    Ok(Some(if kms_id.is_empty() {
        DEFAULT_KMS_TYPE.to_owned()
    } else {
        kms_id.to_owned()
    }))
}

// accepts the same spellings as Go's strconv.ParseBool
fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// `encryptionType` from the volume options.  Absent means `fallback`;
/// present but empty is [`EncryptionType::Invalid`].
pub fn fetch_encryption_type(
    options: &HashMap<String, String>,
    fallback: EncryptionType,
) -> EncryptionType {
    match options.get(ENCRYPTION_TYPE_OPTION).map(String::as_str) {
        None => fallback,
        Some("") => EncryptionType::Invalid,
        Some(value) => EncryptionType::parse(value),
    }
}

// ---------------------------------------------------------------------------
// Journal-backed DEK store
// ---------------------------------------------------------------------------

/// Keeps the encrypted DEK of one reserved volume in its per-UUID omap.
#[derive(Debug)]
pub struct JournalDekStore {
    conn: Arc<Connection>,
    pool: String,
    reserved_uuid: String,
}

impl JournalDekStore {
    pub fn new(
        conn: Arc<Connection>,
        pool: impl Into<String>,
        reserved_uuid: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            pool: pool.into(),
            reserved_uuid: reserved_uuid.into(),
        }
    }
}

// The store is bound to one reservation; the volume id only salts the KMS.
#[async_trait]
impl DekStore for JournalDekStore {
    async fn store_dek(
        &self,
        cancel: &CancellationToken,
        _volume_id: &str,
        dek: &str,
    ) -> Result<()> {
        self.conn
            .store_attribute(cancel, &self.pool, &self.reserved_uuid, DEK_ATTRIBUTE, dek)
            .await
    }

    async fn fetch_dek(&self, cancel: &CancellationToken, _volume_id: &str) -> Result<String> {
        self.conn
            .fetch_attribute(cancel, &self.pool, &self.reserved_uuid, DEK_ATTRIBUTE)
            .await
    }

    async fn remove_dek(&self, cancel: &CancellationToken, _volume_id: &str) -> Result<()> {
        self.conn
            .remove_attribute(cancel, &self.pool, &self.reserved_uuid, DEK_ATTRIBUTE)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::secrets::{SecretsKms, SecretsMetadataKms};

    #[test]
    fn kms_id_from_options() {
        assert_eq!(fetch_encryption_kms_id("false", "vault").unwrap(), None);
        assert_eq!(
            fetch_encryption_kms_id("true", "").unwrap().as_deref(),
            Some("default")
        );
        assert_eq!(
            fetch_encryption_kms_id("True", "vault").unwrap().as_deref(),
            Some("vault")
        );
        let err = fetch_encryption_kms_id("yes", "").unwrap_err();
        assert!(err.to_string().contains("invalid value set in 'encrypted': yes"));
    }

    #[test]
    fn encryption_type_from_options() {
        let mut opts = HashMap::new();
        assert_eq!(fetch_encryption_type(&opts, EncryptionType::Block), EncryptionType::Block);
        opts.insert("encryptionType".to_owned(), String::new());
        assert_eq!(fetch_encryption_type(&opts, EncryptionType::Block), EncryptionType::Invalid);
        opts.insert("encryptionType".to_owned(), "file".to_owned());
        assert_eq!(fetch_encryption_type(&opts, EncryptionType::Block), EncryptionType::File);
        opts.insert("encryptionType".to_owned(), "luks".to_owned());
        assert_eq!(fetch_encryption_type(&opts, EncryptionType::None), EncryptionType::Invalid);
    }

    #[test]
    fn passphrase_generation() {
        let a = generate_new_encryption_passphrase(DEFAULT_ENCRYPTION_PASSPHRASE_SIZE);
        let b = generate_new_encryption_passphrase(DEFAULT_ENCRYPTION_PASSPHRASE_SIZE);
        // 20 bytes -> 28 padded base64 chars
        assert_eq!(a.len(), 28);
        assert_ne!(a, b);
        assert!(!a.contains('+') && !a.contains('/'));
    }

    #[tokio::test]
    async fn integrated_kms_is_its_own_store() {
        let ve = VolumeEncryption::new("", Arc::new(SecretsKms::new("default", "pw"))).unwrap();
        assert_eq!(ve.id(), "default");
        assert!(!ve.needs_dek_store());

        let cancel = CancellationToken::new();
        ve.store_new_crypto_passphrase(&cancel, "vol", DEFAULT_ENCRYPTION_PASSPHRASE_SIZE)
            .await
            .unwrap();
        // the secrets KMS always answers with the configured passphrase
        assert_eq!(ve.get_crypto_passphrase(&cancel, "vol").await.unwrap(), "pw");
        ve.remove_dek(&cancel, "vol").await.unwrap();
        ve.destroy();
    }

    #[tokio::test]
    async fn metadata_kms_needs_store() {
        let ve = VolumeEncryption::new("meta", Arc::new(SecretsMetadataKms::new("meta", "pw")))
            .unwrap();
        assert!(ve.needs_dek_store());
        let cancel = CancellationToken::new();
        assert!(matches!(
            ve.remove_dek(&cancel, "vol").await,
            Err(JournalError::DekStoreNotFound)
        ));
        assert!(ve.store_crypto_passphrase(&cancel, "vol", "x").await.is_err());
    }
}
