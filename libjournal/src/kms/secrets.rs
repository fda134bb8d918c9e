//! Passphrase-based KMS providers.
//!
//! [`SecretsKms`] hands every volume the passphrase from the request
//! secrets.  [`SecretsMetadataKms`] instead derives a per-volume key from
//! that passphrase (scrypt, salted with the volume id) and uses it to seal a
//! random DEK with AES-256-GCM; the sealed DEK lives in the journal.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{DEFAULT_KMS_TYPE, DekStore, DekStoreType, EncryptionKms, Provider, ProviderInitArgs};
use crate::error::{JournalError, Result};

/// Secrets key holding the passphrase.
pub const ENCRYPTION_PASSPHRASE_KEY: &str = "encryptionPassphrase";
/// Provider id of [`SecretsMetadataKms`].
pub const KMS_TYPE_SECRETS_METADATA: &str = "metadata";

// scrypt N = 2^15, r = 8, p = 1
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub const SECRETS_PROVIDER: Provider = Provider {
    unique_id: DEFAULT_KMS_TYPE,
    init: init_secrets_kms,
};

pub const SECRETS_METADATA_PROVIDER: Provider = Provider {
    unique_id: KMS_TYPE_SECRETS_METADATA,
    init: init_secrets_metadata_kms,
};

fn passphrase_from(secrets: &HashMap<String, String>, missing: &str) -> Result<String> {
    secrets
        .get(ENCRYPTION_PASSPHRASE_KEY)
        .cloned()
        .ok_or_else(|| JournalError::Kms(missing.to_owned()))
}

// ---------------------------------------------------------------------------
// SecretsKms
// ---------------------------------------------------------------------------

/// Integrated KMS that uses the request passphrase as every volume's DEK.
#[derive(Clone)]
pub struct SecretsKms {
    id: String,
    passphrase: String,
}

impl std::fmt::Debug for SecretsKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsKms")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SecretsKms {
    pub fn new(id: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            passphrase: passphrase.into(),
        }
    }
}

fn init_secrets_kms(args: ProviderInitArgs) -> Result<Arc<dyn EncryptionKms>> {
    let passphrase = passphrase_from(&args.secrets, "missing encryption passphrase in secrets")?;
    Ok(Arc::new(SecretsKms::new(args.kms_id, passphrase)))
}

#[async_trait]
impl EncryptionKms for SecretsKms {
    fn id(&self) -> &str {
        &self.id
    }

    fn requires_dek_store(&self) -> DekStoreType {
        DekStoreType::Integrated
    }

    async fn encrypt_dek(&self, _volume_id: &str, plain_dek: &str) -> Result<String> {
        Ok(plain_dek.to_owned())
    }

    async fn decrypt_dek(&self, _volume_id: &str, encrypted_dek: &str) -> Result<String> {
        Ok(encrypted_dek.to_owned())
    }

    fn as_dek_store(self: Arc<Self>) -> Option<Arc<dyn DekStore>> {
        Some(self)
    }
}

#[async_trait]
impl DekStore for SecretsKms {
    // nothing is stored per volume
    async fn store_dek(
        &self,
        _cancel: &CancellationToken,
        _volume_id: &str,
        _dek: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn fetch_dek(&self, _cancel: &CancellationToken, _volume_id: &str) -> Result<String> {
        Ok(self.passphrase.clone())
    }

    async fn remove_dek(&self, _cancel: &CancellationToken, _volume_id: &str) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SecretsMetadataKms
// ---------------------------------------------------------------------------

/// KMS that seals per-volume DEKs with a key derived from the passphrase.
#[derive(Clone)]
pub struct SecretsMetadataKms {
    id: String,
    passphrase: String,
}

impl std::fmt::Debug for SecretsMetadataKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsMetadataKms")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Stored form of a sealed DEK.
#[derive(Serialize, Deserialize)]
struct EncryptedMetadataDek {
    /// base64 ciphertext
    dek: String,
    /// base64 nonce
    nonce: String,
}

impl SecretsMetadataKms {
    pub fn new(id: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            passphrase: passphrase.into(),
        }
    }

    async fn cipher(&self, volume_id: &str) -> Result<Aes256Gcm> {
        let passphrase = self.passphrase.clone();
        let salt = volume_id.to_owned();
        // CPU bound
        let key = tokio::task::spawn_blocking(move || derive_key(&passphrase, &salt))
            .await
            .map_err(|e| JournalError::Kms(format!("key derivation task failed: {e}")))??;
        Ok(Aes256Gcm::new(GenericArray::from_slice(&key)))
    }
}

fn derive_key(passphrase: &str, salt: &str) -> Result<[u8; KEY_LEN]> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|e| JournalError::Kms(format!("invalid scrypt parameters: {e}")))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(passphrase.as_bytes(), salt.as_bytes(), &params, &mut key)
        .map_err(|e| JournalError::Kms(format!("failed to generate cipher: {e}")))?;
    Ok(key)
}

fn init_secrets_metadata_kms(args: ProviderInitArgs) -> Result<Arc<dyn EncryptionKms>> {
    let passphrase = passphrase_from(
        &args.secrets,
        &format!("missing {ENCRYPTION_PASSPHRASE_KEY:?} in storageclass secret"),
    )?;
    Ok(Arc::new(SecretsMetadataKms::new(args.kms_id, passphrase)))
}

#[async_trait]
impl EncryptionKms for SecretsMetadataKms {
    fn id(&self) -> &str {
        &self.id
    }

    fn requires_dek_store(&self) -> DekStoreType {
        DekStoreType::Metadata
    }

    async fn encrypt_dek(&self, volume_id: &str, plain_dek: &str) -> Result<String> {
        let cipher = self.cipher(volume_id).await?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(GenericArray::from_slice(&nonce), plain_dek.as_bytes())
            .map_err(|e| JournalError::Kms(format!("failed to encrypt DEK: {e}")))?;

        let stored = EncryptedMetadataDek {
            dek: STANDARD.encode(sealed),
            nonce: STANDARD.encode(nonce),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    async fn decrypt_dek(&self, volume_id: &str, encrypted_dek: &str) -> Result<String> {
        let cipher = self.cipher(volume_id).await?;

        let stored: EncryptedMetadataDek = serde_json::from_str(encrypted_dek).map_err(|e| {
            JournalError::Kms(format!("failed to convert data to encrypted DEK: {e}"))
        })?;
        let decode = |field: &str| {
            STANDARD
                .decode(field)
                .map_err(|e| JournalError::Kms(format!("malformed encrypted DEK: {e}")))
        };
        let sealed = decode(&stored.dek)?;
        let nonce = decode(&stored.nonce)?;
        if nonce.len() != NONCE_LEN {
            return Err(JournalError::Kms(format!(
                "malformed encrypted DEK: nonce is {} bytes",
                nonce.len()
            )));
        }

        let plain = cipher
            .decrypt(GenericArray::from_slice(&nonce), sealed.as_ref())
            .map_err(|e| JournalError::Kms(format!("failed to decrypt DEK: {e}")))?;
        String::from_utf8(plain)
            .map_err(|e| JournalError::Kms(format!("decrypted DEK is not UTF-8: {e}")))
    }
}
