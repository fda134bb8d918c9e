//! Key management for encrypted volumes.
//!
//! An [`EncryptionKms`] supplies or protects the per-volume data encryption
//! key (DEK).  Where the DEK is kept depends on
//! [`EncryptionKms::requires_dek_store`]:
//!
//! | Mode | DEK storage |
//! |---|---|
//! | [`DekStoreType::Integrated`] | the KMS itself, which also implements [`DekStore`] |
//! | [`DekStoreType::Metadata`] | a separate [`DekStore`], normally the journal |
//!
//! Providers are looked up by name in a [`KmsManager`].  The built-in ones
//! are [`secrets::SecretsKms`] (`default`) and
//! [`secrets::SecretsMetadataKms`] (`metadata`).

pub mod secrets;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{JournalError, Result};

/// Config key naming the provider of a KMS section.
pub const KMS_TYPE_KEY: &str = "encryptionKMSType";
/// Older spelling of [`KMS_TYPE_KEY`].
pub const KMS_PROVIDER_KEY: &str = "KMS_PROVIDER";
/// Provider and KMS id used when none is configured.
pub const DEFAULT_KMS_TYPE: &str = "default";

const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Where the encrypted DEK of a volume is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DekStoreType {
    /// The KMS stores DEKs itself.
    Integrated,
    /// DEKs are stored alongside the volume metadata.
    Metadata,
}

/// Persistent storage for (encrypted) DEKs, keyed by volume id.
#[async_trait]
pub trait DekStore: Send + Sync {
    async fn store_dek(&self, cancel: &CancellationToken, volume_id: &str, dek: &str)
    -> Result<()>;

    async fn fetch_dek(&self, cancel: &CancellationToken, volume_id: &str) -> Result<String>;

    async fn remove_dek(&self, cancel: &CancellationToken, volume_id: &str) -> Result<()>;
}

/// A key management service instance.
#[async_trait]
pub trait EncryptionKms: Send + Sync {
    /// Id of the configuration section this instance was built from.
    fn id(&self) -> &str;

    /// Release any resources held by the instance.
    fn destroy(&self) {}

    fn requires_dek_store(&self) -> DekStoreType;

    /// Protect `plain_dek` for storage.  Integrated stores return it as is.
    async fn encrypt_dek(&self, volume_id: &str, plain_dek: &str) -> Result<String>;

    /// Inverse of [`EncryptionKms::encrypt_dek`].
    async fn decrypt_dek(&self, volume_id: &str, encrypted_dek: &str) -> Result<String>;

    /// The instance as a DEK store, for integrated KMS.
    fn as_dek_store(self: Arc<Self>) -> Option<Arc<dyn DekStore>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Provider registry
// ---------------------------------------------------------------------------

/// Everything a provider needs to build an instance.
#[derive(Debug, Clone, Default)]
pub struct ProviderInitArgs {
    /// Namespace of the volume's owner.
    pub tenant: String,
    pub kms_id: String,
    /// The KMS configuration section.
    pub config: Map<String, Value>,
    /// Secrets passed with the request.
    pub secrets: HashMap<String, String>,
    /// Namespace the driver runs in, when known.
    pub namespace: String,
}

pub type ProviderInitFn = fn(ProviderInitArgs) -> Result<Arc<dyn EncryptionKms>>;

#[derive(Clone, Copy)]
pub struct Provider {
    pub unique_id: &'static str,
    pub init: ProviderInitFn,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("unique_id", &self.unique_id)
            .finish_non_exhaustive()
    }
}

/// Registry of KMS providers keyed by unique id.
#[derive(Debug, Default)]
pub struct KmsManager {
    providers: HashMap<&'static str, Provider>,
}

impl KmsManager {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in secrets providers.
    pub fn with_builtin_providers() -> Self {
        let mut mgr = Self::new();
        mgr.providers.insert(DEFAULT_KMS_TYPE, secrets::SECRETS_PROVIDER);
        mgr.providers
            .insert(secrets::KMS_TYPE_SECRETS_METADATA, secrets::SECRETS_METADATA_PROVIDER);
        mgr
    }

    pub fn register(&mut self, provider: Provider) -> Result<()> {
        if provider.unique_id.is_empty() {
            return Err(JournalError::Kms("a provider MUST set a UniqueID".into()));
        }
        if self.providers.contains_key(provider.unique_id) {
            return Err(JournalError::Kms(format!(
                "duplicate registration of Provider.UniqueID: {}",
                provider.unique_id
            )));
        }
        self.providers.insert(provider.unique_id, provider);
        Ok(())
    }

    fn provider(&self, name: &str) -> Result<&Provider> {
        self.providers
            .get(name)
            .ok_or_else(|| JournalError::Kms(format!("could not find KMS provider {name:?}")))
    }

    /// The `default` KMS, built from the request secrets only.
    pub fn get_default_kms(
        &self,
        secrets: &HashMap<String, String>,
    ) -> Result<Arc<dyn EncryptionKms>> {
        let provider = self.provider(DEFAULT_KMS_TYPE)?;
        (provider.init)(ProviderInitArgs {
            kms_id: DEFAULT_KMS_TYPE.to_owned(),
            secrets: secrets.clone(),
            ..Default::default()
        })
    }

    /// Build the KMS configured under `kms_id` in the KMS config file.
    /// An empty id or `default` selects the default KMS.
    pub async fn get_kms(
        &self,
        tenant: &str,
        kms_id: &str,
        secrets: &HashMap<String, String>,
        config_file: &Path,
    ) -> Result<Arc<dyn EncryptionKms>> {
        if kms_id.is_empty() || kms_id == DEFAULT_KMS_TYPE {
            return self.get_default_kms(secrets);
        }

        let mut config = read_kms_config(config_file).await?;
        let section = config.remove(kms_id).ok_or_else(|| {
            let mut have: Vec<&String> = config.keys().collect();
            have.sort();
            JournalError::Kms(format!(
                "could not get KMS configuration for {kms_id:?} (have {have:?})"
            ))
        })?;
        let Value::Object(section) = section else {
            return Err(JournalError::Kms(format!(
                "failed to convert KMS configuration section: {kms_id}"
            )));
        };

        let provider_name = get_provider(&section)?;
        let provider = self.provider(&provider_name)?;
        debug!(%kms_id, provider = %provider_name, "building KMS");

        (provider.init)(ProviderInitArgs {
            tenant: tenant.to_owned(),
            kms_id: kms_id.to_owned(),
            config: section,
            secrets: secrets.clone(),
            namespace: std::env::var(POD_NAMESPACE_ENV).unwrap_or_default(),
        })
    }
}

async fn read_kms_config(path: &Path) -> Result<Map<String, Value>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        JournalError::Kms(format!(
            "failed to read KMS configuration from {}: {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| JournalError::Kms(format!("failed to parse KMS configuration: {e}")))
}

/// Provider name of a KMS section, from `encryptionKMSType` or the older
/// `KMS_PROVIDER`.
pub fn get_provider(config: &Map<String, Value>) -> Result<String> {
    for key in [KMS_TYPE_KEY, KMS_PROVIDER_KEY] {
        if let Some(value) = config.get(key) {
            return value.as_str().map(str::to_owned).ok_or_else(|| {
                JournalError::Kms(format!(
                    "could not convert KMS provider type ({value}) to string"
                ))
            });
        }
    }
    Err(JournalError::Kms(format!(
        "failed to get KMS provider, missing configuration option {KMS_TYPE_KEY:?} or {KMS_PROVIDER_KEY:?}"
    )))
}
