//! Journal configuration.
//!
//! [`JournalSettings`] holds every option the journal consumes from its
//! caller.  Values come from [`Default`], a JSON file ([`JournalSettings::load`])
//! or the environment ([`JournalSettings::from_env`]).
//!
//! Environment variables:
//! - `CSI_JOURNAL_INSTANCE_ID`: suffix of the `csi.volumes.<id>` / `csi.snaps.<id>` omaps.
//! - `CSI_JOURNAL_NAMESPACE`: object-store namespace of the journal objects.
//! - `CSI_JOURNAL_VOL_PREFIX` / `CSI_JOURNAL_SNAP_PREFIX`: backend object name prefixes.
//! - `CSI_JOURNAL_LIST_EXCESS`: omap page slack.
//! - `CSI_JOURNAL_MAX_UUID_ATTEMPTS`: uuid collision retry ceiling.
//! - `CSI_JOURNAL_CONN_POOL_INTERVAL` / `CSI_JOURNAL_CONN_POOL_EXPIRY`: session pool GC, in
//!   seconds.  A zero interval keeps the default.
//! - `CSI_JOURNAL_CSI_CONFIG`, `CSI_JOURNAL_CLUSTER_MAPPING`, `CSI_JOURNAL_KMS_CONFIG`: file paths.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{JournalError, Result};

pub const DEFAULT_VOLUME_NAMING_PREFIX: &str = "csi-vol-";
pub const DEFAULT_SNAPSHOT_NAMING_PREFIX: &str = "csi-snap-";
pub const DEFAULT_LIST_EXCESS: usize = 32;
pub const DEFAULT_MAX_UUID_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONN_POOL_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_CONN_POOL_EXPIRY: Duration = Duration::from_secs(10 * 60);

const DEFAULT_INSTANCE_ID: &str = "default";
const DEFAULT_CSI_CONFIG_FILE: &str = "/etc/ceph-csi-config/config.json";
const DEFAULT_CLUSTER_MAPPING_FILE: &str = "/etc/ceph-csi-config/cluster-mapping.json";
const DEFAULT_KMS_CONFIG_FILE: &str = "/etc/ceph-csi-encryption-kms-config/config.json";

/// Options consumed by the journal and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JournalSettings {
    /// Appended to the two top-level omap names so several driver instances
    /// can share a pool.
    pub instance_id: String,
    /// Namespace enclosing the journal objects, empty for none.
    pub namespace: String,
    pub vol_naming_prefix: String,
    pub snap_naming_prefix: String,
    /// Extra entries requested per omap page beyond the wanted keys.
    pub list_excess: usize,
    pub max_uuid_attempts: u32,
    /// How often the session pool looks for idle sessions.
    #[serde(with = "secs")]
    pub conn_pool_interval: Duration,
    /// How long an unreferenced session may stay idle.
    #[serde(with = "secs")]
    pub conn_pool_expiry: Duration,
    pub csi_config_file: PathBuf,
    pub cluster_mapping_file: PathBuf,
    pub kms_config_file: PathBuf,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            instance_id: DEFAULT_INSTANCE_ID.to_owned(),
            namespace: String::new(),
            vol_naming_prefix: DEFAULT_VOLUME_NAMING_PREFIX.to_owned(),
            snap_naming_prefix: DEFAULT_SNAPSHOT_NAMING_PREFIX.to_owned(),
            list_excess: DEFAULT_LIST_EXCESS,
            max_uuid_attempts: DEFAULT_MAX_UUID_ATTEMPTS,
            conn_pool_interval: DEFAULT_CONN_POOL_INTERVAL,
            conn_pool_expiry: DEFAULT_CONN_POOL_EXPIRY,
            csi_config_file: PathBuf::from(DEFAULT_CSI_CONFIG_FILE),
            cluster_mapping_file: PathBuf::from(DEFAULT_CLUSTER_MAPPING_FILE),
            kms_config_file: PathBuf::from(DEFAULT_KMS_CONFIG_FILE),
        }
    }
}

impl JournalSettings {
    /// Defaults overridden by `CSI_JOURNAL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `CSI_JOURNAL_*` variable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let num = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            instance_id: lookup("CSI_JOURNAL_INSTANCE_ID").unwrap_or(d.instance_id),
            namespace: lookup("CSI_JOURNAL_NAMESPACE").unwrap_or(d.namespace),
            vol_naming_prefix: lookup("CSI_JOURNAL_VOL_PREFIX").unwrap_or(d.vol_naming_prefix),
            snap_naming_prefix: lookup("CSI_JOURNAL_SNAP_PREFIX").unwrap_or(d.snap_naming_prefix),
            list_excess: num("CSI_JOURNAL_LIST_EXCESS")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(d.list_excess),
            max_uuid_attempts: num("CSI_JOURNAL_MAX_UUID_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(d.max_uuid_attempts),
            conn_pool_interval: num("CSI_JOURNAL_CONN_POOL_INTERVAL")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.conn_pool_interval),
            conn_pool_expiry: num("CSI_JOURNAL_CONN_POOL_EXPIRY")
                .map(Duration::from_secs)
                .unwrap_or(d.conn_pool_expiry),
            csi_config_file: lookup("CSI_JOURNAL_CSI_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(d.csi_config_file),
            cluster_mapping_file: lookup("CSI_JOURNAL_CLUSTER_MAPPING")
                .map(PathBuf::from)
                .unwrap_or(d.cluster_mapping_file),
            kms_config_file: lookup("CSI_JOURNAL_KMS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(d.kms_config_file),
        }
    }

    /// Read settings from a JSON file; absent fields keep their defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await.map_err(|e| {
            JournalError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let settings: Self = serde_json::from_slice(&content).map_err(|e| {
            JournalError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_uuid_attempts == 0 {
            return Err(JournalError::Config("maxUuidAttempts must be at least 1".into()));
        }
        if self.conn_pool_interval.is_zero() {
            return Err(JournalError::Config("connPoolInterval must be non-zero".into()));
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let s = JournalSettings::default();
        assert_eq!(s.instance_id, "default");
        assert_eq!(s.vol_naming_prefix, "csi-vol-");
        assert_eq!(s.snap_naming_prefix, "csi-snap-");
        assert_eq!(s.list_excess, 32);
        assert_eq!(s.max_uuid_attempts, 5);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let env = HashMap::from([
            ("CSI_JOURNAL_INSTANCE_ID", "site-a"),
            ("CSI_JOURNAL_LIST_EXCESS", "8"),
            ("CSI_JOURNAL_MAX_UUID_ATTEMPTS", "0"),
            ("CSI_JOURNAL_CONN_POOL_INTERVAL", "0"),
            ("CSI_JOURNAL_CONN_POOL_EXPIRY", "30"),
            ("CSI_JOURNAL_CSI_CONFIG", "/tmp/config.json"),
        ]);
        let s = JournalSettings::from_lookup(|k| env.get(k).map(|v| (*v).to_owned()));
        assert_eq!(s.instance_id, "site-a");
        assert_eq!(s.list_excess, 8);
        // zero is rejected and the default kept
        assert_eq!(s.max_uuid_attempts, 5);
        assert_eq!(s.conn_pool_interval, DEFAULT_CONN_POOL_INTERVAL);
        assert_eq!(s.conn_pool_expiry, Duration::from_secs(30));
        assert_eq!(s.csi_config_file, PathBuf::from("/tmp/config.json"));
        assert_eq!(s.namespace, "");
    }

    #[tokio::test]
    async fn load_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("journal.json");
        tokio::fs::write(&path, r#"{"instanceId":"x","namespace":"ns","connPoolInterval":60}"#)
            .await
            .unwrap();

        let s = JournalSettings::load(&path).await.unwrap();
        assert_eq!(s.instance_id, "x");
        assert_eq!(s.namespace, "ns");
        assert_eq!(s.conn_pool_interval, Duration::from_secs(60));
        assert_eq!(s.list_excess, DEFAULT_LIST_EXCESS);
    }

    #[tokio::test]
    async fn load_rejects_zero_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("journal.json");
        tokio::fs::write(&path, r#"{"connPoolInterval":0}"#).await.unwrap();
        let err = JournalSettings::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("connPoolInterval"));
    }

    #[tokio::test]
    async fn load_rejects_zero_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("journal.json");
        tokio::fs::write(&path, r#"{"maxUuidAttempts":0}"#).await.unwrap();
        assert!(matches!(
            JournalSettings::load(&path).await,
            Err(JournalError::Config(_))
        ));
    }
}
