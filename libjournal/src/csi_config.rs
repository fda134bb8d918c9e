//! Cluster configuration file.
//!
//! The driver is deployed with a JSON array describing every cluster it
//! may talk to:
//!
//! ```json
//! [{
//!   "clusterID": "site-a",
//!   "monitors": ["10.0.0.1:6789", "10.0.0.2:6789"],
//!   "rbd": { "radosNamespace": "tenant-a" },
//!   "cephFS": { "subvolumeGroup": "csi" },
//!   "readAffinity": { "enabled": true, "crushLocationLabels": ["topology.io/zone"] }
//! }]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster_mapping;
use crate::config::JournalSettings;
use crate::error::{JournalError, Result};

/// Option key carrying the cluster id in CSI request parameters.
pub const CLUSTER_ID_KEY: &str = "clusterID";

const DEFAULT_CSI_SUBVOLUME_GROUP: &str = "csi";

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RbdInfo {
    pub rados_namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CephFsInfo {
    pub subvolume_group: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadAffinity {
    pub enabled: bool,
    pub crush_location_labels: Vec<String>,
}

/// One entry of the cluster configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterInfo {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub monitors: Vec<String>,
    pub rbd: RbdInfo,
    /// Top-level namespace accepted from older config files.
    #[serde(rename = "radosNamespace")]
    pub legacy_rados_namespace: String,
    #[serde(rename = "cephFS")]
    pub cephfs: CephFsInfo,
    pub read_affinity: ReadAffinity,
}

impl ClusterInfo {
    pub fn rados_namespace(&self) -> &str {
        if self.rbd.rados_namespace.is_empty() {
            &self.legacy_rados_namespace
        } else {
            &self.rbd.rados_namespace
        }
    }
}

/// Read the entry for `cluster_id` from the config file at `path`.
pub async fn read_cluster_info(path: &Path, cluster_id: &str) -> Result<ClusterInfo> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        JournalError::Config(format!(
            "error fetching configuration for cluster ID {cluster_id:?}: {e}"
        ))
    })?;
    let clusters: Vec<ClusterInfo> = serde_json::from_str(&content).map_err(|e| {
        JournalError::Config(format!("unmarshal failed ({e}), raw buffer response: {content}"))
    })?;

    clusters
        .into_iter()
        .find(|c| c.cluster_id == cluster_id)
        .ok_or_else(|| {
            JournalError::Config(format!("missing configuration for cluster ID {cluster_id:?}"))
        })
}

/// Comma separated monitor list for `cluster_id`.
pub async fn mons(path: &Path, cluster_id: &str) -> Result<String> {
    let cluster = read_cluster_info(path, cluster_id).await?;
    if cluster.monitors.is_empty() {
        return Err(JournalError::Config(format!(
            "empty monitor list for cluster ID ({cluster_id}) in config"
        )));
    }
    Ok(cluster.monitors.join(","))
}

pub async fn rados_namespace(path: &Path, cluster_id: &str) -> Result<String> {
    let cluster = read_cluster_info(path, cluster_id).await?;
    Ok(cluster.rados_namespace().to_owned())
}

/// Subvolume group for CephFS volumes, `csi` when unset.
pub async fn cephfs_subvolume_group(path: &Path, cluster_id: &str) -> Result<String> {
    let cluster = read_cluster_info(path, cluster_id).await?;
    if cluster.cephfs.subvolume_group.is_empty() {
        return Ok(DEFAULT_CSI_SUBVOLUME_GROUP.to_owned());
    }
    Ok(cluster.cephfs.subvolume_group)
}

/// Whether read affinity is enabled for `cluster_id`, and the configured
/// crush location labels joined with `,`.
pub async fn crush_location_labels(path: &Path, cluster_id: &str) -> Result<(bool, String)> {
    let cluster = read_cluster_info(path, cluster_id).await?;
    if !cluster.read_affinity.enabled {
        return Ok((false, String::new()));
    }
    Ok((true, cluster.read_affinity.crush_location_labels.join(",")))
}

/// Fetch the cluster id from request parameters.
pub fn get_cluster_id(options: &HashMap<String, String>) -> Result<String> {
    options
        .get(CLUSTER_ID_KEY)
        .cloned()
        .ok_or(JournalError::ClusterIdNotSet)
}

/// Monitors and the effective cluster id for `cluster_id`.  With
/// `check_mapping` the cluster mapping file is consulted first.
pub async fn get_mons_and_cluster_id(
    settings: &JournalSettings,
    cancel: &CancellationToken,
    cluster_id: &str,
    check_mapping: bool,
) -> Result<(String, String)> {
    if check_mapping {
        return cluster_mapping::fetch_mapped_cluster_id_and_mons(
            cancel,
            cluster_id,
            &settings.cluster_mapping_file,
            &settings.csi_config_file,
        )
        .await;
    }

    let monitors = mons(&settings.csi_config_file, cluster_id)
        .await
        .map_err(|e| {
            JournalError::Config(format!(
                "failed to fetch monitor list using clusterID ({cluster_id}): {e}"
            ))
        })?;
    Ok((monitors, cluster_id.to_owned()))
}

// ---------------------------------------------------------------------------
// Read affinity
// ---------------------------------------------------------------------------

/// Map the requested crush location labels onto the node's label values.
///
/// `labels` is `[prefix/]<name>,[prefix/]<name>,...`.  The crush location
/// type is the part after the last `/`, with `hostname` renamed to `host`,
/// and `.` in values replaced by `-`.
pub fn crush_location_map(
    labels: &str,
    node_labels: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    if labels.is_empty() {
        return BTreeMap::new();
    }
    let wanted: Vec<&str> = labels.split(',').collect();
    debug!(?wanted, "CRUSH location labels passed for processing");

    let mut out = BTreeMap::new();
    for (key, value) in node_labels {
        if !wanted.contains(&key.as_str()) {
            continue;
        }
        let name = key.rsplit_once('/').map_or(key.as_str(), |(_, n)| n).trim();
        let location_type = if name == "hostname" { "host" } else { name };
        out.insert(location_type.to_owned(), value.trim().replace('.', "-"));
    }

    debug!(crush_location = ?out, "list of CRUSH location processed");
    out
}

/// `read_from_replica=localize,crush_location=k1:v1|k2:v2`, or empty when
/// there is no location.
pub fn construct_read_affinity_map_option(location: &BTreeMap<String, String>) -> String {
    if location.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = location.iter().map(|(k, v)| format!("{k}:{v}")).collect();
    format!(
        "read_from_replica=localize,crush_location={}",
        pairs.join("|")
    )
}

/// Read affinity map options for `cluster_id`.  Falls back to
/// `cli_options` when the config enables read affinity but names no labels.
pub async fn read_affinity_map_options(
    path: &Path,
    cluster_id: &str,
    cli_options: &str,
    node_labels: &HashMap<String, String>,
) -> Result<String> {
    let (enabled, labels) = crush_location_labels(path, cluster_id).await?;
    if !enabled {
        return Ok(String::new());
    }
    if labels.is_empty() {
        return Ok(cli_options.to_owned());
    }
    Ok(construct_read_affinity_map_option(&crush_location_map(
        &labels,
        node_labels,
    )))
}
