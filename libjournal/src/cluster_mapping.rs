//! Cluster and pool id mapping for failover.
//!
//! After a disaster-recovery failover the volume ids held by the
//! orchestrator still carry the *source* cluster id and pool ids.  An
//! administrator drops a mapping file next to the cluster config that
//! rewrites them to the identifiers valid on this site:
//!
//! ```json
//! [{
//!   "clusterIDMapping": { "site1-storage": "site2-storage" },
//!   "RBDPoolIDMapping": [{ "1": "2", "11": "12" }],
//!   "CephFSFscIDMapping": [{ "13": "34" }]
//! }]
//! ```
//!
//! The same file is deployed on both sites, so every lookup matches the id
//! against both sides of a pair.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::csi_config;
use crate::error::{JournalError, Result};
use crate::omap::with_cancel;
use crate::rados::{Cluster, RadosError};

/// One record of the mapping file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterMappingInfo {
    #[serde(rename = "clusterIDMapping")]
    pub cluster_id_mapping: BTreeMap<String, String>,
    #[serde(rename = "RBDPoolIDMapping")]
    pub rbd_pool_id_mapping: Vec<BTreeMap<String, String>>,
    #[serde(rename = "CephFSFscIDMapping")]
    pub cephfs_fscid_mapping: Vec<BTreeMap<String, String>>,
}

/// Every record whose cluster mapping mentions `cluster_id` on either side.
///
/// A missing mapping file is expected (it only exists after a failover) and
/// yields an empty list.
pub async fn get_cluster_mapping_info(
    cluster_id: &str,
    path: &Path,
) -> Result<Vec<ClusterMappingInfo>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(JournalError::Config(format!(
                "failed to fetch cluster mapping: error fetching clusterID mapping {e}"
            )));
        }
    };
    let infos: Vec<ClusterMappingInfo> = serde_json::from_str(&content).map_err(|e| {
        JournalError::Config(format!(
            "failed to fetch cluster mapping: unmarshal failed ({e}), raw buffer response: {content}"
        ))
    })?;

    Ok(infos
        .into_iter()
        .filter(|info| {
            info.cluster_id_mapping
                .iter()
                .any(|(k, v)| k == cluster_id || v == cluster_id)
        })
        .collect())
}

/// The other side of the pair `(key, value)` when `id` is one of them,
/// otherwise the empty string.
pub fn get_mapped_id(key: &str, value: &str, id: &str) -> String {
    if key == id {
        return value.to_owned();
    }
    if value == id {
        return key.to_owned();
    }
    String::new()
}

/// Monitors and effective cluster id for `cluster_id`.
///
/// Each mapped cluster id is tried in turn against the cluster config; the
/// first one that has monitors wins.  Falls back to `cluster_id` itself for
/// deployments where the ids are the same on both sites.
pub async fn fetch_mapped_cluster_id_and_mons(
    cancel: &CancellationToken,
    cluster_id: &str,
    mapping_file: &Path,
    csi_config_file: &Path,
) -> Result<(String, String)> {
    let infos = with_cancel(cancel, get_cluster_mapping_info(cluster_id, mapping_file)).await??;

    for info in &infos {
        for (key, val) in &info.cluster_id_mapping {
            let mapped = get_mapped_id(key, val, cluster_id);
            if mapped.is_empty() {
                continue;
            }
            debug!(%mapped, %cluster_id, "found new clusterID mapping for existing clusterID");
            match with_cancel(cancel, csi_config::mons(csi_config_file, &mapped)).await? {
                Ok(mons) => return Ok((mons, mapped)),
                Err(e) => {
                    debug!(%mapped, error = %e, "failed getting mons with mapped cluster id");
                }
            }
        }
    }

    match with_cancel(cancel, csi_config::mons(csi_config_file, cluster_id)).await? {
        Ok(mons) => Ok((mons, cluster_id.to_owned())),
        Err(e) => {
            error!(%cluster_id, error = %e, "failed getting mons with cluster id");
            Err(e)
        }
    }
}

fn mapped_ids(mappings: &[BTreeMap<String, String>], id: i64) -> Vec<i64> {
    let id = id.to_string();
    mappings
        .iter()
        .flat_map(|m| m.iter())
        .filter_map(|(k, v)| {
            let mapped = get_mapped_id(k, v, &id);
            if mapped.is_empty() {
                return None;
            }
            match mapped.parse() {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(%mapped, error = %e, "ignoring non-numeric id in cluster mapping");
                    None
                }
            }
        })
        .collect()
}

/// Local RBD pool id for a pool id taken from a volume id, if mapped.
pub fn mapped_pool_id(infos: &[ClusterMappingInfo], pool_id: i64) -> Option<i64> {
    infos
        .iter()
        .flat_map(|info| mapped_ids(&info.rbd_pool_id_mapping, pool_id))
        .next()
}

/// Local CephFS filesystem id for a remote one, if mapped.
pub fn mapped_fscid(infos: &[ClusterMappingInfo], fscid: i64) -> Option<i64> {
    infos
        .iter()
        .flat_map(|info| mapped_ids(&info.cephfs_fscid_mapping, fscid))
        .next()
}

/// Resolve the pool id from a volume id to a `(pool id, pool name)` pair
/// that exists on this cluster.
///
/// The id is tried as is first; when it is unknown here every mapped
/// candidate is tried in turn.
pub async fn resolve_local_pool_name(
    conn: &dyn Cluster,
    cancel: &CancellationToken,
    infos: &[ClusterMappingInfo],
    pool_id: i64,
) -> Result<(i64, String)> {
    let candidates = std::iter::once(pool_id)
        .chain(infos.iter().flat_map(|info| mapped_ids(&info.rbd_pool_id_mapping, pool_id)));

    for candidate in candidates {
        match with_cancel(cancel, conn.pool_name(candidate)).await? {
            Ok(name) => {
                if candidate != pool_id {
                    debug!(pool_id, candidate, %name, "resolved pool through cluster mapping");
                }
                return Ok((candidate, name));
            }
            Err(RadosError::NotFound(_)) => continue,
            Err(e) => return Err(JournalError::backend(e)),
        }
    }
    Err(JournalError::PoolNotFound(format!("pool id {pool_id}")))
}
