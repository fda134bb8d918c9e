//! Typed object-map primitives.
//!
//! Thin wrappers over [`IoContext`] that open a context per call, honour the
//! caller's cancellation token and translate backend "not found" / "exists"
//! into the journal's error kinds:
//!
//! | Backend condition | Journal error |
//! |---|---|
//! | pool missing | [`JournalError::PoolNotFound`] |
//! | omap object missing on read | [`JournalError::KeyNotFound`] |
//! | object present on exclusive create | [`JournalError::ObjectExists`] |
//! | object missing on remove | [`JournalError::ObjectNotFound`] |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{JournalError, Result};
use crate::rados::{Cluster, IoContext, RadosError};

/// Location of one object: pool, optional namespace and object name.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRef<'a> {
    pub pool: &'a str,
    pub namespace: &'a str,
    pub oid: &'a str,
}

impl<'a> ObjectRef<'a> {
    pub fn new(pool: &'a str, namespace: &'a str, oid: &'a str) -> Self {
        Self {
            pool,
            namespace,
            oid,
        }
    }
}

impl fmt::Display for ObjectRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool={:?}, namespace={:?}, name={:?}",
            self.pool, self.namespace, self.oid
        )
    }
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JournalError::Cancelled),
        v = fut => Ok(v),
    }
}

fn pool_error(pool: &str, e: RadosError) -> JournalError {
    match e {
        RadosError::NotFound(_) => JournalError::PoolNotFound(pool.to_owned()),
        other => JournalError::backend(other),
    }
}

async fn open(
    conn: &dyn Cluster,
    cancel: &CancellationToken,
    obj: ObjectRef<'_>,
) -> Result<Box<dyn IoContext>> {
    with_cancel(cancel, conn.io_context(obj.pool, obj.namespace))
        .await?
        .map_err(|e| pool_error(obj.pool, e))
}

/// Fetch the values of `keys` from the omap of `obj`.
///
/// Lists entries starting with `prefix` in pages of
/// `keys.len() + list_excess`, following the last key seen until a page
/// yields nothing new.  Keys that are not present are simply absent from
/// the result.
pub async fn get_omap_values(
    conn: &dyn Cluster,
    cancel: &CancellationToken,
    obj: ObjectRef<'_>,
    prefix: &str,
    keys: &[String],
    list_excess: usize,
) -> Result<HashMap<String, String>> {
    let ioctx = open(conn, cancel, obj).await?;

    let want: HashSet<&str> = keys.iter().map(String::as_str).collect();
    let page = keys.len().saturating_add(list_excess).max(1);
    let mut results = HashMap::new();
    let mut start_after = String::new();

    loop {
        let listed = with_cancel(
            cancel,
            ioctx.list_omap_values(obj.oid, &start_after, prefix, page),
        )
        .await?;
        let entries = match listed {
            Ok(entries) => entries,
            Err(RadosError::NotFound(_)) => {
                error!(%obj, "omap not found");
                return Err(JournalError::KeyNotFound(format!("omap {} not found", obj.oid)));
            }
            Err(e) => return Err(JournalError::backend(e)),
        };

        let Some((last, _)) = entries.last() else {
            break;
        };
        start_after = last.clone();
        let short_page = entries.len() < page;
        for (k, v) in entries {
            if want.contains(k.as_str()) {
                results.insert(k, String::from_utf8_lossy(&v).into_owned());
            }
        }
        if short_page || results.len() == want.len() {
            break;
        }
    }

    debug!(%obj, ?results, "got omap values");
    Ok(results)
}

/// Insert or replace `pairs` in the omap of `obj` in one write.
pub async fn set_omap_keys(
    conn: &dyn Cluster,
    cancel: &CancellationToken,
    obj: ObjectRef<'_>,
    pairs: &BTreeMap<String, String>,
) -> Result<()> {
    let ioctx = open(conn, cancel, obj).await?;

    let bpairs: BTreeMap<String, Vec<u8>> = pairs
        .iter()
        .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
        .collect();
    if let Err(e) = with_cancel(cancel, ioctx.set_omap(obj.oid, &bpairs)).await? {
        error!(%obj, ?pairs, error = %e, "failed setting omap keys");
        return Err(JournalError::backend(e));
    }

    debug!(%obj, ?pairs, "set omap keys");
    Ok(())
}

/// Remove `keys` from the omap of `obj`.  A missing object is not an error.
pub async fn remove_map_keys(
    conn: &dyn Cluster,
    cancel: &CancellationToken,
    obj: ObjectRef<'_>,
    keys: &[String],
) -> Result<()> {
    let ioctx = open(conn, cancel, obj).await?;

    match with_cancel(cancel, ioctx.rm_omap_keys(obj.oid, keys)).await? {
        Ok(()) => {}
        Err(RadosError::NotFound(_)) => {
            debug!(%obj, ?keys, "when removing omap keys, omap not found");
        }
        Err(e) => {
            error!(%obj, error = %e, "failed removing omap keys");
            return Err(JournalError::backend(e));
        }
    }

    debug!(%obj, ?keys, "removed omap keys");
    Ok(())
}

/// Exclusively create the (empty) object `obj`.
pub async fn create_object(
    conn: &dyn Cluster,
    cancel: &CancellationToken,
    obj: ObjectRef<'_>,
) -> Result<()> {
    let ioctx = open(conn, cancel, obj).await?;

    match with_cancel(cancel, ioctx.create(obj.oid, true)).await? {
        Ok(()) => Ok(()),
        Err(RadosError::Exists(_)) => Err(JournalError::ObjectExists(obj.oid.to_owned())),
        Err(e) => {
            error!(%obj, error = %e, "failed creating omap");
            Err(JournalError::backend(e))
        }
    }
}

/// Remove the object `obj` together with its omap.
pub async fn remove_object(
    conn: &dyn Cluster,
    cancel: &CancellationToken,
    obj: ObjectRef<'_>,
) -> Result<()> {
    let ioctx = open(conn, cancel, obj).await?;

    match with_cancel(cancel, ioctx.remove(obj.oid)).await? {
        Ok(()) => Ok(()),
        Err(RadosError::NotFound(_)) => Err(JournalError::ObjectNotFound(obj.oid.to_owned())),
        Err(e) => {
            error!(%obj, error = %e, "failed removing omap");
            Err(JournalError::backend(e))
        }
    }
}
