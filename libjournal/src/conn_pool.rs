//! Reference-counted pool of cluster sessions.
//!
//! Sessions are keyed by `(monitors, user, key-file contents)` so that the
//! short-lived key files written per request do not produce one session per
//! file.  [`ConnPool::put`] only drops a reference; idle sessions are closed
//! by a background task once they have been unused for longer than the
//! configured expiry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_CONN_POOL_INTERVAL, JournalSettings};
use crate::error::{JournalError, Result};
use crate::rados::{Cluster, Connector};

struct ConnEntry {
    conn: Arc<dyn Cluster>,
    /// Milliseconds since the pool epoch.
    last_used: AtomicU64,
    users: AtomicUsize,
}

impl ConnEntry {
    /// Take a reference.  Safe under the map's read lock.
    fn get(&self, now_ms: u64) -> Arc<dyn Cluster> {
        self.last_used.store(now_ms, Ordering::SeqCst);
        self.users.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&self.conn)
    }

    fn put(&self) {
        // never destroy inline, gc() does that
        let _ = self
            .users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| u.checked_sub(1));
    }
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    expiry: Duration,
    epoch: Instant,
    conns: RwLock<HashMap<String, ConnEntry>>,
}

impl PoolInner {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn gc(&self) {
        let now = self.now_ms();
        let expiry = u64::try_from(self.expiry.as_millis()).unwrap_or(u64::MAX);
        let mut conns = self.conns.write().unwrap_or_else(PoisonError::into_inner);
        conns.retain(|_, ce| {
            let idle = now.saturating_sub(ce.last_used.load(Ordering::SeqCst));
            if ce.users.load(Ordering::SeqCst) == 0 && idle > expiry {
                ce.conn.shutdown();
                return false;
            }
            true
        });
    }
}

fn same_session(a: &Arc<dyn Cluster>, b: &Arc<dyn Cluster>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Pool of cluster sessions with periodic garbage collection.
///
/// Must be created inside a Tokio runtime: the collector runs as a task.
pub struct ConnPool {
    inner: Arc<PoolInner>,
    gc_stop: CancellationToken,
}

impl ConnPool {
    /// Create a pool that scans for idle sessions every `interval` and
    /// closes those unused for longer than `expiry`.
    /// Start a pool whose collector runs every `interval`.  A zero interval
    /// falls back to [`DEFAULT_CONN_POOL_INTERVAL`].
    pub fn new(connector: Arc<dyn Connector>, interval: Duration, expiry: Duration) -> Self {
        let interval = if interval.is_zero() {
            warn!(
                default = ?DEFAULT_CONN_POOL_INTERVAL,
                "zero session pool interval, using default"
            );
            DEFAULT_CONN_POOL_INTERVAL
        } else {
            interval
        };
        let inner = Arc::new(PoolInner {
            connector,
            expiry,
            epoch: Instant::now(),
            conns: RwLock::new(HashMap::new()),
        });
        let gc_stop = CancellationToken::new();
        tokio::spawn(run_gc(Arc::downgrade(&inner), interval, gc_stop.clone()));
        Self { inner, gc_stop }
    }

    pub fn from_settings(connector: Arc<dyn Connector>, settings: &JournalSettings) -> Self {
        Self::new(
            connector,
            settings.conn_pool_interval,
            settings.conn_pool_expiry,
        )
    }

    async fn unique_key(monitors: &str, user: &str, keyfile: &Path) -> Result<(String, String)> {
        let key = tokio::fs::read_to_string(keyfile).await.map_err(|e| {
            JournalError::Config(format!("could not open keyfile {}: {e}", keyfile.display()))
        })?;
        Ok((format!("{monitors}|{user}|{key}"), key))
    }

    fn lookup(&self, unique: &str) -> Option<Arc<dyn Cluster>> {
        let now = self.inner.now_ms();
        let conns = self
            .inner
            .conns
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        conns.get(unique).map(|ce| ce.get(now))
    }

    /// Return a session for the given cluster and user, opening one when
    /// none is pooled.  Hand it back with [`ConnPool::put`].
    pub async fn get(
        &self,
        monitors: &str,
        user: &str,
        keyfile: &Path,
    ) -> Result<Arc<dyn Cluster>> {
        let (unique, key) = Self::unique_key(monitors, user, keyfile).await?;

        if let Some(conn) = self.lookup(&unique) {
            return Ok(conn);
        }

        let conn = self
            .inner
            .connector
            .connect(monitors, user, &key)
            .await
            .map_err(|e| JournalError::Backend(format!("connecting failed: {e}")))?;

        let now = self.inner.now_ms();
        let mut conns = self
            .inner
            .conns
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = conns.get(&unique) {
            // lost the race against a concurrent get()
            conn.shutdown();
            return Ok(existing.get(now));
        }
        conns.insert(
            unique,
            ConnEntry {
                conn: Arc::clone(&conn),
                last_used: AtomicU64::new(now),
                users: AtomicUsize::new(1),
            },
        );
        debug!(%monitors, %user, "new cluster session pooled");
        Ok(conn)
    }

    /// Add a reference to a pooled session.  Returns `None` when the
    /// session is not (or no longer) in the pool.
    pub fn copy(&self, conn: &Arc<dyn Cluster>) -> Option<Arc<dyn Cluster>> {
        let now = self.inner.now_ms();
        let conns = self
            .inner
            .conns
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        conns
            .values()
            .find(|ce| same_session(&ce.conn, conn))
            .map(|ce| ce.get(now))
    }

    /// Drop a reference obtained from [`ConnPool::get`] or [`ConnPool::copy`].
    pub fn put(&self, conn: &Arc<dyn Cluster>) {
        let conns = self
            .inner
            .conns
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ce) = conns.values().find(|ce| same_session(&ce.conn, conn)) {
            ce.put();
        }
    }

    /// Close every idle, expired session now.
    pub fn gc(&self) {
        self.inner.gc();
    }

    /// Number of pooled sessions.
    pub fn len(&self) -> usize {
        self.inner
            .conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the collector and close every session.
    ///
    /// # Panics
    ///
    /// Panics when a session still has users: an operation is in flight and
    /// the caller tore the pool down underneath it.
    pub fn destroy(&self) {
        self.gc_stop.cancel();
        let mut conns = self
            .inner
            .conns
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for ce in conns.values() {
            if ce.users.load(Ordering::SeqCst) != 0 {
                panic!("this connEntry still has users, operations might still be in-flight");
            }
        }
        for (_, ce) in conns.drain() {
            ce.conn.shutdown();
        }
        info!("connection pool destroyed");
    }
}

impl Drop for ConnPool {
    fn drop(&mut self) {
        self.gc_stop.cancel();
    }
}

async fn run_gc(inner: Weak<PoolInner>, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { return };
                inner.gc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rados::memory::{MemoryConnector, MemoryStore};

    struct Fixture {
        _tmp: tempfile::TempDir,
        keyfile: std::path::PathBuf,
        connector: Arc<MemoryConnector>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let keyfile = tmp.path().join("keyfile");
        std::fs::write(&keyfile, "AQD-secret").unwrap();
        Fixture {
            keyfile,
            connector: Arc::new(MemoryConnector::new(MemoryStore::new())),
            _tmp: tmp,
        }
    }

    fn pool(f: &Fixture) -> ConnPool {
        ConnPool::new(
            Arc::clone(&f.connector) as Arc<dyn Connector>,
            Duration::from_secs(60),
            Duration::from_secs(120),
        )
    }

    #[tokio::test]
    async fn get_reuses_session_for_same_key_contents() {
        let f = fixture();
        let cp = pool(&f);

        let other = f.keyfile.with_file_name("keyfile-copy");
        std::fs::write(&other, "AQD-secret").unwrap();

        let a = cp.get("mon1", "admin", &f.keyfile).await.unwrap();
        let b = cp.get("mon1", "admin", &other).await.unwrap();
        assert!(same_session(&a, &b));
        assert_eq!(f.connector.connects(), 1);
        assert_eq!(cp.len(), 1);

        let c = cp.get("mon1", "other-user", &f.keyfile).await.unwrap();
        assert!(!same_session(&a, &c));
        assert_eq!(cp.len(), 2);

        cp.put(&a);
        cp.put(&b);
        cp.put(&c);
        cp.destroy();
    }

    #[tokio::test]
    async fn missing_keyfile_is_an_error() {
        let f = fixture();
        let cp = pool(&f);
        let res = cp.get("mon1", "admin", Path::new("/nonexistent/keyfile")).await;
        assert!(matches!(res, Err(JournalError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn gc_closes_only_idle_expired_sessions() {
        let f = fixture();
        let cp = pool(&f);

        let held = cp.get("mon1", "admin", &f.keyfile).await.unwrap();
        let idle = cp.get("mon2", "admin", &f.keyfile).await.unwrap();
        cp.put(&idle);

        tokio::time::advance(Duration::from_secs(121)).await;
        cp.gc();

        assert_eq!(cp.len(), 1);
        assert!(cp.copy(&idle).is_none());
        assert!(cp.copy(&held).is_some());

        cp.put(&held);
        cp.put(&held);
        cp.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn background_collector_runs() {
        let f = fixture();
        let cp = pool(&f);

        let conn = cp.get("mon1", "admin", &f.keyfile).await.unwrap();
        cp.put(&conn);

        // expiry is 120s and the collector ticks every 60s
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert!(cp.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_uses_default() {
        let f = fixture();
        let cp = ConnPool::new(
            Arc::clone(&f.connector) as Arc<dyn Connector>,
            Duration::ZERO,
            Duration::from_secs(30),
        );

        let conn = cp.get("mon1", "admin", &f.keyfile).await.unwrap();
        cp.put(&conn);
        drop(conn);

        // the collector still ticks, at the default interval
        tokio::time::sleep(DEFAULT_CONN_POOL_INTERVAL / 2).await;
        assert!(!cp.is_empty());
        tokio::time::sleep(DEFAULT_CONN_POOL_INTERVAL).await;
        assert!(cp.is_empty());
    }

    #[tokio::test]
    async fn copy_adds_a_reference() {
        let f = fixture();
        let cp = pool(&f);

        let conn = cp.get("mon1", "admin", &f.keyfile).await.unwrap();
        let copy = cp.copy(&conn).unwrap();
        assert!(same_session(&conn, &copy));

        cp.put(&conn);
        cp.put(&copy);
        cp.destroy();
        assert!(cp.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "still has users")]
    async fn destroy_with_users_panics() {
        let f = fixture();
        let cp = pool(&f);
        let _conn = cp.get("mon1", "admin", &f.keyfile).await.unwrap();
        cp.destroy();
    }
}
