//! In-process object store.
//!
//! [`MemoryStore`] keeps pools, objects and their omaps in concurrent maps
//! and is shared by every session a [`MemoryConnector`] hands out, so two
//! sessions observe each other's writes just like two clients of one
//! cluster.  Objects are keyed by pool *id*, which keeps them reachable
//! across [`MemoryStore::rename_pool`].

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Cluster, Connector, IoContext, RadosError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    pool_id: i64,
    namespace: String,
    oid: String,
}

/// Shared cluster state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Pool id to pool name.
    pools: DashMap<i64, String>,
    next_pool_id: AtomicI64,
    objects: DashMap<ObjectKey, BTreeMap<String, Vec<u8>>>,
    /// One-shot failure for the next `set_omap` on an oid with this prefix.
    fail_set_omap: Mutex<Option<String>>,
    /// One-shot stall: the matching `set_omap` fires the token and never
    /// completes.
    stall_set_omap: Mutex<Option<(String, CancellationToken)>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pool_id: AtomicI64::new(1),
            ..Default::default()
        })
    }

    /// Create a pool with the next free id and return that id.
    pub fn create_pool(&self, name: &str) -> i64 {
        let id = self.next_pool_id.fetch_add(1, Ordering::SeqCst);
        self.pools.insert(id, name.to_owned());
        id
    }

    /// Create a pool with a caller-chosen id.
    pub fn create_pool_with_id(&self, name: &str, id: i64) {
        self.pools.insert(id, name.to_owned());
        self.next_pool_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Delete a pool and every object in it.
    pub fn delete_pool(&self, name: &str) {
        if let Some(id) = self.lookup_pool(name) {
            self.pools.remove(&id);
            self.objects.retain(|k, _| k.pool_id != id);
        }
    }

    pub fn rename_pool(&self, from: &str, to: &str) -> bool {
        match self.lookup_pool(from) {
            Some(id) => {
                self.pools.insert(id, to.to_owned());
                true
            }
            None => false,
        }
    }

    /// Whether `oid` exists in `pool`/`namespace`.
    pub fn object_exists(&self, pool: &str, namespace: &str, oid: &str) -> bool {
        self.key(pool, namespace, oid)
            .is_some_and(|k| self.objects.contains_key(&k))
    }

    /// Snapshot of an object's omap as UTF-8 strings.
    pub fn omap(&self, pool: &str, namespace: &str, oid: &str) -> Option<BTreeMap<String, String>> {
        let key = self.key(pool, namespace, oid)?;
        self.objects.get(&key).map(|omap| {
            omap.iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                .collect()
        })
    }

    /// Remove an object behind the journal's back.
    pub fn remove_object(&self, pool: &str, namespace: &str, oid: &str) -> bool {
        self.key(pool, namespace, oid)
            .is_some_and(|k| self.objects.remove(&k).is_some())
    }

    /// Make the next `set_omap` on an oid starting with `oid_prefix` fail.
    pub fn fail_next_set_omap(&self, oid_prefix: &str) {
        *self
            .fail_set_omap
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(oid_prefix.to_owned());
    }

    fn take_set_omap_failure(&self, oid: &str) -> bool {
        let mut guard = self
            .fail_set_omap
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.as_deref().is_some_and(|p| oid.starts_with(p)) {
            *guard = None;
            return true;
        }
        false
    }

    /// Make the next `set_omap` on an oid starting with `oid_prefix` cancel
    /// `token` and then hang, as a request cancelled mid-write would.
    pub fn cancel_next_set_omap(&self, oid_prefix: &str, token: CancellationToken) {
        *self
            .stall_set_omap
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((oid_prefix.to_owned(), token));
    }

    fn take_set_omap_stall(&self, oid: &str) -> Option<CancellationToken> {
        let mut guard = self
            .stall_set_omap
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.as_ref().is_some_and(|(p, _)| oid.starts_with(p.as_str())) {
            return guard.take().map(|(_, token)| token);
        }
        None
    }

    fn lookup_pool(&self, name: &str) -> Option<i64> {
        self.pools
            .iter()
            .find(|entry| entry.value() == name)
            .map(|entry| *entry.key())
    }

    fn key(&self, pool: &str, namespace: &str, oid: &str) -> Option<ObjectKey> {
        self.lookup_pool(pool).map(|pool_id| ObjectKey {
            pool_id,
            namespace: namespace.to_owned(),
            oid: oid.to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Hands out sessions on a shared [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            connects: AtomicUsize::new(0),
        }
    }

    /// Number of sessions opened so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        monitors: &str,
        user: &str,
        _key: &str,
    ) -> Result<Arc<dyn Cluster>, RadosError> {
        if monitors.is_empty() {
            return Err(RadosError::Other("no monitors given".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        debug!(%monitors, %user, "memory cluster session opened");
        Ok(Arc::new(MemorySession {
            store: Arc::clone(&self.store),
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One session on a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    store: Arc<MemoryStore>,
    alive: Arc<AtomicBool>,
}

impl MemorySession {
    pub fn is_shut_down(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RadosError> {
        if self.is_shut_down() {
            return Err(RadosError::Shutdown);
        }
        Ok(())
    }
}

#[async_trait]
impl Cluster for MemorySession {
    async fn pool_id(&self, pool: &str) -> Result<i64, RadosError> {
        self.check()?;
        self.store
            .lookup_pool(pool)
            .ok_or_else(|| RadosError::NotFound(format!("pool {pool}")))
    }

    async fn pool_name(&self, pool_id: i64) -> Result<String, RadosError> {
        self.check()?;
        self.store
            .pools
            .get(&pool_id)
            .map(|name| name.value().clone())
            .ok_or_else(|| RadosError::NotFound(format!("pool id {pool_id}")))
    }

    async fn io_context(
        &self,
        pool: &str,
        namespace: &str,
    ) -> Result<Box<dyn IoContext>, RadosError> {
        self.check()?;
        let pool_id = self
            .store
            .lookup_pool(pool)
            .ok_or_else(|| RadosError::NotFound(format!("pool {pool}")))?;
        Ok(Box::new(MemoryIoContext {
            store: Arc::clone(&self.store),
            alive: Arc::clone(&self.alive),
            pool_id,
            namespace: namespace.to_owned(),
        }))
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// I/O context
// ---------------------------------------------------------------------------

struct MemoryIoContext {
    store: Arc<MemoryStore>,
    alive: Arc<AtomicBool>,
    pool_id: i64,
    namespace: String,
}

impl MemoryIoContext {
    fn key(&self, oid: &str) -> Result<ObjectKey, RadosError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(RadosError::Shutdown);
        }
        // the pool may have been deleted after the context was opened
        if !self.store.pools.contains_key(&self.pool_id) {
            return Err(RadosError::NotFound(format!("pool id {}", self.pool_id)));
        }
        Ok(ObjectKey {
            pool_id: self.pool_id,
            namespace: self.namespace.clone(),
            oid: oid.to_owned(),
        })
    }
}

#[async_trait]
impl IoContext for MemoryIoContext {
    async fn list_omap_values(
        &self,
        oid: &str,
        start_after: &str,
        prefix: &str,
        max: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, RadosError> {
        let key = self.key(oid)?;
        let omap = self
            .store
            .objects
            .get(&key)
            .ok_or_else(|| RadosError::NotFound(format!("object {oid}")))?;
        let lower = if start_after.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(start_after)
        };
        Ok(omap
            .range::<str, _>((lower, Bound::Unbounded))
            .filter(|(k, _)| k.starts_with(prefix))
            .take(max)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_omap(
        &self,
        oid: &str,
        pairs: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), RadosError> {
        let key = self.key(oid)?;
        if self.store.take_set_omap_failure(oid) {
            return Err(RadosError::Other(format!("injected set_omap failure on {oid}")));
        }
        if let Some(token) = self.store.take_set_omap_stall(oid) {
            token.cancel();
            std::future::pending::<()>().await;
        }
        let mut omap = self.store.objects.entry(key).or_default();
        for (k, v) in pairs {
            omap.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn rm_omap_keys(&self, oid: &str, keys: &[String]) -> Result<(), RadosError> {
        let key = self.key(oid)?;
        let mut omap = self
            .store
            .objects
            .get_mut(&key)
            .ok_or_else(|| RadosError::NotFound(format!("object {oid}")))?;
        for k in keys {
            omap.remove(k);
        }
        Ok(())
    }

    async fn create(&self, oid: &str, exclusive: bool) -> Result<(), RadosError> {
        let key = self.key(oid)?;
        match self.store.objects.entry(key) {
            Entry::Occupied(_) if exclusive => Err(RadosError::Exists(format!("object {oid}"))),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(BTreeMap::new());
                Ok(())
            }
        }
    }

    async fn remove(&self, oid: &str) -> Result<(), RadosError> {
        let key = self.key(oid)?;
        self.store
            .objects
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| RadosError::NotFound(format!("object {oid}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(store: &Arc<MemoryStore>) -> Arc<dyn Cluster> {
        MemoryConnector::new(Arc::clone(store))
            .connect("mon1", "admin", "key")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn exclusive_create() {
        let store = MemoryStore::new();
        store.create_pool("rbd");
        let ioctx = session(&store).await.io_context("rbd", "").await.unwrap();

        ioctx.create("obj", true).await.unwrap();
        assert_eq!(
            ioctx.create("obj", true).await,
            Err(RadosError::Exists("object obj".into()))
        );
        ioctx.create("obj", false).await.unwrap();
    }

    #[tokio::test]
    async fn namespaces_are_disjoint() {
        let store = MemoryStore::new();
        store.create_pool("rbd");
        let s = session(&store).await;
        let a = s.io_context("rbd", "a").await.unwrap();
        let b = s.io_context("rbd", "b").await.unwrap();

        a.create("obj", true).await.unwrap();
        b.create("obj", true).await.unwrap();
        assert!(store.object_exists("rbd", "a", "obj"));
        assert!(!store.object_exists("rbd", "", "obj"));
    }

    #[tokio::test]
    async fn listing_pages_in_key_order() {
        let store = MemoryStore::new();
        store.create_pool("rbd");
        let ioctx = session(&store).await.io_context("rbd", "").await.unwrap();
        let pairs: BTreeMap<String, Vec<u8>> = ["csi.a", "csi.b", "csi.c", "other"]
            .iter()
            .map(|k| ((*k).to_owned(), k.as_bytes().to_vec()))
            .collect();
        ioctx.set_omap("dir", &pairs).await.unwrap();

        let page = ioctx.list_omap_values("dir", "", "csi.", 2).await.unwrap();
        let keys: Vec<_> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["csi.a", "csi.b"]);

        let page = ioctx.list_omap_values("dir", "csi.b", "csi.", 2).await.unwrap();
        let keys: Vec<_> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["csi.c"]);
    }

    #[tokio::test]
    async fn shutdown_session_rejects_io() {
        let store = MemoryStore::new();
        store.create_pool("rbd");
        let s = session(&store).await;
        let ioctx = s.io_context("rbd", "").await.unwrap();
        s.shutdown();
        assert_eq!(ioctx.remove("x").await, Err(RadosError::Shutdown));
        assert!(matches!(s.pool_id("rbd").await, Err(RadosError::Shutdown)));
    }

    #[tokio::test]
    async fn rename_keeps_objects() {
        let store = MemoryStore::new();
        let id = store.create_pool("old");
        let s = session(&store).await;
        s.io_context("old", "").await.unwrap().create("obj", true).await.unwrap();

        assert!(store.rename_pool("old", "new"));
        assert_eq!(s.pool_name(id).await.unwrap(), "new");
        assert!(store.object_exists("new", "", "obj"));
        assert!(matches!(s.pool_id("old").await, Err(RadosError::NotFound(_))));
    }
}
