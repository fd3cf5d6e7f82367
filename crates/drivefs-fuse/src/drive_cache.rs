//! Lazily created, memoized per-drive handler sets.
//!
//! [`DriveCache::resolve`] returns the [`DriveHandle`] for a `(key, version)`
//! pair, opening the drive through a [`DriveOpener`] on first use. Concurrent
//! resolutions of the same uncached pair share one open: the first caller
//! leads, the rest wait for its outcome. Failures are handed to everyone who
//! waited and then forgotten, so the next resolution tries again.
//!
//! The cache is unbounded by default. [`CachePolicy::MaxHandles`] caps it and
//! closes the least recently resolved handle when the cap is exceeded.

use crate::error::{ResolveError, ToErrno};
use crate::handlers::{DriveHandlers, OpHandler, Owner};
use crate::heuristics::HeuristicsHandle;
use crate::single_flight::{Attach, FlightGuard, InFlight};
use async_trait::async_trait;
use dashmap::DashMap;
use drivefs_core::{Drive, DriveKey, DriveResult};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Identity of a cached handle.
pub type CacheKey = (DriveKey, Option<u64>);

/// Display name of a drive in the network directory: hex key, plus
/// `+version` for checkouts.
pub fn display_name(key: &DriveKey, version: Option<u64>) -> String {
    match version {
        Some(v) => format!("{}+{v}", key.to_hex()),
        None => key.to_hex(),
    }
}

/// Everything the filesystem needs to serve one drive.
pub struct DriveHandle {
    key: DriveKey,
    version: Option<u64>,
    handlers: Arc<DriveHandlers>,
    watcher: Option<HeuristicsHandle>,
}

impl DriveHandle {
    pub fn new(key: DriveKey, version: Option<u64>, drive: Arc<dyn Drive>, owner: Owner) -> Self {
        Self {
            key,
            version,
            handlers: Arc::new(DriveHandlers::new(drive, owner)),
            watcher: None,
        }
    }

    /// Attaches the mount watcher that lives as long as the handle.
    #[must_use]
    pub fn with_watcher(mut self, watcher: HeuristicsHandle) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn key(&self) -> DriveKey {
        self.key
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn name(&self) -> String {
        display_name(&self.key, self.version)
    }

    pub fn drive(&self) -> &Arc<dyn Drive> {
        self.handlers.drive()
    }

    /// The operation table bound to this drive.
    pub fn handlers(&self) -> Arc<dyn OpHandler> {
        self.handlers.clone()
    }

    /// Stops the watcher and closes the drive.
    pub async fn close(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
        if let Err(e) = self.drive().close().await {
            tracing::warn!(name = %self.name(), error = %e, "failed to close drive");
        }
    }
}

impl std::fmt::Debug for DriveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveHandle")
            .field("key", &self.key)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Opens drives for the cache.
#[async_trait]
pub trait DriveOpener: Send + Sync {
    /// Opens drive `key` and returns a ready handle.
    async fn open(&self, key: DriveKey, version: Option<u64>) -> DriveResult<DriveHandle>;
}

/// Bound on the number of cached handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    #[default]
    Unbounded,
    /// Keep at most this many handles, closing the least recently used.
    MaxHandles(NonZeroUsize),
}

type Outcome = Result<Arc<DriveHandle>, ResolveError>;

struct CacheEntry {
    handle: Arc<DriveHandle>,
    last_used: AtomicU64,
}

/// Memoizes [`DriveHandle`]s per `(key, version)`.
pub struct DriveCache {
    opener: Arc<dyn DriveOpener>,
    entries: DashMap<CacheKey, CacheEntry>,
    flights: InFlight<CacheKey, Outcome>,
    policy: CachePolicy,
    clock: AtomicU64,
    closed: AtomicBool,
}

impl DriveCache {
    pub fn new(opener: Arc<dyn DriveOpener>, policy: CachePolicy) -> Self {
        Self {
            opener,
            entries: DashMap::new(),
            flights: InFlight::new(),
            policy,
            clock: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the handle for `(key, version)`, creating it at most once.
    pub async fn resolve(&self, key: DriveKey, version: Option<u64>) -> Outcome {
        if self.closed.load(Ordering::Acquire) {
            return Err(ResolveError::Closed);
        }
        let ck = (key, version);
        if let Some(handle) = self.lookup(&ck) {
            return Ok(handle);
        }

        match self.flights.try_attach(ck) {
            Attach::Waiter(mut rx) => match rx.recv().await {
                Ok(outcome) => outcome,
                Err(_) => Err(ResolveError::Abandoned(display_name(&key, version))),
            },
            Attach::Leader => {
                let guard = FlightGuard::new(&self.flights, ck);
                // An earlier leader may have landed between lookup and attach.
                if let Some(handle) = self.lookup(&ck) {
                    guard.complete(Ok(Arc::clone(&handle)));
                    return Ok(handle);
                }
                let outcome = self.create(key, version).await;
                let waiters = guard.complete(outcome.clone());
                if waiters > 0 {
                    tracing::debug!(name = %display_name(&key, version), waiters, "shared drive creation");
                }
                outcome
            }
        }
    }

    async fn create(&self, key: DriveKey, version: Option<u64>) -> Outcome {
        let name = display_name(&key, version);
        tracing::debug!(%name, "opening drive");
        match self.opener.open(key, version).await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                if self.closed.load(Ordering::Acquire) {
                    handle.close().await;
                    return Err(ResolveError::Closed);
                }
                self.insert((key, version), Arc::clone(&handle));
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!(%name, error = %e, "failed to open drive");
                Err(ResolveError::Open {
                    name,
                    reason: e.to_string(),
                    errno: e.to_errno(),
                })
            }
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup(&self, ck: &CacheKey) -> Option<Arc<DriveHandle>> {
        let entry = self.entries.get(ck)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(&entry.handle))
    }

    fn insert(&self, ck: CacheKey, handle: Arc<DriveHandle>) {
        self.entries.insert(
            ck,
            CacheEntry {
                handle,
                last_used: AtomicU64::new(self.tick()),
            },
        );
        if let CachePolicy::MaxHandles(max) = self.policy {
            while self.entries.len() > max.get() {
                if !self.evict_one(&ck) {
                    break;
                }
            }
        }
    }

    /// Closes the least recently used handle other than `keep`.
    fn evict_one(&self, keep: &CacheKey) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|e| e.key() != keep)
            .min_by_key(|e| e.last_used.load(Ordering::Relaxed))
            .map(|e| *e.key());
        let Some((_, entry)) = victim.and_then(|k| self.entries.remove(&k)) else {
            return false;
        };
        tracing::debug!(name = %entry.handle.name(), "evicting drive handle");
        tokio::spawn(async move { entry.handle.close().await });
        true
    }

    pub fn contains(&self, key: &DriveKey, version: Option<u64>) -> bool {
        self.entries.contains_key(&(*key, version))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of creations currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight_count()
    }

    /// Closes every cached handle and refuses further resolutions.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let keys: Vec<CacheKey> = self.entries.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.handle.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivefs_core::{DriveError, DriveStore, MemoryStore};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct SlowOpener {
        store: MemoryStore,
        opens: AtomicUsize,
        fail: AtomicBool,
    }

    impl SlowOpener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                store: MemoryStore::new(),
                opens: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl DriveOpener for SlowOpener {
        async fn open(&self, key: DriveKey, version: Option<u64>) -> DriveResult<DriveHandle> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(DriveError::Io(std::io::Error::other("swarm unreachable")));
            }
            let drive = self.store.open_drive(key, version).await?;
            Ok(DriveHandle::new(key, version, drive, Owner::current()))
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolves_open_once() {
        let opener = SlowOpener::new();
        let cache = Arc::new(DriveCache::new(opener.clone(), CachePolicy::Unbounded));
        let key = DriveKey::generate();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.resolve(key, None).await })
            })
            .collect();
        let handles: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_versions_are_distinct_entries() {
        let opener = SlowOpener::new();
        let cache = DriveCache::new(opener.clone(), CachePolicy::Unbounded);
        let writer = opener.store.create_drive().await.unwrap();
        writer.write_file("/a", b"1").await.unwrap();

        let live = cache.resolve(writer.key(), None).await.unwrap();
        let pinned = cache.resolve(writer.key(), Some(1)).await.unwrap();
        assert!(!Arc::ptr_eq(&live, &pinned));
        assert_eq!(pinned.name(), format!("{}+1", writer.key().to_hex()));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_shared_but_not_cached() {
        let opener = SlowOpener::new();
        opener.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(DriveCache::new(opener.clone(), CachePolicy::Unbounded));
        let key = DriveKey::generate();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.resolve(key, None).await })
            })
            .collect();
        for res in futures::future::join_all(tasks).await {
            assert!(matches!(res.unwrap(), Err(ResolveError::Open { .. })));
        }
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        opener.fail.store(false, Ordering::SeqCst);
        assert!(cache.resolve(key, None).await.is_ok());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_max_handles_evicts_least_recent() {
        let opener = SlowOpener::new();
        let policy = CachePolicy::MaxHandles(NonZeroUsize::new(2).unwrap());
        let cache = DriveCache::new(opener.clone(), policy);
        let (a, b, c) = (DriveKey::generate(), DriveKey::generate(), DriveKey::generate());

        cache.resolve(a, None).await.unwrap();
        cache.resolve(b, None).await.unwrap();
        // Touch `a` so `b` becomes the oldest.
        cache.resolve(a, None).await.unwrap();
        cache.resolve(c, None).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&a, None));
        assert!(!cache.contains(&b, None));
        assert!(cache.contains(&c, None));
    }

    #[tokio::test]
    async fn test_close_all_refuses_new_work() {
        let opener = SlowOpener::new();
        let cache = DriveCache::new(opener, CachePolicy::Unbounded);
        let handle = cache.resolve(DriveKey::generate(), None).await.unwrap();
        cache.close_all().await;
        assert!(cache.is_empty());
        assert!(matches!(
            handle.drive().readdir("/").await,
            Err(DriveError::Closed)
        ));
        assert!(matches!(
            cache.resolve(DriveKey::generate(), None).await,
            Err(ResolveError::Closed)
        ));
    }
}
