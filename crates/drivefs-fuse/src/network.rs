//! The virtual network directory and by-key dispatch.
//!
//! The root chain has three rules, tried in order:
//!
//! | id             | matches               | ops                      |
//! |----------------|-----------------------|--------------------------|
//! | `root`         | `/`                   | readdir                  |
//! | `networkinfo`  | `/Network`, `/Network/` | getattr, readdir, getxattr, opendir, releasedir |
//! | `network`      | `/Network/...`        | all                      |
//!
//! Everything else goes to the root drive's base handlers. The `network`
//! rule forwards into a nested router that only sees the part of the path
//! after `/Network`, where the `bykey` rule parses
//! `/<hex key>[+<version>][+<hash>]/<rest>`, resolves the drive through the
//! [`DriveCache`] and replays the call against it with `<rest>` as the path.

use crate::drive_cache::{CachePolicy, DriveCache, DriveOpener, display_name};
use crate::error::ToErrno;
use crate::handlers::{OpHandler, Owner};
use crate::network_set::NetworkSet;
use crate::ops::{FsCall, FsResult, OpName, OpSet, Reply};
use crate::router::{RouteHandler, RouteMatch, RouteRule, Router};
use async_trait::async_trait;
use drivefs_core::{DriveKey, Stat};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;

/// Operations the by-key rule intercepts. Anything else under the network
/// directory falls through to the root drive with the full path.
pub const BY_KEY_OPS: [OpName; 12] = [
    OpName::Readdir,
    OpName::Getattr,
    OpName::Open,
    OpName::Read,
    OpName::Write,
    OpName::Flush,
    OpName::Release,
    OpName::Releasedir,
    OpName::Opendir,
    OpName::Getxattr,
    OpName::Symlink,
    OpName::Readlink,
];

const BY_KEY_SEARCH: &str = r"^(/(?P<key>\w+)(\+(?P<version>\d+))?(\+(?P<hash>\w+))?/?)?";

struct NetworkState {
    network_dir: String,
    cache: DriveCache,
    visible: Mutex<NetworkSet>,
    started: SystemTime,
    owner: Owner,
    /// Base handlers of the root drive.
    base: Arc<dyn OpHandler>,
}

impl NetworkState {
    fn directory_stat(&self) -> Stat {
        Stat::directory(self.started).with_owner(self.owner.uid, self.owner.gid)
    }

    /// Directory listing of the network directory. The set may hold the same
    /// name twice; a listing may not.
    fn listing(&self) -> Vec<String> {
        let visible = self.visible.lock();
        let mut names: Vec<String> = Vec::with_capacity(visible.len());
        for name in visible.list() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// Routing layer in front of the root drive.
pub struct NetworkHandlers {
    state: Arc<NetworkState>,
    root: Arc<Router>,
}

impl NetworkHandlers {
    /// Builds the root chain around `base`, the root drive's handlers.
    pub fn new(
        base: Arc<dyn OpHandler>,
        opener: Arc<dyn DriveOpener>,
        network_dir: &str,
        policy: CachePolicy,
        owner: Owner,
    ) -> Result<Self, regex::Error> {
        let state = Arc::new(NetworkState {
            network_dir: network_dir.to_string(),
            cache: DriveCache::new(opener, policy),
            visible: Mutex::new(NetworkSet::new()),
            started: SystemTime::now(),
            owner,
            base: Arc::clone(&base),
        });

        let nested = Router::new(
            vec![RouteRule::new(
                "bykey",
                r"^/.+",
                BY_KEY_SEARCH,
                OpSet::only(&BY_KEY_OPS),
                Arc::new(ByKey {
                    state: Arc::clone(&state),
                }),
            )?],
            network_dir.chars().count() + 1,
            Arc::clone(&base),
        );

        let dir = regex::escape(network_dir);
        let root = Router::new(
            vec![
                RouteRule::new(
                    "root",
                    r"^/$",
                    r"^/$",
                    OpSet::only(&[OpName::Readdir]),
                    Arc::new(RootList {
                        state: Arc::clone(&state),
                    }),
                )?,
                RouteRule::new(
                    "networkinfo",
                    &format!("^/{dir}/?$"),
                    r".*",
                    OpSet::only(&[
                        OpName::Getattr,
                        OpName::Readdir,
                        OpName::Getxattr,
                        OpName::Opendir,
                        OpName::Releasedir,
                    ]),
                    Arc::new(NetworkInfo {
                        state: Arc::clone(&state),
                    }),
                )?,
                RouteRule::new(
                    "network",
                    &format!("^/{dir}/.+"),
                    &format!("^/{dir}/(?P<subpath>.*)"),
                    OpSet::All,
                    Arc::new(Forward {
                        nested: Arc::new(nested),
                    }),
                )?,
            ],
            0,
            base,
        );

        Ok(Self {
            state,
            root: Arc::new(root),
        })
    }

    /// The handler the kernel bridge should call.
    pub fn root_handler(&self) -> Arc<dyn OpHandler> {
        self.root.clone()
    }

    pub fn network_dir(&self) -> &str {
        &self.state.network_dir
    }

    /// Names currently listed in the network directory.
    pub fn visible(&self) -> Vec<String> {
        self.state.listing()
    }

    pub fn cache(&self) -> &DriveCache {
        &self.state.cache
    }

    /// Closes every by-key drive.
    pub async fn close(&self) {
        self.state.cache.close_all().await;
    }
}

#[async_trait]
impl OpHandler for NetworkHandlers {
    async fn call(&self, call: FsCall) -> FsResult {
        self.root.call(call).await
    }
}

/// `readdir /`: the root drive's entries plus the network directory.
struct RootList {
    state: Arc<NetworkState>,
}

#[async_trait]
impl RouteHandler for RootList {
    async fn handle(&self, _route: RouteMatch, call: FsCall) -> FsResult {
        match self.state.base.call(call).await? {
            Reply::Entries(mut names) => {
                if !names.contains(&self.state.network_dir) {
                    names.push(self.state.network_dir.clone());
                }
                Ok(Reply::Entries(names))
            }
            other => Ok(other),
        }
    }
}

/// The network directory itself.
struct NetworkInfo {
    state: Arc<NetworkState>,
}

#[async_trait]
impl RouteHandler for NetworkInfo {
    async fn handle(&self, _route: RouteMatch, call: FsCall) -> FsResult {
        match call {
            FsCall::Getxattr { .. } => Ok(Reply::Xattr(None)),
            FsCall::Getattr { .. } => Ok(Reply::Attr(self.state.directory_stat())),
            FsCall::Readdir { .. } => Ok(Reply::Entries(self.state.listing())),
            FsCall::Opendir { .. } => Ok(Reply::Opened { fh: 0 }),
            FsCall::Releasedir { .. } => Ok(Reply::Empty),
            other => self.state.base.call(other).await,
        }
    }
}

/// Hands calls under the network directory to the nested router.
struct Forward {
    nested: Arc<Router>,
}

#[async_trait]
impl RouteHandler for Forward {
    async fn handle(&self, _route: RouteMatch, call: FsCall) -> FsResult {
        self.nested.call(call).await
    }
}

/// `/<key>[+<version>][+<hash>]/<rest>` below the network directory.
struct ByKey {
    state: Arc<NetworkState>,
}

impl ByKey {
    /// Calls that name no drive, such as `/.Trash` probes from file managers.
    async fn keyless(&self, call: FsCall) -> FsResult {
        match call {
            FsCall::Readdir { .. } => Ok(Reply::Entries(Vec::new())),
            FsCall::Releasedir { .. } => Ok(Reply::Empty),
            FsCall::Getattr { .. } => Ok(Reply::Attr(self.state.directory_stat())),
            other => self.state.base.call(other).await,
        }
    }
}

#[async_trait]
impl RouteHandler for ByKey {
    async fn handle(&self, route: RouteMatch, call: FsCall) -> FsResult {
        let Some(token) = route.field("key") else {
            return self.keyless(call).await;
        };
        let key = match DriveKey::from_hex(token) {
            Ok(key) => key,
            Err(e) => {
                tracing::trace!(token, error = %e, "not a drive key");
                return Err(e.to_errno());
            }
        };
        // `+0` names the live drive, same as no version.
        let version = match route.field("version").map(str::parse::<u64>) {
            None => None,
            Some(Ok(v)) => Some(v).filter(|&v| v > 0),
            Some(Err(e)) => {
                tracing::trace!(token, error = %e, "version out of range");
                return Err(libc::ENOENT);
            }
        };

        let op = call.op();
        match op {
            OpName::Getxattr => return Ok(Reply::Xattr(None)),
            OpName::Symlink => return Err(libc::EPERM),
            _ => {}
        }

        let handle = match self.state.cache.resolve(key, version).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!(name = %display_name(&key, version), error = %e, "by-key resolution failed");
                return Err(libc::ENOENT);
            }
        };
        self.state.visible.lock().add(&handle.name());

        let rest = call
            .routed_path()
            .get(route.matched.len()..)
            .unwrap_or_default();
        let rest = if rest.is_empty() {
            "/".to_string()
        } else if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        };

        let result = handle.handlers().call(call.with_routed_path(rest)).await;
        match result {
            // Write errors carry byte-level meaning and pass through.
            Err(errno) if op.is_mutating() && op != OpName::Write && errno != libc::EPERM => {
                tracing::debug!(%op, errno, "by-key mutation failed");
                Err(libc::EPERM)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive_cache::DriveHandle;
    use crate::handlers::DriveHandlers;
    use bytes::Bytes;
    use drivefs_core::{Drive, DriveResult, DriveStore, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StoreOpener {
        store: MemoryStore,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl DriveOpener for StoreOpener {
        async fn open(&self, key: DriveKey, version: Option<u64>) -> DriveResult<DriveHandle> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let drive = self.store.open_drive(key, version).await?;
            Ok(DriveHandle::new(key, version, drive, Owner::current()))
        }
    }

    struct Fixture {
        store: MemoryStore,
        root: Arc<dyn Drive>,
        opener: Arc<StoreOpener>,
        net: NetworkHandlers,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let root = store.create_drive().await.unwrap();
        let opener = Arc::new(StoreOpener {
            store: store.connect(),
            opens: AtomicUsize::new(0),
        });
        let base = Arc::new(DriveHandlers::new(Arc::clone(&root), Owner::current()));
        let net = NetworkHandlers::new(
            base,
            opener.clone(),
            "Network",
            CachePolicy::Unbounded,
            Owner::current(),
        )
        .unwrap();
        Fixture {
            store,
            root,
            opener,
            net,
        }
    }

    fn readdir(path: &str) -> FsCall {
        FsCall::Readdir { path: path.into() }
    }

    fn read(path: &str) -> FsCall {
        FsCall::Read {
            path: path.into(),
            fh: 0,
            offset: 0,
            size: 4096,
        }
    }

    #[tokio::test]
    async fn test_root_listing_appends_network_dir() {
        let f = fixture().await;
        assert_eq!(
            f.net.call(readdir("/")).await,
            Ok(Reply::Entries(vec!["Network".into()]))
        );
        f.root.mkdir("/docs", 0o755).await.unwrap();
        assert_eq!(
            f.net.call(readdir("/")).await,
            Ok(Reply::Entries(vec!["docs".into(), "Network".into()]))
        );
    }

    #[tokio::test]
    async fn test_network_dir_stat_is_synthesized() {
        let f = fixture().await;
        for path in ["/Network", "/Network/"] {
            let Ok(Reply::Attr(stat)) = f.net.call(FsCall::Getattr { path: path.into() }).await
            else {
                panic!("no stat for {path}");
            };
            assert!(stat.is_dir());
            assert_eq!(stat.uid, Owner::current().uid);
        }
        assert_eq!(
            f.net.call(readdir("/Network")).await,
            Ok(Reply::Entries(vec![]))
        );
    }

    #[tokio::test]
    async fn test_by_key_read_and_listing() {
        let f = fixture().await;
        let other = f.store.create_drive().await.unwrap();
        other.write_file("/a.txt", b"by key").await.unwrap();
        let hex = other.key().to_hex();

        assert_eq!(
            f.net.call(read(&format!("/Network/{hex}/a.txt"))).await,
            Ok(Reply::Data(Bytes::from_static(b"by key")))
        );
        assert_eq!(
            f.net.call(readdir(&format!("/Network/{hex}"))).await,
            Ok(Reply::Entries(vec!["a.txt".into()]))
        );
        assert_eq!(f.net.visible(), vec![hex.clone()]);
        assert_eq!(
            f.net.call(readdir("/Network")).await,
            Ok(Reply::Entries(vec![hex]))
        );
        assert_eq!(f.opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_by_key_root_stat() {
        let f = fixture().await;
        let other = f.store.create_drive().await.unwrap();
        let path = format!("/Network/{}/", other.key().to_hex());
        let Ok(Reply::Attr(stat)) = f.net.call(FsCall::Getattr { path }).await else {
            panic!("no stat");
        };
        assert!(stat.is_dir());
    }

    #[tokio::test]
    async fn test_version_checkout_is_separate_entry() {
        let f = fixture().await;
        let other = f.store.create_drive().await.unwrap();
        other.write_file("/a.txt", b"one").await.unwrap();
        let v1 = other.version();
        other.write_file("/a.txt", b"two").await.unwrap();
        let hex = other.key().to_hex();

        assert_eq!(
            f.net.call(read(&format!("/Network/{hex}+{v1}/a.txt"))).await,
            Ok(Reply::Data(Bytes::from_static(b"one")))
        );
        assert_eq!(
            f.net.call(read(&format!("/Network/{hex}+0/a.txt"))).await,
            Ok(Reply::Data(Bytes::from_static(b"two")))
        );
        assert_eq!(f.net.visible(), vec![format!("{hex}+{v1}"), hex]);
    }

    #[tokio::test]
    async fn test_hash_suffix_is_accepted() {
        let f = fixture().await;
        let other = f.store.create_drive().await.unwrap();
        other.write_file("/a.txt", b"x").await.unwrap();
        let path = format!("/Network/{}+1+deadbeef/a.txt", other.key().to_hex());
        assert!(matches!(f.net.call(read(&path)).await, Ok(Reply::Data(_))));
    }

    #[tokio::test]
    async fn test_short_key_is_enoent() {
        let f = fixture().await;
        let short = "ab".repeat(17);
        assert_eq!(
            f.net.call(read(&format!("/Network/{short}/x"))).await,
            Err(libc::ENOENT)
        );
        assert_eq!(
            f.net.call(read("/Network/not-hex/x")).await,
            Err(libc::ENOENT)
        );
        assert_eq!(f.opener.opens.load(Ordering::SeqCst), 0);
        assert!(f.net.visible().is_empty());
    }

    #[tokio::test]
    async fn test_symlink_and_xattr_short_circuit() {
        let f = fixture().await;
        let hex = DriveKey::generate().to_hex();
        assert_eq!(
            f.net
                .call(FsCall::Symlink {
                    target: "/elsewhere".into(),
                    path: format!("/Network/{hex}/link"),
                })
                .await,
            Err(libc::EPERM)
        );
        assert_eq!(
            f.net
                .call(FsCall::Getxattr {
                    path: format!("/Network/{hex}/a"),
                    name: "user.x".into(),
                })
                .await,
            Ok(Reply::Xattr(None))
        );
        assert_eq!(f.opener.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_by_key_write_to_read_only_drive_is_eperm() {
        let f = fixture().await;
        let other = f.store.create_drive().await.unwrap();
        other.write_file("/a.txt", b"x").await.unwrap();
        let path = format!("/Network/{}+1/a.txt", other.key().to_hex());
        assert_eq!(
            f.net
                .call(FsCall::Write {
                    path,
                    fh: 0,
                    offset: 0,
                    data: Bytes::from_static(b"y"),
                })
                .await,
            Err(libc::EPERM)
        );
    }

    #[tokio::test]
    async fn test_by_key_write_errors_pass_through() {
        let f = fixture().await;
        let other = f.store.create_drive().await.unwrap();
        other.write_file("/a.txt", b"x").await.unwrap();
        other.mkdir("/dir", 0o755).await.unwrap();
        let write = |rest: &str| FsCall::Write {
            path: format!("/Network/{}{rest}", other.key().to_hex()),
            fh: 0,
            offset: 0,
            data: Bytes::from_static(b"y"),
        };
        assert_eq!(f.net.call(write("/a.txt")).await, Ok(Reply::Written(1)));
        assert_eq!(f.net.call(write("/dir")).await, Err(libc::EISDIR));
        assert_eq!(f.net.call(write("/missing.txt")).await, Err(libc::ENOENT));
    }

    #[tokio::test]
    async fn test_version_out_of_range_is_enoent() {
        let f = fixture().await;
        let other = f.store.create_drive().await.unwrap();
        other.write_file("/a.txt", b"x").await.unwrap();
        let path = format!("/Network/{}+99999999999999999999999/a.txt", other.key().to_hex());
        assert_eq!(f.net.call(read(&path)).await, Err(libc::ENOENT));
        assert_eq!(f.opener.opens.load(Ordering::SeqCst), 0);
        assert!(f.net.visible().is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_network_calls_fall_through_unmodified() {
        let f = fixture().await;
        let hex = DriveKey::generate().to_hex();
        // mkdir is not a by-key op: the root drive sees the full path and has
        // no network directory to create it in.
        assert_eq!(
            f.net
                .call(FsCall::Mkdir {
                    path: format!("/Network/{hex}/d"),
                    mode: 0o755,
                })
                .await,
            Err(libc::ENOENT)
        );
        assert_eq!(f.opener.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_keyless_paths() {
        let f = fixture().await;
        assert_eq!(
            f.net.call(readdir("/Network/.Trash")).await,
            Ok(Reply::Entries(vec![]))
        );
        assert!(matches!(
            f.net.call(FsCall::Getattr { path: "/Network/.hidden".into() }).await,
            Ok(Reply::Attr(_))
        ));
    }

    #[tokio::test]
    async fn test_close_makes_resolution_enoent() {
        let f = fixture().await;
        let other = f.store.create_drive().await.unwrap();
        f.net.close().await;
        assert_eq!(
            f.net
                .call(readdir(&format!("/Network/{}", other.key().to_hex())))
                .await,
            Err(libc::ENOENT)
        );
    }
}
