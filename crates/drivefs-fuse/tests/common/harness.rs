//! Test harnesses for drivefs integration tests.
//!
//! [`TestService`] runs the full service over an in-memory store and the
//! loopback bridge, so routed calls can be issued without a kernel mount.
//! [`TestMount`] does the same through a real FUSE mount and is only built
//! with the `fuse-tests` feature.

// Not all tests use every helper
#![allow(dead_code)]

use bytes::Bytes;
use drivefs_core::{Drive, DriveKey, DriveStore, MemoryStore};
use drivefs_fuse::{
    DriveService, FsCall, FsResult, LoopbackBridge, MountConfig, Reply, ServiceClient,
    ServiceOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Mountpoint the loopback service pretends to use.
pub const TEST_MNT: &str = "/mnt/drivefs-test";

/// A running service over an in-memory store.
pub struct TestService {
    pub store: MemoryStore,
    pub bridge: LoopbackBridge,
    pub service: DriveService,
    pub root: Arc<dyn Drive>,
    pub config_path: PathBuf,
    _config_dir: TempDir,
}

impl TestService {
    /// Starts a service on a fresh writable root drive.
    pub async fn start() -> Self {
        Self::start_with(MountConfig::default()).await
    }

    pub async fn start_with(mount: MountConfig) -> Self {
        let store = MemoryStore::new();
        let root = store.create_drive().await.expect("create root drive");
        let config_dir = TempDir::new().expect("temp dir");
        let config_path = config_dir.path().join("fuse.json");
        let bridge = LoopbackBridge::new();
        let service = DriveService::new(
            Arc::new(store.connect()),
            Arc::new(bridge.clone()),
            ServiceOptions::default()
                .key(root.key())
                .mountpoint(TEST_MNT)
                .config_path(&config_path)
                .mount_config(mount),
        );
        service.open().await.expect("service open");
        Self {
            store,
            bridge,
            service,
            root,
            config_path,
            _config_dir: config_dir,
        }
    }

    /// A client pointed at this service's root drive and mountpoint.
    pub fn client(&self) -> ServiceClient {
        ServiceClient::new(Arc::new(self.store.connect()))
            .key(self.root.key())
            .mountpoint(TEST_MNT)
            .config_path(&self.config_path)
    }

    pub async fn call(&self, call: FsCall) -> FsResult {
        self.bridge.call(call).await
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<String>, i32> {
        match self.call(FsCall::Readdir { path: path.into() }).await? {
            Reply::Entries(names) => Ok(names),
            other => panic!("unexpected readdir reply: {other:?}"),
        }
    }

    /// Listing with a stable order, for set comparisons.
    pub async fn readdir_sorted(&self, path: &str) -> Result<Vec<String>, i32> {
        let mut names = self.readdir(path).await?;
        names.sort();
        Ok(names)
    }

    pub async fn getattr(&self, path: &str) -> FsResult {
        self.call(FsCall::Getattr { path: path.into() }).await
    }

    /// Opens, reads up to 1 MiB and releases, like `cat` would.
    pub async fn read_file(&self, path: &str) -> Result<Bytes, i32> {
        let Reply::Opened { fh } = self
            .call(FsCall::Open {
                path: path.into(),
                flags: libc::O_RDONLY,
            })
            .await?
        else {
            panic!("open did not return a handle");
        };
        let data = self
            .call(FsCall::Read {
                path: path.into(),
                fh,
                offset: 0,
                size: 1 << 20,
            })
            .await;
        self.call(FsCall::Release {
            path: path.into(),
            fh,
        })
        .await?;
        match data? {
            Reply::Data(bytes) => Ok(bytes),
            other => panic!("unexpected read reply: {other:?}"),
        }
    }

    /// Creates, writes and releases a file.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), i32> {
        let Reply::Created { fh, .. } = self
            .call(FsCall::Create {
                path: path.into(),
                mode: 0o100_644,
                flags: libc::O_WRONLY | libc::O_CREAT,
            })
            .await?
        else {
            panic!("create did not return a handle");
        };
        self.call(FsCall::Write {
            path: path.into(),
            fh,
            offset: 0,
            data: Bytes::copy_from_slice(data),
        })
        .await?;
        self.call(FsCall::Release {
            path: path.into(),
            fh,
        })
        .await?;
        Ok(())
    }

    /// Creates a drive in the same backend holding `files`.
    pub async fn drive_with(&self, files: &[(&str, &[u8])]) -> Arc<dyn Drive> {
        let drive = self.store.create_drive().await.expect("create drive");
        for (path, data) in files {
            drive.write_file(path, data).await.expect("write file");
        }
        drive
    }

    pub async fn close(&self) {
        self.service.close().await.expect("service close");
    }
}

/// `/Network/<hex>` style path for `key`.
pub fn by_key(key: &DriveKey, rest: &str) -> String {
    format!("/Network/{}{rest}", key.to_hex())
}

/// Host path under the test mountpoint.
pub fn host_path(rel: &str) -> PathBuf {
    Path::new(TEST_MNT).join(rel.trim_start_matches('/'))
}

/// Whether a FUSE device is present on this machine.
pub fn fuse_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::harness::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}

#[cfg(feature = "fuse-tests")]
pub use kernel::TestMount;

#[cfg(feature = "fuse-tests")]
mod kernel {
    use super::*;
    use drivefs_fuse::FuseBridge;
    use std::time::Duration;

    /// A service mounted through the kernel at a temporary directory.
    pub struct TestMount {
        pub runtime: tokio::runtime::Runtime,
        pub store: MemoryStore,
        pub service: DriveService,
        pub root: Arc<dyn Drive>,
        pub mount_path: PathBuf,
        _temp: TempDir,
    }

    impl TestMount {
        pub fn new() -> Result<Self, String> {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| format!("Failed to build runtime: {e}"))?;
            let temp = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
            let mount_path = temp.path().join("mnt");
            std::fs::create_dir(&mount_path)
                .map_err(|e| format!("Failed to create mount point: {e}"))?;

            let store = MemoryStore::new();
            let root = runtime
                .block_on(store.create_drive())
                .map_err(|e| format!("Failed to create root drive: {e}"))?;
            let service = DriveService::new(
                Arc::new(store.connect()),
                Arc::new(FuseBridge::new()),
                ServiceOptions::default()
                    .key(root.key())
                    .mountpoint(&mount_path)
                    .remember(false)
                    .mount_config(MountConfig::default().attr_ttl(Duration::ZERO)),
            );
            runtime
                .block_on(service.open())
                .map_err(|e| format!("Failed to mount: {e}"))?;
            Ok(Self {
                runtime,
                store,
                service,
                root,
                mount_path,
                _temp: temp,
            })
        }

        pub fn path(&self, rel: &str) -> PathBuf {
            self.mount_path.join(rel.trim_start_matches('/'))
        }

        pub fn list(&self, rel: &str) -> std::io::Result<Vec<String>> {
            let mut names: Vec<String> = std::fs::read_dir(self.path(rel))?
                .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect::<Result<_, _>>()?;
            names.sort();
            Ok(names)
        }

        pub fn drive_with(&self, files: &[(&str, &[u8])]) -> Arc<dyn Drive> {
            self.runtime.block_on(async {
                let drive = self.store.create_drive().await.expect("create drive");
                for (path, data) in files {
                    drive.write_file(path, data).await.expect("write file");
                }
                drive
            })
        }
    }

    impl Drop for TestMount {
        fn drop(&mut self) {
            if let Err(e) = self.runtime.block_on(self.service.close()) {
                eprintln!("[test-harness] Warning: close failed: {e}");
            }
        }
    }
}
