//! Kernel mount backends.
//!
//! The lifecycle manager mounts through a [`FilesystemBridge`] and keeps the
//! returned [`BridgeSession`] until unmount. [`FuseBridge`] is the real
//! thing; [`crate::testing::LoopbackBridge`] serves the same handler
//! in-process for tests.

use crate::async_bridge::CallBridge;
use crate::config::MountConfig;
use crate::error::MountError;
use crate::handlers::OpHandler;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Something that can expose a routed handler at an OS mountpoint.
pub trait FilesystemBridge: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Mounts `handler` at `mountpoint`. Calls are run on `runtime`.
    ///
    /// Blocking; call from a blocking context.
    fn mount(
        &self,
        handler: Arc<dyn OpHandler>,
        mountpoint: &Path,
        runtime: Handle,
        config: &MountConfig,
    ) -> Result<Box<dyn BridgeSession>, MountError>;
}

/// An active mount.
pub trait BridgeSession: Send {
    fn mountpoint(&self) -> &Path;

    /// The bridge running this session's calls, if it has one to drain.
    fn calls(&self) -> Option<CallBridge> {
        None
    }

    /// Unmounts. Blocking.
    fn unmount(self: Box<Self>) -> Result<(), MountError>;
}

/// Forcibly detaches whatever is mounted at `mountpoint`.
///
/// Used for stale mounts left by a crashed service. Does not check that the
/// mount belongs to this process.
pub fn force_unmount(mountpoint: &Path) -> Result<(), MountError> {
    #[cfg(target_os = "macos")]
    {
        let attempts: [(&str, &[&str]); 2] = [("diskutil", &["unmount", "force"]), ("umount", &["-f"])];
        run_unmount(mountpoint, &attempts)
    }

    #[cfg(target_os = "linux")]
    {
        let attempts: [(&str, &[&str]); 2] = [("fusermount", &["-uz"]), ("umount", &["-l"])];
        run_unmount(mountpoint, &attempts)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(MountError::Unmount(format!(
            "force unmount not supported on this platform for {}",
            mountpoint.display()
        )))
    }
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn run_unmount(mountpoint: &Path, attempts: &[(&str, &[&str])]) -> Result<(), MountError> {
    use std::process::Command;

    let mut last = String::new();
    for (program, args) in attempts {
        match Command::new(program).args(*args).arg(mountpoint).output() {
            Ok(output) if output.status.success() => {
                tracing::info!(mountpoint = %mountpoint.display(), program, "force unmount succeeded");
                return Ok(());
            }
            Ok(output) => {
                last = String::from_utf8_lossy(&output.stderr).trim().to_string();
                tracing::debug!(program, stderr = %last, "force unmount attempt failed");
            }
            Err(e) => {
                last = e.to_string();
                tracing::debug!(program, error = %e, "could not run unmount tool");
            }
        }
    }
    Err(MountError::Unmount(format!(
        "{}: {last}",
        mountpoint.display()
    )))
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
pub use fuse::{FuseBridge, FuseSession};

#[cfg(any(target_os = "macos", target_os = "linux"))]
mod fuse {
    use super::{BridgeSession, FilesystemBridge, force_unmount};
    use crate::async_bridge::CallBridge;
    use crate::config::MountConfig;
    use crate::error::MountError;
    use crate::filesystem::RoutedFs;
    use crate::handlers::OpHandler;
    use fuser::{BackgroundSession, MountOption};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};
    use tokio::runtime::Handle;

    /// Timeout for graceful session.join() before forcing unmount.
    /// The join thread may leak on timeout, which beats blocking forever.
    const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

    /// Polling interval while waiting for the mount to come up.
    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Mounts through fuser (libfuse on macOS, the kernel protocol directly
    /// on Linux).
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FuseBridge;

    impl FuseBridge {
        pub fn new() -> Self {
            Self
        }

        /// Mounts with spawn_mount2 on a helper thread, so a mount syscall
        /// stuck on a stale mountpoint cannot hang the caller.
        fn spawn_mount_with_timeout(
            fs: RoutedFs,
            mountpoint: &Path,
            options: &[MountOption],
            timeout: Duration,
        ) -> Result<BackgroundSession, MountError> {
            let mountpoint = mountpoint.to_path_buf();
            let options = options.to_vec();
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(fuser::spawn_mount2(fs, &mountpoint, &options));
            });
            match rx.recv_timeout(timeout) {
                Ok(Ok(session)) => Ok(session),
                Ok(Err(e)) => Err(MountError::Mount(e)),
                Err(mpsc::RecvTimeoutError::Timeout) => Err(MountError::Mount(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "mount timed out; the mountpoint may be a stale FUSE mount",
                ))),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(MountError::Mount(
                    std::io::Error::other("mount thread terminated unexpectedly"),
                )),
            }
        }

        /// Polls until the mountpoint's device differs from its parent's.
        fn wait_for_mount(mountpoint: &Path, timeout: Duration) -> Result<(), MountError> {
            use std::os::unix::fs::MetadataExt;

            let deadline = Instant::now() + timeout;
            let parent = mountpoint.parent().unwrap_or(Path::new("/"));
            while Instant::now() < deadline {
                if let (Ok(path_meta), Ok(parent_meta)) =
                    (std::fs::metadata(mountpoint), std::fs::metadata(parent))
                    && path_meta.dev() != parent_meta.dev()
                {
                    tracing::debug!(mountpoint = %mountpoint.display(), "FUSE mount active");
                    return Ok(());
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(MountError::Mount(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("FUSE mount did not become ready within {timeout:?}"),
            )))
        }
    }

    impl FilesystemBridge for FuseBridge {
        fn name(&self) -> &'static str {
            "FUSE"
        }

        fn is_available(&self) -> bool {
            #[cfg(target_os = "macos")]
            {
                Path::new("/Library/Filesystems/macfuse.fs").exists()
            }
            #[cfg(target_os = "linux")]
            {
                Path::new("/dev/fuse").exists()
            }
        }

        fn mount(
            &self,
            handler: Arc<dyn OpHandler>,
            mountpoint: &Path,
            runtime: Handle,
            config: &MountConfig,
        ) -> Result<Box<dyn BridgeSession>, MountError> {
            if !self.is_available() {
                return Err(MountError::BridgeUnavailable(
                    "FUSE is not available. Ensure the fuse kernel module (or macFUSE) is installed."
                        .to_string(),
                ));
            }
            if !mountpoint.exists() {
                std::fs::create_dir_all(mountpoint)?;
            }

            let calls = CallBridge::new(runtime, config.call_timeout);
            let fs = RoutedFs::new(handler, calls.clone(), config.attr_ttl);

            #[allow(unused_mut)]
            let mut options = vec![
                MountOption::FSName("drivefs".to_string()),
                MountOption::Subtype("drivefs".to_string()),
                MountOption::AutoUnmount,
                MountOption::DefaultPermissions,
            ];
            #[cfg(target_os = "macos")]
            {
                options.push(MountOption::CUSTOM("volname=Drives".to_string()));
                options.push(MountOption::CUSTOM("daemon_timeout=30".to_string()));
            }

            tracing::info!(mountpoint = %mountpoint.display(), "starting FUSE mount");
            let session =
                Self::spawn_mount_with_timeout(fs, mountpoint, &options, config.mount_timeout)?;
            Self::wait_for_mount(mountpoint, config.mount_timeout)?;
            tracing::info!(mountpoint = %mountpoint.display(), "FUSE mount successful");

            Ok(Box::new(FuseSession {
                session: Some(session),
                mountpoint: mountpoint.to_path_buf(),
                calls,
            }))
        }
    }

    /// A live fuser session. Dropping it unmounts.
    pub struct FuseSession {
        session: Option<BackgroundSession>,
        mountpoint: PathBuf,
        calls: CallBridge,
    }

    impl FuseSession {
        /// Joins the session thread, forcing the unmount if it does not
        /// finish within [`JOIN_TIMEOUT`].
        fn join(&mut self) -> bool {
            let Some(session) = self.session.take() else {
                return true;
            };
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                session.join();
                let _ = tx.send(());
            });
            if rx.recv_timeout(JOIN_TIMEOUT).is_ok() {
                return true;
            }
            tracing::warn!(
                mountpoint = %self.mountpoint.display(),
                "session.join() timed out after {JOIN_TIMEOUT:?}, forcing unmount"
            );
            if let Err(e) = force_unmount(&self.mountpoint) {
                tracing::warn!(error = %e, "force unmount failed");
            }
            false
        }
    }

    impl BridgeSession for FuseSession {
        fn mountpoint(&self) -> &Path {
            &self.mountpoint
        }

        fn calls(&self) -> Option<CallBridge> {
            Some(self.calls.clone())
        }

        fn unmount(mut self: Box<Self>) -> Result<(), MountError> {
            tracing::info!(mountpoint = %self.mountpoint.display(), "unmounting FUSE filesystem");
            if self.join() {
                Ok(())
            } else {
                Err(MountError::Unmount(format!(
                    "{} did not unmount cleanly",
                    self.mountpoint.display()
                )))
            }
        }
    }

    impl Drop for FuseSession {
        fn drop(&mut self) {
            self.join();
        }
    }
}
