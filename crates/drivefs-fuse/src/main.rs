//! drivefs - mount a root drive, with every other drive reachable by key.
//!
//! Usage: drivefs start [--key <hex>] [--mnt <path>]
//!
//! ## Debugging with tokio-console
//!
//! Build with the `tokio-console` feature for async task introspection:
//! ```bash
//! cargo build -p drivefs-fuse --features tokio-console
//! ```
//!
//! Then run `tokio-console` in another terminal to connect (default: 127.0.0.1:6669).

#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drivefs_core::{Drive, DriveKey, DriveStore, MemoryStore};
use drivefs_fuse::config::{SavedConfig, default_mountpoint};
use drivefs_fuse::{DriveService, FilesystemBridge, MountConfig, ServiceOptions, force_unmount};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "drivefs")]
#[command(about = "Mount drives as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service and mount the root drive
    Start(StartArgs),

    /// Forcibly unmount a stale mountpoint
    ForceUnmount(ForceUnmountArgs),
}

#[derive(clap::Args)]
struct StartArgs {
    /// The root drive key (hex). Defaults to the saved key.
    #[arg(long, value_parser = parse_key)]
    key: Option<DriveKey>,

    /// The root drive mountpoint. Defaults to the saved one, then ~/Drives.
    #[arg(long)]
    mnt: Option<PathBuf>,

    /// Create a new root drive when no key is known
    #[arg(long)]
    create: bool,

    /// Do not load or save the root key and mountpoint
    #[arg(long)]
    no_remember: bool,

    /// Open the root drive without mounting it
    #[arg(long)]
    disable_fuse: bool,

    /// Name of the directory drives are browsed under
    #[arg(long, default_value = drivefs_fuse::config::DEFAULT_NETWORK_DIR)]
    network_dir: String,
}

#[derive(clap::Args)]
struct ForceUnmountArgs {
    /// Mountpoint to detach. Defaults to the saved one, then ~/Drives.
    #[arg(long)]
    mnt: Option<PathBuf>,
}

fn parse_key(s: &str) -> Result<DriveKey, String> {
    DriveKey::from_hex(s).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Start(args) => start(args),
        Commands::ForceUnmount(args) => {
            let mountpoint = resolve_mountpoint(args.mnt)?;
            force_unmount(&mountpoint)
                .with_context(|| format!("Failed to unmount {}", mountpoint.display()))?;
            info!("Unmounted {}", mountpoint.display());
            Ok(())
        }
    }
}

fn resolve_mountpoint(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(mnt) = explicit {
        return Ok(std::path::absolute(mnt)?);
    }
    let saved = SavedConfig::load(&SavedConfig::default_path()?)?;
    saved
        .and_then(|c| c.mnt)
        .or_else(default_mountpoint)
        .context("No mountpoint given and no home directory found")
}

fn bridge() -> Arc<dyn FilesystemBridge> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        Arc::new(drivefs_fuse::FuseBridge::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Arc::new(drivefs_fuse::LoopbackBridge::new())
    }
}

fn start(args: StartArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async move {
        let store: Arc<dyn DriveStore> = Arc::new(MemoryStore::new());

        let mut options = ServiceOptions::default()
            .remember(!args.no_remember)
            .disable_fuse(args.disable_fuse)
            .mount_config(MountConfig::default().network_dir(args.network_dir));
        if let Some(mnt) = args.mnt {
            options = options.mountpoint(std::path::absolute(mnt)?);
        }
        match args.key {
            Some(key) => options = options.key(key),
            None if args.create => {
                let drive = store.create_drive().await?;
                info!(key = %drive.key(), "created new root drive");
                options = options.key(drive.key());
            }
            None => {}
        }

        let service = DriveService::new(store, bridge(), options);

        let (tx, rx) = mpsc::channel::<()>();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })
        .context("Failed to set signal handler")?;

        service
            .open()
            .await
            .context("Could not start the drive service")?;
        if let Some(mnt) = service.mountpoint().await {
            info!("Service is running at {} (Ctrl+C to stop)", mnt.display());
        }

        match tokio::task::spawn_blocking(move || rx.recv()).await {
            Ok(Ok(())) => info!("Received interrupt signal, unmounting..."),
            _ => warn!("Signal channel closed unexpectedly"),
        }

        service.close().await.context("Failed to stop cleanly")?;
        info!("Service stopped");
        Ok::<(), anyhow::Error>(())
    })
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let fmt_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    #[cfg(feature = "tokio-console")]
    {
        use std::net::SocketAddr;
        use tracing_subscriber::Layer;

        let console_port: u16 = std::env::var("TOKIO_CONSOLE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(6669);

        let console_addr: SocketAddr = ([127, 0, 0, 1], console_port).into();
        if std::net::TcpListener::bind(console_addr).is_ok() {
            let console_layer = console_subscriber::ConsoleLayer::builder()
                .server_addr(console_addr)
                .spawn();
            tracing_subscriber::registry()
                .with(console_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_filter(fmt_filter),
                )
                .init();
            info!("tokio-console enabled, connect with: tokio-console http://127.0.0.1:{console_port}");
            return;
        }
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_filter(fmt_filter),
            )
            .init();
        warn!("tokio-console port {console_port} already in use, running without console instrumentation.");
    }

    #[cfg(not(feature = "tokio-console"))]
    {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .with(fmt_filter)
            .init();
    }
}
