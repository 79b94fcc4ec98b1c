//! hotpatchd - hot-patch orchestration daemon
//!
//! Binds the command and exception endpoints for one process group, runs the
//! compile driver, and wires the default adapters: sidecar symbol manifests,
//! procfs process control, and a shell-out build delegate.

mod adapters;

use adapters::{ProcAttach, ShellCompileDelegate, SidecarSymbols, SymlinkDrive};
use clap::Parser;
use hotpatch_core::Settings;
use hotpatch_server::{CompileDriver, LogEvents, NullTrigger, Server, ServerPorts};
use hotpatch_watch::{DirectoryCache, FsWatcher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "hotpatchd",
    about = "Hot-patch orchestration server for attached client processes"
)]
struct Cli {
    /// Process group name; clients derive the command and exception ports
    /// from it
    #[arg(default_value = "default")]
    group: String,

    /// Settings file (JSON). Defaults to hotpatch.json next to the executable
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory linked patches are written to
    #[arg(long)]
    patch_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hotpatch=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::discover(cli.config.as_deref());

    // One notify stream fans out to the directory cache (per-pass change
    // flags) and the compile driver (debounced trigger).
    let (fs_tx, mut fs_rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();
    let (cache_tx, cache_rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();
    let (change_tx, change_rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();
    tokio::spawn(async move {
        while let Some(path) = fs_rx.recv().await {
            let _ = cache_tx.send(path.clone());
            let _ = change_tx.send(path);
        }
    });
    let watcher = FsWatcher::new(fs_tx)?;
    let directories = DirectoryCache::new(Box::new(watcher), cache_rx);

    if settings.continuous_compilation.enabled {
        if let Some(path) = &settings.continuous_compilation.path {
            if let Err(e) = directories.add_directory(path) {
                warn!(path = %path.display(), error = %e, "cannot watch source directory");
            }
        }
    }

    let patch_dir = cli
        .patch_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("hotpatch-patches"));

    let server = Server::new(
        settings,
        directories,
        ServerPorts {
            symbols: Arc::new(SidecarSymbols),
            control: Arc::new(ProcAttach),
            delegate: Arc::new(ShellCompileDelegate::new(patch_dir)),
            drive: Arc::new(SymlinkDrive::default()),
            events: Arc::new(LogEvents),
        },
    );

    let driver = CompileDriver::new(server.shared(), Arc::new(NullTrigger), change_rx);
    tokio::spawn(driver.run());

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    server.serve(&cli.group).await?;
    Ok(())
}
