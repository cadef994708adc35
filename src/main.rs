mod alias;
mod config;
mod digest;
mod error;
mod fs;
mod handle_table;
mod listing;
mod ops;
mod pathmap;
mod store;
mod translate;
mod util;

use anyhow::Context;
use clap::Parser;
use config::{BACKING_NAME_MAX, Config};
use fs::LongNameFs;
use fuse3::MountOptions;
use fuse3::path::Session;
use futures_util::future::poll_fn;
use ops::Mount;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "longnamefs")]
#[command(about = "FUSE3 passthrough that stores over-long file names under digest aliases")]
struct Cli {
    /// Backing directory holding the real entries.
    #[arg(long)]
    backend: PathBuf,

    /// Mount point for the virtual filesystem.
    mountpoint: PathBuf,

    /// Directory for the name mapping store. Defaults to $XDG_DATA_HOME/longnamefs.
    #[arg(long, env = "LFN_STORE")]
    store: Option<PathBuf>,

    /// Names longer than this many bytes are stored under an alias. Range 69..=255.
    #[arg(long, default_value_t = BACKING_NAME_MAX)]
    name_threshold: usize,

    /// Allow other users to access the mount (passes allow_other to FUSE).
    #[arg(long, default_value_t = false)]
    allow_other: bool,

    /// Permit mounting on a non-empty directory.
    #[arg(long, default_value_t = false)]
    nonempty: bool,

    /// Directory listing cache TTL in milliseconds. 0 disables it.
    #[arg(long, default_value_t = 1000)]
    dir_cache_ttl_ms: u64,

    /// Disable the directory listing cache.
    #[arg(long, default_value_t = false)]
    no_dir_cache: bool,

    /// fdatasync data files on every write.
    #[arg(long, default_value_t = false)]
    sync_data: bool,

    /// Largest write request accepted from the kernel, in KiB.
    #[arg(long, default_value_t = 1024)]
    max_write_kb: u32,

    /// Log this crate at debug level.
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Log FUSE protocol traffic.
    #[arg(long, default_value_t = false)]
    debug_fuse: bool,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.debug {
        filter = filter.add_directive("longnamefs=debug".parse()?);
    }
    if cli.debug_fuse {
        filter = filter.add_directive("fuse3=debug".parse()?);
    }
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()?;
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let store_path = cli.store.clone().unwrap_or_else(config::default_store_path);
    let config = Config::open_backend(
        cli.backend.clone(),
        store_path,
        cli.name_threshold,
        cli.sync_data,
    )
    .with_context(|| format!("cannot use backend {}", cli.backend.display()))?;

    let cache_ttl = if cli.no_dir_cache || cli.dir_cache_ttl_ms == 0 {
        None
    } else {
        Some(Duration::from_millis(cli.dir_cache_ttl_ms))
    };

    let mount = Mount::new(config, cache_ttl).context("cannot open mapping store")?;
    info!(
        store = %mount.translator().store().path().display(),
        records = mount.translator().store().len(),
        "mapping store ready"
    );
    let fs = LongNameFs::new(mount, cli.max_write_kb);

    let mut mount_opts = MountOptions::default();
    mount_opts.fs_name("longnamefs");
    mount_opts.allow_other(cli.allow_other);
    mount_opts.nonempty(cli.nonempty);

    let session = Session::new(mount_opts);
    let handle = session.mount(fs, &cli.mountpoint).await?;
    info!(mountpoint = %cli.mountpoint.display(), "mounted");

    let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

    let mut mount_task = tokio::spawn(async move {
        let mut handle = Some(handle);
        let mut handle_future = poll_fn(|cx| match handle.as_mut() {
            Some(handle) => Pin::new(handle).poll(cx),
            None => std::task::Poll::Pending,
        });

        let res = tokio::select! {
            res = &mut handle_future => res,
            _ = unmount_rx => match handle.take() {
                Some(handle) => handle.unmount().await,
                None => Ok(()),
            },
        };

        res.map_err(anyhow::Error::from)
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let signals = async {
        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
    };
    tokio::pin!(signals);

    let result = tokio::select! {
        res = &mut mount_task => res,
        _ = &mut signals => {
            info!("signal received, unmounting");
            let _ = unmount_tx.send(());
            mount_task.await
        }
    };

    result??;
    Ok(())
}
