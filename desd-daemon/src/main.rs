use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::prelude::*;

use desd_daemon::config::ConfigSnapshot;
use desd_daemon::reconciler::{Core, Work};
use desd_daemon::signals::{self, Verbosity};
use desd_daemon::spawner::SpawnerClient;
use desd_daemon::{control, default_base_dir, CONTROL_SOCKET_FILE, DEFAULT_CONFIG_FILE};

/// Desd - a service supervisor driving an external process-spawning host
#[derive(Parser, Debug)]
#[command(name = "desd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to change into before anything else
    #[arg(long = "base-dir")]
    base_dir: Option<PathBuf>,

    /// Service configuration file (relative to the base dir)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Control socket path for clients (relative to the base dir)
    #[arg(long = "socket")]
    socket: Option<PathBuf>,

    /// Spawner connection: an inherited descriptor number or a socket path
    #[arg(long = "control")]
    control: String,

    /// More logging (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less logging (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = 2 + cli.verbose as i32 - cli.quiet as i32;
    let (filter, reload_handle) =
        tracing_subscriber::reload::Layer::new(signals::level_filter_for(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    let verbosity = Verbosity::new(level, reload_handle);

    info!("Starting desd");

    let base_dir = cli.base_dir.unwrap_or_else(default_base_dir);
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("cannot create base dir {}", base_dir.display()))?;
    std::env::set_current_dir(&base_dir)
        .with_context(|| format!("cannot enter base dir {}", base_dir.display()))?;

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let cfg = ConfigSnapshot::load(&config_path)?;

    let spawner_stream = connect_spawner(&cli.control).await?;
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let spawner = SpawnerClient::connect(spawner_stream, notice_tx);

    let socket_path = cli
        .socket
        .unwrap_or_else(|| PathBuf::from(CONTROL_SOCKET_FILE));
    let listener = control::bind_control_socket(&socket_path)?;
    info!(socket = %socket_path.display(), "control socket ready");

    let (core, work_tx) = Core::new(
        cfg,
        Some(config_path),
        spawner,
        notice_rx,
        Some(verbosity),
    );

    tokio::spawn(control::run_control_server(listener, work_tx.clone()));

    // Desd's own termination signals take the graceful path.
    let signal_tx = work_tx.clone();
    tokio::spawn(async move {
        if signals::wait_for_termination().await.is_ok() {
            let _ = signal_tx.send(Work::Shutdown { immediate: false });
        }
    });

    core.run().await?;

    let _ = std::fs::remove_file(&socket_path);
    info!("desd shut down");
    Ok(())
}

/// `--control` accepts either a descriptor number inherited from the
/// bootstrap or a path to the spawner's socket.
async fn connect_spawner(control: &str) -> Result<UnixStream> {
    if let Ok(fd) = control.parse::<i32>() {
        use std::os::fd::FromRawFd;

        // The bootstrap handed us this descriptor; nothing else owns it.
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        std_stream
            .set_nonblocking(true)
            .context("cannot configure inherited spawner descriptor")?;
        UnixStream::from_std(std_stream).context("cannot adopt inherited spawner descriptor")
    } else {
        UnixStream::connect(control)
            .await
            .with_context(|| format!("cannot connect to spawner at {control}"))
    }
}
