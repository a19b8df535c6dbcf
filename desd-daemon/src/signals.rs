//! Signal dispositions and runtime verbosity.
//!
//! Process signals are trapped by the spawner and surfaced to Desd as
//! `signal NAME` events; the reconciler clears the pending mark and then
//! applies the default mapping below. Desd's own termination signals take
//! the same graceful path.

use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::reload;

/// What a trapped signal asks the core to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    ReloadConfig,
    ReloadState,
    GracefulShutdown,
    ImmediateShutdown,
    VerbosityUp,
    VerbosityDown,
}

/// The built-in signal mapping.
pub fn default_disposition(signal: &str) -> Option<SignalAction> {
    match signal {
        "SIGHUP" => Some(SignalAction::ReloadConfig),
        "SIGINT" => Some(SignalAction::ReloadState),
        "SIGTERM" => Some(SignalAction::GracefulShutdown),
        "SIGQUIT" => Some(SignalAction::ImmediateShutdown),
        "SIGUSR1" => Some(SignalAction::VerbosityUp),
        "SIGUSR2" => Some(SignalAction::VerbosityDown),
        _ => None,
    }
}

/// Numeric verbosity to filter mapping; the default level is 2 (info).
pub fn level_filter_for(level: i32) -> LevelFilter {
    match level {
        i32::MIN..=0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Runtime-adjustable log verbosity, driven by SIGUSR1/SIGUSR2.
pub struct Verbosity {
    level: Mutex<i32>,
    handle: reload::Handle<LevelFilter, Registry>,
}

impl Verbosity {
    pub fn new(level: i32, handle: reload::Handle<LevelFilter, Registry>) -> Verbosity {
        Verbosity {
            level: Mutex::new(level),
            handle,
        }
    }

    pub fn adjust(&self, delta: i32) {
        let mut level = self.level.lock();
        *level = (*level + delta).clamp(0, 4);
        let filter = level_filter_for(*level);
        match self.handle.reload(filter) {
            Ok(()) => info!(level = %filter, "log verbosity changed"),
            Err(e) => warn!(error = %e, "failed to reload log filter"),
        }
    }
}

/// Resolve when the process receives a termination signal.
#[cfg(unix)]
pub async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
