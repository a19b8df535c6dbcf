//! Mirrored spawner state.
//!
//! The spawner host owns the truth about processes; Desd keeps a mirror,
//! rebuilt from a statedump at startup and updated from event
//! notifications. The mirror is shared read-only with the core and the
//! kill-script runners; only the spawner client's event task writes it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// How a reaped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exit,
    Signal,
}

impl ExitReason {
    pub fn from_wire(s: &str) -> Option<ExitReason> {
        match s {
            "exit" => Some(ExitReason::Exit),
            "signal" => Some(ExitReason::Signal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Exit => "exit",
            ExitReason::Signal => "signal",
        }
    }
}

/// A reaped invocation: exit code for `exit`, signal name for `signal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceExit {
    pub reason: ExitReason,
    pub value: String,
}

impl ServiceExit {
    /// Whether this exit counts as success for exec-style actions.
    pub fn is_clean(&self) -> bool {
        self.reason == ExitReason::Exit && self.value == "0"
    }
}

/// One service entry as the spawner reports it.
#[derive(Debug, Clone, Default)]
pub struct SpawnerService {
    pub args: Vec<String>,
    pub fds: Vec<String>,
    pub tags: HashMap<String, String>,
    pub running: bool,
    pub pid: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ServiceExit>,
    pub auto_up: bool,
}

impl SpawnerService {
    /// Time the current invocation has been running, if any.
    pub fn uptime(&self) -> Option<Duration> {
        if !self.running {
            return None;
        }
        let started = self.started_at?;
        let elapsed = Utc::now().signed_duration_since(started);
        elapsed.to_std().ok()
    }
}

/// Everything Desd knows about the spawner side: services plus the set of
/// process signals the spawner has trapped and not yet had cleared.
#[derive(Debug, Default)]
pub struct SpawnerMirror {
    pub services: HashMap<String, SpawnerService>,
    pub pending_signals: BTreeSet<String>,
    /// Set once the statedump handshake has completed.
    pub synced: bool,
}

impl SpawnerMirror {
    pub fn reset(&mut self) {
        self.services.clear();
        self.pending_signals.clear();
        self.synced = false;
    }

    pub fn service(&self, name: &str) -> Option<&SpawnerService> {
        self.services.get(name)
    }

    fn entry(&mut self, name: &str) -> &mut SpawnerService {
        self.services.entry(name.to_string()).or_default()
    }

    pub fn note_args(&mut self, name: &str, args: Vec<String>) {
        self.entry(name).args = args;
    }

    pub fn note_fds(&mut self, name: &str, fds: Vec<String>) {
        self.entry(name).fds = fds;
    }

    pub fn note_tag(&mut self, name: &str, key: &str, value: &str) {
        self.entry(name)
            .tags
            .insert(key.to_string(), value.to_string());
    }

    pub fn note_auto_up(&mut self, name: &str, auto_up: bool) {
        self.entry(name).auto_up = auto_up;
    }

    pub fn note_state(&mut self, name: &str, up: bool, pid: Option<u64>) {
        let svc = self.entry(name);
        if up && !svc.running {
            svc.started_at = Some(Utc::now());
        }
        svc.running = up;
        svc.pid = if up { pid } else { None };
        if !up {
            svc.started_at = None;
        }
    }

    pub fn note_exit(&mut self, name: &str, exit: ServiceExit) {
        let svc = self.entry(name);
        svc.running = false;
        svc.pid = None;
        svc.started_at = None;
        svc.last_exit = Some(exit);
    }

    pub fn note_signal(&mut self, name: &str) {
        self.pending_signals.insert(name.to_string());
    }

    pub fn clear_signal(&mut self, name: &str) {
        self.pending_signals.remove(name);
    }

    pub fn remove_service(&mut self, name: &str) {
        self.services.remove(name);
    }
}

pub type SharedMirror = Arc<RwLock<SpawnerMirror>>;

pub fn new_shared_mirror() -> SharedMirror {
    Arc::new(RwLock::new(SpawnerMirror::default()))
}
