//! Kill scripts: an ordered sequence of signals and wait durations driven
//! against one service until it is reaped or the script runs dry.

use std::time::Duration;

use tracing::debug;

use desd_protocol::registry::is_signal_name;

use crate::errors::{DaemonError, Result};
use crate::spawner::SpawnerClient;
use crate::state::ServiceExit;

/// One step of a kill script.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Ask the spawner to deliver this signal to the current invocation.
    Send(String),
    /// Wait this many seconds for a reap before continuing.
    Wait(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillScript {
    steps: Vec<Step>,
}

impl KillScript {
    /// Parse the wire form: space-separated signal names and positive
    /// decimal durations, at least one token.
    pub fn parse(field: &str) -> Result<KillScript> {
        let mut steps = Vec::new();
        for token in field.split(' ') {
            if token.is_empty() {
                return Err(DaemonError::KillScriptParse(format!(
                    "stray space in '{field}'"
                )));
            }
            if is_signal_name(token) {
                steps.push(Step::Send(token.to_string()));
            } else if let Some(secs) = parse_duration_token(token) {
                if secs <= 0.0 {
                    return Err(DaemonError::KillScriptParse(format!(
                        "non-positive duration '{token}'"
                    )));
                }
                steps.push(Step::Wait(secs));
            } else {
                return Err(DaemonError::KillScriptParse(format!(
                    "unrecognized token '{token}'"
                )));
            }
        }
        if steps.is_empty() {
            return Err(DaemonError::KillScriptParse("empty script".to_string()));
        }
        Ok(KillScript { steps })
    }

    pub fn serialize(&self) -> String {
        let tokens: Vec<String> = self
            .steps
            .iter()
            .map(|step| match step {
                Step::Send(sig) => sig.clone(),
                Step::Wait(secs) => format!("{secs}"),
            })
            .collect();
        tokens.join(" ")
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// Durations are `\d+(\.\d+)?` only; no signs, exponents, or bare dots.
fn parse_duration_token(token: &str) -> Option<f64> {
    let (whole, frac) = match token.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (token, None),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(frac) = frac {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    token.parse().ok()
}

/// How a kill-script run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum KillOutcome {
    /// The service was reaped while the script ran (or between steps).
    Reaped(ServiceExit),
    /// The service was not running when the script began.
    NotRunning,
    /// Every step ran and the service is still alive.
    StillRunning,
    /// The run could not proceed (spawner rejected a signal, endpoint lost).
    Failed(String),
}

/// Drive `script` against `service`.
///
/// The whole run is one future: dropping it cancels the armed timer and
/// releases the exit watch. Two concurrent runs against one service are
/// prevented by the core, which attaches later requests to the in-flight
/// run.
pub async fn run(script: &KillScript, service: &str, spawner: &SpawnerClient) -> KillOutcome {
    let mirror = spawner.mirror();

    let start_pid = {
        let m = mirror.read();
        match m.service(service) {
            Some(svc) if svc.running => svc.pid,
            _ => return KillOutcome::NotRunning,
        }
    };

    let mut watch = spawner.watch_exit(service);

    for step in script.steps() {
        // A reap between steps (or a new invocation under a fresh PID)
        // aborts the script with the prior invocation's exit.
        match watch.try_recv() {
            Ok(exit) => return KillOutcome::Reaped(exit),
            Err(tokio::sync::oneshot::error::TryRecvError::Closed) => {
                return KillOutcome::Failed("spawner connection lost".to_string())
            }
            Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {}
        }
        {
            let m = mirror.read();
            match m.service(service) {
                Some(svc) if svc.running && svc.pid == start_pid => {}
                Some(svc) => {
                    if let Some(exit) = svc.last_exit.clone() {
                        return KillOutcome::Reaped(exit);
                    }
                }
                None => {
                    return KillOutcome::Failed("service entry vanished".to_string());
                }
            }
        }

        match step {
            Step::Send(sig) => {
                debug!(service, signal = %sig, "kill script sending signal");
                if let Err(e) = spawner.signal(service, sig).await {
                    // Losing the race against the reap is not a failure.
                    if let Ok(exit) = watch.try_recv() {
                        return KillOutcome::Reaped(exit);
                    }
                    return KillOutcome::Failed(e.to_string());
                }
            }
            Step::Wait(secs) => {
                let timer = tokio::time::sleep(Duration::from_secs_f64(*secs));
                tokio::select! {
                    _ = timer => {}
                    exit = &mut watch => {
                        return match exit {
                            Ok(exit) => KillOutcome::Reaped(exit),
                            Err(_) => KillOutcome::Failed("spawner connection lost".to_string()),
                        };
                    }
                }
            }
        }
    }

    if let Ok(exit) = watch.try_recv() {
        return KillOutcome::Reaped(exit);
    }
    let still_running = {
        let m = mirror.read();
        m.service(service).map(|s| s.running).unwrap_or(false)
    };
    if still_running {
        KillOutcome::StillRunning
    } else {
        let m = mirror.read();
        match m.service(service).and_then(|s| s.last_exit.clone()) {
            Some(exit) => KillOutcome::Reaped(exit),
            None => KillOutcome::StillRunning,
        }
    }
}
