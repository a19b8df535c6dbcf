//! The core actor: an event-driven convergence loop that owns all
//! reconciliation state.
//!
//! Work items arrive on one queue from the control server, the spawner
//! event stream, and completing actions. One item is processed per loop
//! iteration, so each tick touches at most one service and the loop
//! yields between items.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::actions::{ActionOutcome, ActionRequest, DispatchCtx, Executor};
use crate::config::{ConfigSnapshot, Goal};
use crate::errors::{DaemonError, Result};
use crate::killscript::{self, KillOutcome, KillScript};
use crate::signals::{self, SignalAction, Verbosity};
use crate::spawner::{SpawnerClient, SpawnerNotice};
use crate::state::SpawnerService;

/// One unit of scheduled work for the core loop.
pub enum Work {
    ReconcileService(String),
    ReconcileSignal(String),
    ServiceAction {
        service: String,
        action: String,
        waiter: oneshot::Sender<ActionOutcome>,
    },
    Killscript {
        service: String,
        script: KillScript,
        waiter: oneshot::Sender<KillOutcome>,
    },
    KillscriptDone {
        service: String,
        outcome: KillOutcome,
    },
    ActionDone {
        service: String,
        action: String,
        outcome: ActionOutcome,
    },
    SessionTokens {
        reply: oneshot::Sender<Vec<String>>,
    },
    ReloadConfig,
    ReloadState,
    Shutdown {
        immediate: bool,
    },
}

pub struct Core {
    cfg: Arc<ConfigSnapshot>,
    config_path: Option<PathBuf>,
    goals: HashMap<String, Goal>,
    executor: Executor,
    kill_inflight: HashMap<String, Vec<oneshot::Sender<KillOutcome>>>,
    spawner: SpawnerClient,
    work_tx: mpsc::UnboundedSender<Work>,
    work_rx: mpsc::UnboundedReceiver<Work>,
    notices: mpsc::UnboundedReceiver<SpawnerNotice>,
    verbosity: Option<Verbosity>,
    shutting_down: bool,
    fatal: Option<DaemonError>,
}

impl Core {
    pub fn new(
        cfg: ConfigSnapshot,
        config_path: Option<PathBuf>,
        spawner: SpawnerClient,
        notices: mpsc::UnboundedReceiver<SpawnerNotice>,
        verbosity: Option<Verbosity>,
    ) -> (Core, mpsc::UnboundedSender<Work>) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let goals = cfg
            .service_names()
            .map(|name| {
                let goal = cfg.service(name).map(|s| s.goal).unwrap_or_default();
                (name.to_string(), goal)
            })
            .collect();
        let core = Core {
            cfg: Arc::new(cfg),
            config_path,
            goals,
            executor: Executor::default(),
            kill_inflight: HashMap::new(),
            spawner,
            work_tx: work_tx.clone(),
            work_rx,
            notices,
            verbosity,
            shutting_down: false,
            fatal: None,
        };
        (core, work_tx)
    }

    /// Run until shutdown. Loss of the spawner connection is fatal.
    pub async fn run(mut self) -> Result<()> {
        self.resync().await?;

        let result = loop {
            tokio::select! {
                Some(work) = self.work_rx.recv() => {
                    if self.dispatch(work).await {
                        break match self.fatal.take() {
                            Some(e) => Err(e),
                            None => Ok(()),
                        };
                    }
                }
                notice = self.notices.recv() => match notice {
                    Some(notice) => self.on_notice(notice),
                    None => {
                        error!("spawner connection lost");
                        break Err(DaemonError::SpawnerLost);
                    }
                },
            }
            if self.shutting_down && self.executor.is_idle() && self.kill_inflight.is_empty() {
                break Ok(());
            }
        };

        self.teardown();
        result
    }

    fn on_notice(&mut self, notice: SpawnerNotice) {
        let work = match notice {
            SpawnerNotice::Service(name) => Work::ReconcileService(name),
            SpawnerNotice::Signal(name) => Work::ReconcileSignal(name),
        };
        let _ = self.work_tx.send(work);
    }

    /// Returns true when the loop should stop.
    async fn dispatch(&mut self, work: Work) -> bool {
        match work {
            Work::ReconcileService(name) => {
                if let Err(e) = self.reconcile_service(&name).await {
                    warn!(service = %name, error = %e, "reconciliation step failed");
                }
            }
            Work::ReconcileSignal(name) => self.reconcile_signal(&name).await,
            Work::ServiceAction {
                service,
                action,
                waiter,
            } => {
                let cfg = self.cfg.clone();
                let mut ctx = DispatchCtx {
                    cfg: &cfg,
                    goals: &mut self.goals,
                    spawner: &self.spawner,
                    work_tx: &self.work_tx,
                };
                self.executor.enqueue(
                    ActionRequest {
                        service,
                        action,
                        waiter: Some(waiter),
                    },
                    &mut ctx,
                );
            }
            Work::Killscript {
                service,
                script,
                waiter,
            } => self.dispatch_killscript(service, script, waiter),
            Work::KillscriptDone { service, outcome } => {
                if let Some(waiters) = self.kill_inflight.remove(&service) {
                    for waiter in waiters {
                        let _ = waiter.send(outcome.clone());
                    }
                }
            }
            Work::ActionDone {
                service,
                action,
                outcome,
            } => self.on_action_done(service, action, outcome),
            Work::SessionTokens { reply } => {
                // Peers passed the same-uid gate; an empty declaration
                // means full access.
                let tokens = if self.cfg.control_tokens().is_empty() {
                    vec!["*".to_string()]
                } else {
                    self.cfg.control_tokens().to_vec()
                };
                let _ = reply.send(tokens);
            }
            Work::ReloadConfig => {
                if let Err(e) = self.reload_config() {
                    warn!(error = %e, "config reload failed, keeping previous snapshot");
                }
            }
            Work::ReloadState => {
                if let Err(e) = self.resync().await {
                    error!(error = %e, "state resync failed");
                    self.fatal = Some(e);
                    return true;
                }
            }
            Work::Shutdown { immediate } => {
                if immediate {
                    info!("immediate shutdown");
                    return true;
                }
                self.begin_graceful();
            }
        }
        false
    }

    fn on_action_done(&mut self, service: String, action: String, outcome: ActionOutcome) {
        match &outcome {
            ActionOutcome::Success => debug!(service = %service, action = %action, "action complete"),
            other => warn!(service = %service, action = %action, outcome = ?other, "action did not succeed"),
        }

        // Goal `cycle` resolves to `up` once its down-phase is done: either
        // a stop completed, or the action (e.g. restart) already brought
        // the service back. The exit notice usually flips this first.
        if self.goals.get(&service) == Some(&Goal::Cycle) {
            let running = {
                let mirror = self.spawner.mirror();
                let m = mirror.read();
                m.service(&service).is_some_and(|s| s.running)
            };
            if action == "stop" || running {
                self.goals.insert(service.clone(), Goal::Up);
            }
        }

        let cfg = self.cfg.clone();
        let mut ctx = DispatchCtx {
            cfg: &cfg,
            goals: &mut self.goals,
            spawner: &self.spawner,
            work_tx: &self.work_tx,
        };
        self.executor.on_done(&service, &action, &outcome, &mut ctx);
        let _ = self.work_tx.send(Work::ReconcileService(service));
    }

    fn dispatch_killscript(
        &mut self,
        service: String,
        script: KillScript,
        waiter: oneshot::Sender<KillOutcome>,
    ) {
        // A later request against an in-flight run attaches to it.
        if let Some(waiters) = self.kill_inflight.get_mut(&service) {
            waiters.push(waiter);
            return;
        }
        self.kill_inflight.insert(service.clone(), vec![waiter]);

        let spawner = self.spawner.clone();
        let work_tx = self.work_tx.clone();
        tokio::spawn(async move {
            let outcome = killscript::run(&script, &service, &spawner).await;
            let _ = work_tx.send(Work::KillscriptDone { service, outcome });
        });
    }

    /// Rebuild the mirror from a statedump and enqueue one reconciliation
    /// per pending signal and per known service name.
    async fn resync(&mut self) -> Result<()> {
        self.spawner.resync().await?;

        let (observed, signals): (BTreeSet<String>, BTreeSet<String>) = {
            let mirror = self.spawner.mirror();
            let m = mirror.read();
            (
                m.services.keys().cloned().collect(),
                m.pending_signals.iter().cloned().collect(),
            )
        };

        for signal in signals {
            let _ = self.work_tx.send(Work::ReconcileSignal(signal));
        }
        let mut names = observed;
        names.extend(self.cfg.service_names().map(str::to_string));
        for name in names {
            let _ = self.work_tx.send(Work::ReconcileService(name));
        }
        Ok(())
    }

    /// One convergence step for one service.
    async fn reconcile_service(&mut self, name: &str) -> Result<()> {
        let cfg = self.cfg.clone();
        let configured = cfg.service(name);
        let observed: Option<SpawnerService> = {
            let mirror = self.spawner.mirror();
            let m = mirror.read();
            m.service(name).cloned()
        };

        let svc = match (configured, &observed) {
            (None, None) => return Ok(()),
            (None, Some(obs)) => {
                // Transient action children are owned by their action run.
                if obs.tags.get("role").map(String::as_str) == Some("action") {
                    return Ok(());
                }
                // Unconfigured and running: tolerated, never restarted.
                // Unconfigured and stopped: remove the spawner entry.
                if !obs.running {
                    debug!(service = %name, "deleting unconfigured stopped service");
                    self.spawner.delete(name).await?;
                }
                return Ok(());
            }
            (Some(svc), _) => svc,
        };

        match &observed {
            None => {
                self.spawner.set_args(name, &svc.run).await?;
                if !svc.io.is_empty() {
                    self.spawner.set_fds(name, &svc.io).await?;
                }
            }
            Some(obs) => {
                if obs.args != svc.run {
                    self.spawner.set_args(name, &svc.run).await?;
                }
                if !svc.io.is_empty() && obs.fds != svc.io {
                    self.spawner.set_fds(name, &svc.io).await?;
                }
            }
        }

        let goal = *self.goals.entry(name.to_string()).or_insert(svc.goal);

        let (obs_auto_up, obs_want) = observed
            .as_ref()
            .map(|o| (o.auto_up, o.tags.get("want").cloned()))
            .unwrap_or((false, None));
        let want_auto_up = goal == Goal::Up;
        if obs_auto_up != want_auto_up {
            self.spawner.set_auto_up(name, want_auto_up, "always").await?;
        }
        if obs_want.as_deref() != Some(goal.as_str()) {
            self.spawner.tag(name, "want", goal.as_str()).await?;
        }

        let running = observed.as_ref().map(|o| o.running).unwrap_or(false);
        let busy = self.executor.has_active(name);

        // At most one start/stop is dispatched per tick.
        match goal {
            Goal::Up if !running && !busy => self.dispatch_action(name, "start"),
            Goal::Down if running && !busy => self.dispatch_action(name, "stop"),
            Goal::Once if !running && !busy => {
                let ran_before = observed.as_ref().is_some_and(|o| o.last_exit.is_some());
                if !ran_before {
                    self.dispatch_action(name, "start");
                }
            }
            Goal::Cycle => {
                if running {
                    if !busy {
                        self.dispatch_action(name, "stop");
                    }
                } else {
                    // Already down: the cycle resolves to coming back up.
                    self.goals.insert(name.to_string(), Goal::Up);
                    let _ = self.work_tx.send(Work::ReconcileService(name.to_string()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn dispatch_action(&mut self, service: &str, action: &str) {
        debug!(service, action, "reconciler dispatching action");
        let cfg = self.cfg.clone();
        let mut ctx = DispatchCtx {
            cfg: &cfg,
            goals: &mut self.goals,
            spawner: &self.spawner,
            work_tx: &self.work_tx,
        };
        self.executor.enqueue(
            ActionRequest {
                service: service.to_string(),
                action: action.to_string(),
                waiter: None,
            },
            &mut ctx,
        );
    }

    async fn reconcile_signal(&mut self, name: &str) {
        if let Err(e) = self.spawner.clear_signal(name).await {
            warn!(signal = name, error = %e, "failed to clear pending signal");
        }
        match signals::default_disposition(name) {
            Some(SignalAction::ReloadConfig) => {
                let _ = self.work_tx.send(Work::ReloadConfig);
            }
            Some(SignalAction::ReloadState) => {
                let _ = self.work_tx.send(Work::ReloadState);
            }
            Some(SignalAction::GracefulShutdown) => {
                let _ = self.work_tx.send(Work::Shutdown { immediate: false });
            }
            Some(SignalAction::ImmediateShutdown) => {
                let _ = self.work_tx.send(Work::Shutdown { immediate: true });
            }
            Some(SignalAction::VerbosityUp) => {
                if let Some(v) = &self.verbosity {
                    v.adjust(1);
                }
            }
            Some(SignalAction::VerbosityDown) => {
                if let Some(v) = &self.verbosity {
                    v.adjust(-1);
                }
            }
            None => debug!(signal = name, "no disposition for signal"),
        }
    }

    /// Diff old and new snapshots. Services present in both with identical
    /// `run` and `io` and an unchanged declared goal are not touched, so
    /// no directives are emitted for them.
    fn reload_config(&mut self) -> Result<()> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| DaemonError::Internal("no config path to reload from".to_string()))?;
        let new = ConfigSnapshot::load(&path)?;
        let old = self.cfg.clone();

        let mut touched: BTreeSet<String> = BTreeSet::new();
        for (name, new_svc) in new.services() {
            match old.service(name) {
                None => {
                    self.goals.insert(name.to_string(), new_svc.goal);
                    touched.insert(name.to_string());
                }
                Some(old_svc) => {
                    if old_svc.run != new_svc.run || old_svc.io != new_svc.io {
                        touched.insert(name.to_string());
                    }
                    if old_svc.goal != new_svc.goal {
                        self.goals.insert(name.to_string(), new_svc.goal);
                        touched.insert(name.to_string());
                    }
                }
            }
        }
        for name in old.service_names() {
            if new.service(name).is_none() {
                // Removed services keep running if they are running; the
                // reconcile below cleans up stopped entries.
                self.goals.remove(name);
                touched.insert(name.to_string());
            }
        }

        self.cfg = Arc::new(new);
        info!(path = %path.display(), changed = touched.len(), "configuration reloaded");
        for name in touched {
            let _ = self.work_tx.send(Work::ReconcileService(name));
        }
        Ok(())
    }

    fn begin_graceful(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("graceful shutdown requested");
        self.shutting_down = true;

        let names: Vec<String> = self.cfg.service_names().map(str::to_string).collect();
        let mirror = self.spawner.mirror();
        for name in names {
            let running = mirror.read().service(&name).is_some_and(|s| s.running);
            self.goals.insert(name.clone(), Goal::Down);
            if running && !self.executor.has_active(&name) {
                self.dispatch_action(&name, "stop");
            }
        }
    }

    fn teardown(&mut self) {
        self.executor.abort_all();
        // Dropping the waiters fails attached killscript commands with
        // "canceled".
        self.kill_inflight.clear();
        self.spawner.close();
    }
}
