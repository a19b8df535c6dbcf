//! Action executor: per-service serialization of actions, with a
//! parallelism escape hatch, attach-to-in-flight semantics, and the
//! closed set of internal operations.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{Action, ConfigSnapshot, Goal, InternalMethod, Parallelism, RunSpec, Service};
use crate::killscript::{self, KillOutcome, KillScript};
use crate::reconciler::Work;
use crate::spawner::SpawnerClient;

/// The observable result of one action invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    Failure(String),
    UnknownService,
    UnknownAction,
}

/// A request to run `action` on `service`; the waiter (if any) resolves
/// when the invocation this request lands on terminates.
pub struct ActionRequest {
    pub service: String,
    pub action: String,
    pub waiter: Option<oneshot::Sender<ActionOutcome>>,
}

/// Everything a dispatch needs from the core.
pub struct DispatchCtx<'a> {
    pub cfg: &'a Arc<ConfigSnapshot>,
    pub goals: &'a mut HashMap<String, Goal>,
    pub spawner: &'a SpawnerClient,
    pub work_tx: &'a mpsc::UnboundedSender<Work>,
}

struct ActiveAction {
    parallel: Parallelism,
    waiters: Vec<oneshot::Sender<ActionOutcome>>,
    task: JoinHandle<()>,
}

struct QueuedAction {
    action: String,
    waiters: Vec<oneshot::Sender<ActionOutcome>>,
}

/// Per-service active set plus FIFO queue of actions awaiting admission.
#[derive(Default)]
pub struct Executor {
    active: HashMap<String, HashMap<String, ActiveAction>>,
    queued: HashMap<String, VecDeque<QueuedAction>>,
}

/// Admission rule: the candidate may start only when every active action
/// tolerates it and it tolerates every active action.
fn admissible<'a>(
    active: impl Iterator<Item = (&'a str, &'a Parallelism)>,
    candidate: &str,
    parallel: &Parallelism,
) -> bool {
    for (name, theirs) in active {
        if !theirs.allows(candidate) || !parallel.allows(name) {
            return false;
        }
    }
    true
}

impl Executor {
    pub fn enqueue(&mut self, mut req: ActionRequest, ctx: &mut DispatchCtx) {
        let service = match ctx.cfg.service(&req.service) {
            Some(svc) => svc.clone(),
            None => {
                respond(req.waiter.take(), ActionOutcome::UnknownService);
                return;
            }
        };
        let action = match service.actions.get(&req.action) {
            Some(action) => action.clone(),
            None => {
                respond(req.waiter.take(), ActionOutcome::UnknownAction);
                return;
            }
        };

        if let Some(entry) = self
            .active
            .get_mut(&req.service)
            .and_then(|a| a.get_mut(&req.action))
        {
            // Same action already in flight: attach, never start twice.
            if let Some(waiter) = req.waiter.take() {
                entry.waiters.push(waiter);
            }
            return;
        }

        let can_start = match self.active.get(&req.service) {
            Some(active) => admissible(
                active.iter().map(|(n, a)| (n.as_str(), &a.parallel)),
                &req.action,
                &action.parallel,
            ),
            None => true,
        };

        if can_start {
            let waiters = req.waiter.take().into_iter().collect();
            self.start(req.service, req.action, service, action, waiters, ctx);
        } else {
            let queue = self.queued.entry(req.service.clone()).or_default();
            if let Some(entry) = queue.iter_mut().find(|q| q.action == req.action) {
                if let Some(waiter) = req.waiter.take() {
                    entry.waiters.push(waiter);
                }
            } else {
                queue.push_back(QueuedAction {
                    action: req.action,
                    waiters: req.waiter.take().into_iter().collect(),
                });
            }
        }
    }

    /// An action terminated: resolve its waiters, then re-evaluate the
    /// queue front for admission.
    pub fn on_done(
        &mut self,
        service: &str,
        action: &str,
        outcome: &ActionOutcome,
        ctx: &mut DispatchCtx,
    ) {
        if let Some(actions) = self.active.get_mut(service) {
            if let Some(entry) = actions.remove(action) {
                for waiter in entry.waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
            if actions.is_empty() {
                self.active.remove(service);
            }
        }
        self.drain_queue(service, ctx);
    }

    fn drain_queue(&mut self, service: &str, ctx: &mut DispatchCtx) {
        loop {
            let next = {
                let queue = match self.queued.get_mut(service) {
                    Some(q) => q,
                    None => return,
                };
                let front = match queue.front() {
                    Some(front) => front,
                    None => {
                        self.queued.remove(service);
                        return;
                    }
                };

                let resolved = ctx
                    .cfg
                    .service(service)
                    .and_then(|svc| svc.actions.get(&front.action).map(|a| (svc.clone(), a.clone())));
                match resolved {
                    None => {
                        // The action vanished in a reload while queued.
                        if let Some(dead) = queue.pop_front() {
                            for waiter in dead.waiters {
                                let _ = waiter.send(ActionOutcome::UnknownAction);
                            }
                        }
                        continue;
                    }
                    Some((svc, action)) => {
                        let can_start = match self.active.get(service) {
                            Some(active) => admissible(
                                active.iter().map(|(n, a)| (n.as_str(), &a.parallel)),
                                &front.action,
                                &action.parallel,
                            ),
                            None => true,
                        };
                        if !can_start {
                            return;
                        }
                        let queued = match self.queued.get_mut(service).and_then(|q| q.pop_front()) {
                            Some(queued) => queued,
                            None => return,
                        };
                        (queued, svc, action)
                    }
                }
            };
            let (queued, svc, action) = next;
            self.start(
                service.to_string(),
                queued.action,
                svc,
                action,
                queued.waiters,
                ctx,
            );
        }
    }

    fn start(
        &mut self,
        service_name: String,
        action_name: String,
        service: Service,
        action: Action,
        waiters: Vec<oneshot::Sender<ActionOutcome>>,
        ctx: &mut DispatchCtx,
    ) {
        // Goal transitions are applied before the run spec is dispatched.
        if let Some(goal) = action.goal {
            debug!(service = %service_name, action = %action_name, goal = %goal, "action sets goal");
            ctx.goals.insert(service_name.clone(), goal);
        }

        let parallel = action.parallel.clone();
        let spawner = ctx.spawner.clone();
        let work_tx = ctx.work_tx.clone();
        let task_service = service_name.clone();
        let task_action = action_name.clone();
        let task = tokio::spawn(async move {
            let outcome = run_action(&service, &task_action, &action, &spawner).await;
            let _ = work_tx.send(Work::ActionDone {
                service: task_service,
                action: task_action,
                outcome,
            });
        });

        self.active.entry(service_name).or_default().insert(
            action_name,
            ActiveAction {
                parallel,
                waiters,
                task,
            },
        );
    }

    pub fn has_active(&self, service: &str) -> bool {
        self.active.get(service).is_some_and(|a| !a.is_empty())
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Cancel everything in flight; waiters resolve as canceled when their
    /// senders drop.
    pub fn abort_all(&mut self) {
        for (_, actions) in self.active.drain() {
            for (_, entry) in actions {
                entry.task.abort();
            }
        }
        self.queued.clear();
    }
}

fn respond(waiter: Option<oneshot::Sender<ActionOutcome>>, outcome: ActionOutcome) {
    if let Some(waiter) = waiter {
        let _ = waiter.send(outcome);
    }
}

// ---------------------------------------------------------------------------
// Run specs
// ---------------------------------------------------------------------------

async fn run_action(
    service: &Service,
    action_name: &str,
    action: &Action,
    spawner: &SpawnerClient,
) -> ActionOutcome {
    if let RunSpec::Internal {
        method: InternalMethod::StopStart,
        ..
    } = &action.run
    {
        return stop_start(service, spawner).await;
    }
    run_leaf(service, action_name, action, spawner).await
}

async fn run_leaf(
    service: &Service,
    action_name: &str,
    action: &Action,
    spawner: &SpawnerClient,
) -> ActionOutcome {
    match &action.run {
        RunSpec::Internal { method, args } => match method {
            InternalMethod::Killscript => {
                let script = match KillScript::parse(&args.join(" ")) {
                    Ok(script) => script,
                    Err(e) => return ActionOutcome::Failure(e.to_string()),
                };
                match killscript::run(&script, &service.name, spawner).await {
                    KillOutcome::Reaped(_) | KillOutcome::NotRunning => ActionOutcome::Success,
                    KillOutcome::StillRunning => {
                        ActionOutcome::Failure("service still running after kill script".to_string())
                    }
                    KillOutcome::Failed(e) => ActionOutcome::Failure(e),
                }
            }
            InternalMethod::ExecUnlessRunning => exec_unless_running(service, spawner).await,
            InternalMethod::WaitForUptime => {
                let secs = args
                    .first()
                    .and_then(|a| a.parse::<f64>().ok())
                    .unwrap_or(3.0);
                wait_for_uptime(service, secs, spawner).await
            }
            InternalMethod::StopStart => {
                ActionOutcome::Failure("stop_start cannot run inside stop_start".to_string())
            }
        },
        RunSpec::Exec { argv, argv0 } => {
            run_exec(service, action_name, action, argv, argv0.as_ref(), spawner).await
        }
    }
}

/// stop_start: run the service's `stop` run spec to completion, then its
/// `start` run spec. Inner specs may be user overrides of either action.
async fn stop_start(service: &Service, spawner: &SpawnerClient) -> ActionOutcome {
    for inner in ["stop", "start"] {
        let action = match service.actions.get(inner) {
            Some(action) => action,
            None => {
                return ActionOutcome::Failure(format!("service has no '{inner}' action"));
            }
        };
        match run_leaf(service, inner, action, spawner).await {
            ActionOutcome::Success => {}
            other => return other,
        }
    }
    ActionOutcome::Success
}

/// Start the service unless an invocation is already running.
async fn exec_unless_running(service: &Service, spawner: &SpawnerClient) -> ActionOutcome {
    let mirror = spawner.mirror();
    {
        let m = mirror.read();
        if m.service(&service.name).is_some_and(|s| s.running) {
            return ActionOutcome::Success;
        }
    }
    if service.run.is_empty() {
        return ActionOutcome::Failure("service has no run command".to_string());
    }

    let (needs_args, needs_fds) = {
        let m = mirror.read();
        match m.service(&service.name) {
            Some(s) => (s.args != service.run, s.fds != service.io),
            None => (true, true),
        }
    };
    if needs_args {
        if let Err(e) = spawner.set_args(&service.name, &service.run).await {
            return ActionOutcome::Failure(e.to_string());
        }
    }
    if needs_fds && !service.io.is_empty() {
        if let Err(e) = spawner.set_fds(&service.name, &service.io).await {
            return ActionOutcome::Failure(e.to_string());
        }
    }
    match spawner.start(&service.name).await {
        Ok(()) => ActionOutcome::Success,
        Err(e) => ActionOutcome::Failure(e.to_string()),
    }
}

/// Succeed once the current invocation has stayed up for `secs` seconds.
async fn wait_for_uptime(service: &Service, secs: f64, spawner: &SpawnerClient) -> ActionOutcome {
    let need = Duration::from_secs_f64(secs);
    let mirror = spawner.mirror();
    loop {
        let uptime = {
            let m = mirror.read();
            match m.service(&service.name) {
                Some(s) if s.running => s.uptime().unwrap_or(Duration::ZERO),
                _ => return ActionOutcome::Failure("service is not running".to_string()),
            }
        };
        if uptime >= need {
            return ActionOutcome::Success;
        }
        let mut watch = spawner.watch_exit(&service.name);
        let timer = tokio::time::sleep(need - uptime);
        tokio::select! {
            _ = timer => {}
            exit = &mut watch => {
                return match exit {
                    Ok(exit) => ActionOutcome::Failure(format!(
                        "service exited during uptime check ({} {})",
                        exit.reason.as_str(),
                        exit.value
                    )),
                    Err(_) => ActionOutcome::Failure("spawner connection lost".to_string()),
                };
            }
        }
    }
}

/// Run an exec-style action as a transient spawner child named
/// `SERVICE.ACTION`, awaiting its reap. Success is a clean exit 0.
async fn run_exec(
    service: &Service,
    action_name: &str,
    action: &Action,
    argv: &[crate::config::ArgToken],
    argv0: Option<&crate::config::ArgToken>,
    spawner: &SpawnerClient,
) -> ActionOutcome {
    let env = service.merged_env(&action.env);
    let argv: Vec<String> = argv.iter().map(|t| t.resolve(&env)).collect();
    if argv.is_empty() || argv[0].is_empty() {
        return ActionOutcome::Failure("action resolves to an empty command".to_string());
    }

    let child = format!("{}.{}", service.name, action_name);
    let watch = spawner.watch_exit(&child);

    let setup = async {
        spawner.set_args(&child, &argv).await?;
        let io = action.io.as_ref().unwrap_or(&service.io);
        if !io.is_empty() {
            spawner.set_fds(&child, io).await?;
        }
        if let Some(argv0) = argv0 {
            spawner.tag(&child, "argv0", &argv0.resolve(&env)).await?;
        }
        spawner.tag(&child, "role", "action").await?;
        spawner.start(&child).await
    };
    if let Err(e) = setup.await {
        let _ = spawner.delete(&child).await;
        return ActionOutcome::Failure(e.to_string());
    }

    let exit = match watch.await {
        Ok(exit) => exit,
        Err(_) => return ActionOutcome::Failure("spawner connection lost".to_string()),
    };
    if let Err(e) = spawner.delete(&child).await {
        warn!(child = %child, error = %e, "failed to delete transient action entry");
    }

    if exit.is_clean() {
        ActionOutcome::Success
    } else {
        ActionOutcome::Failure(format!(
            "action process exited {} {}",
            exit.reason.as_str(),
            exit.value
        ))
    }
}
