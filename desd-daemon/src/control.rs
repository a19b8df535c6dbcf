//! Control socket: the server endpoint clients drive actions through.

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use desd_protocol::{control_registry, serve_connection, HandlerResult, Message, Reply};

use crate::actions::ActionOutcome;
use crate::errors::{DaemonError, Result};
use crate::killscript::{KillOutcome, KillScript};
use crate::permissions::assert_permission;
use crate::reconciler::Work;

/// One connected control client's authorization context.
struct Session {
    tokens: Vec<String>,
}

/// Bind the control socket, replacing any stale file, owner-only.
pub fn bind_control_socket(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(DaemonError::Internal(format!(
                "stale socket at {} cannot be deleted: {e}",
                path.display()
            )))
        }
    }

    let listener = UnixListener::bind(path).map_err(|e| {
        DaemonError::Internal(format!("cannot bind control socket at {}: {e}", path.display()))
    })?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            DaemonError::Internal(format!(
                "failed to set socket permissions at {}: {e}",
                path.display()
            ))
        })?;
    }

    Ok(listener)
}

/// Accept loop: gate each peer on matching UID, fetch its session tokens
/// from the core, and serve it on the shared work queue.
pub async fn run_control_server(listener: UnixListener, work_tx: mpsc::UnboundedSender<Work>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "failed to accept control connection");
                continue;
            }
        };

        match stream.peer_cred() {
            Ok(cred) if cred.uid() == nix::unistd::getuid().as_raw() => {}
            Ok(cred) => {
                warn!(uid = cred.uid(), "rejecting control connection from foreign uid");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "failed to verify peer credentials");
                continue;
            }
        }

        let (tx, rx) = oneshot::channel();
        if work_tx.send(Work::SessionTokens { reply: tx }).is_err() {
            return;
        }
        let tokens = match rx.await {
            Ok(tokens) => tokens,
            Err(_) => return,
        };

        debug!("control client connected");
        let session = Arc::new(Session { tokens });
        let work_tx = work_tx.clone();
        tokio::spawn(serve_client(stream, session, work_tx));
    }
}

async fn serve_client(
    stream: UnixStream,
    session: Arc<Session>,
    work_tx: mpsc::UnboundedSender<Work>,
) {
    let handler = move |msg: Message| handle_command(msg, session.clone(), work_tx.clone());
    if let Err(e) = serve_connection(stream, control_registry(), handler).await {
        debug!(error = %e, "control connection closed");
    }
}

/// Dispatch one validated control command. Registry validation has already
/// run, so arities and charsets hold here.
async fn handle_command(
    msg: Message,
    session: Arc<Session>,
    work_tx: mpsc::UnboundedSender<Work>,
) -> HandlerResult {
    match msg.name() {
        "echo" => Ok(Reply::ok(msg.args().to_vec())),

        "service_action" => {
            let service = msg.args()[0].clone();
            let action = msg.args()[1].clone();
            assert_permission(&session.tokens, "service_action", &[&service, &action])?;

            let (tx, rx) = oneshot::channel();
            work_tx
                .send(Work::ServiceAction {
                    service,
                    action,
                    waiter: tx,
                })
                .map_err(|_| anyhow!("daemon is shutting down"))?;

            match rx.await {
                Ok(ActionOutcome::Success) => Ok(Reply::ok(["complete"])),
                Ok(ActionOutcome::UnknownService) => Ok(Reply::invalid("unknown service")),
                Ok(ActionOutcome::UnknownAction) => Ok(Reply::invalid("unknown action")),
                Ok(ActionOutcome::Failure(detail)) => {
                    debug!(detail = %detail, "service_action failed");
                    Ok(Reply::error::<_, String>("failed", []))
                }
                Err(_) => Ok(Reply::error::<_, String>("failed", [])),
            }
        }

        "killscript" => {
            let service = msg.args()[0].clone();
            let script = match KillScript::parse(&msg.args()[1]) {
                Ok(script) => script,
                Err(_) => return Ok(Reply::invalid("")),
            };
            assert_permission(&session.tokens, "kill_service", &[&service])?;

            let (tx, rx) = oneshot::channel();
            work_tx
                .send(Work::Killscript {
                    service,
                    script,
                    waiter: tx,
                })
                .map_err(|_| anyhow!("daemon is shutting down"))?;

            match rx.await {
                Ok(KillOutcome::Reaped(exit)) => Ok(Reply::ok([
                    "reaped".to_string(),
                    exit.reason.as_str().to_string(),
                    exit.value,
                ])),
                Ok(KillOutcome::NotRunning) => Ok(Reply::ok(["not_running"])),
                Ok(KillOutcome::StillRunning) => {
                    Ok(Reply::error::<_, String>("still_running", []))
                }
                Ok(KillOutcome::Failed(detail)) => {
                    debug!(detail = %detail, "killscript failed");
                    Ok(Reply::error::<_, String>("failed", []))
                }
                Err(_) => Ok(Reply::error::<_, String>("failed", [])),
            }
        }

        other => Ok(Reply::invalid(&format!("unknown message {other}"))),
    }
}
