//! Client specialization for the spawner host (daemonproxy).
//!
//! Wraps the protocol client: directives go out as correlated commands,
//! event notifications come back through a synchronous callback that
//! updates the shared mirror in wire order, fulfills exit watches, and
//! nudges the reconciler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use desd_protocol::endpoint::EventCallback;
use desd_protocol::{spawner_registry, Client, Message};

use crate::errors::{DaemonError, Result};
use crate::state::{new_shared_mirror, ExitReason, ServiceExit, SharedMirror};

/// What the event stream asks the reconciler to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnerNotice {
    Service(String),
    Signal(String),
}

type ExitWatches = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<ServiceExit>>>>>;

/// Handle onto the spawner connection. Cloning shares the connection,
/// mirror, and watch table.
#[derive(Clone)]
pub struct SpawnerClient {
    client: Client,
    mirror: SharedMirror,
    watches: ExitWatches,
}

impl SpawnerClient {
    /// Wrap a connected spawner stream. Reconciliation nudges go to
    /// `notices`.
    pub fn connect(stream: UnixStream, notices: mpsc::UnboundedSender<SpawnerNotice>) -> Self {
        let mirror = new_shared_mirror();
        let watches: ExitWatches = Arc::new(Mutex::new(HashMap::new()));

        let callback: EventCallback = {
            let mirror = mirror.clone();
            let watches = watches.clone();
            Box::new(move |msg| handle_event(&mirror, &watches, &notices, msg))
        };
        let client = Client::new(stream, spawner_registry(), Some(callback));

        SpawnerClient {
            client,
            mirror,
            watches,
        }
    }

    pub fn mirror(&self) -> SharedMirror {
        self.mirror.clone()
    }

    /// Rebuild the mirror: reset, request a statedump, and use an echo
    /// round-trip as the completion fence. Replies and events share one
    /// ordered stream, so when the echo returns every dump line has been
    /// applied.
    pub async fn resync(&self) -> Result<()> {
        self.mirror.write().reset();
        self.directive("statedump", Vec::new()).await?;
        self.directive("echo", vec!["statedump_complete".to_string()])
            .await?;
        self.mirror.write().synced = true;
        Ok(())
    }

    /// Subscribe to the next reap of `service`. The sender side is pruned
    /// when the receiver is dropped.
    pub fn watch_exit(&self, service: &str) -> oneshot::Receiver<ServiceExit> {
        let (tx, rx) = oneshot::channel();
        self.watches
            .lock()
            .entry(service.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn set_args(&self, service: &str, argv: &[String]) -> Result<()> {
        let mut args = vec![service.to_string()];
        args.extend(argv.iter().cloned());
        self.directive("service.args", args).await?;
        self.mirror.write().note_args(service, argv.to_vec());
        Ok(())
    }

    pub async fn set_fds(&self, service: &str, handles: &[String]) -> Result<()> {
        let mut args = vec![service.to_string()];
        args.extend(handles.iter().cloned());
        self.directive("service.fds", args).await?;
        self.mirror.write().note_fds(service, handles.to_vec());
        Ok(())
    }

    pub async fn set_auto_up(&self, service: &str, enabled: bool, scope: &str) -> Result<()> {
        self.directive(
            "service.auto_up",
            vec![
                service.to_string(),
                if enabled { "1" } else { "0" }.to_string(),
                scope.to_string(),
            ],
        )
        .await?;
        self.mirror.write().note_auto_up(service, enabled);
        Ok(())
    }

    pub async fn start(&self, service: &str) -> Result<()> {
        self.directive("service.start", vec![service.to_string()])
            .await?;
        Ok(())
    }

    pub async fn signal(&self, service: &str, signal: &str) -> Result<()> {
        self.directive(
            "service.signal",
            vec![service.to_string(), signal.to_string()],
        )
        .await?;
        Ok(())
    }

    pub async fn delete(&self, service: &str) -> Result<()> {
        self.directive("service.delete", vec![service.to_string()])
            .await?;
        self.mirror.write().remove_service(service);
        Ok(())
    }

    pub async fn tag(&self, service: &str, key: &str, value: &str) -> Result<()> {
        self.directive(
            "service.tag",
            vec![service.to_string(), key.to_string(), value.to_string()],
        )
        .await?;
        self.mirror.write().note_tag(service, key, value);
        Ok(())
    }

    pub async fn clear_signal(&self, signal: &str) -> Result<()> {
        self.directive("signal.clear", vec![signal.to_string()])
            .await?;
        self.mirror.write().clear_signal(signal);
        Ok(())
    }

    /// Close the connection; pending directives fail with "canceled".
    pub fn close(&self) {
        self.client.close();
    }

    async fn directive(&self, command: &'static str, args: Vec<String>) -> Result<Vec<String>> {
        let reply = self.client.call(command, args).await?;
        if reply.is_ok() {
            Ok(reply.args().to_vec())
        } else {
            Err(DaemonError::SpawnerRejected {
                command: command.to_string(),
                detail: reply.args().join(" "),
            })
        }
    }
}

/// Apply one inbound spawner event. Runs inline in the read loop, so the
/// mirror always reflects everything read before any later reply.
fn handle_event(
    mirror: &SharedMirror,
    watches: &ExitWatches,
    notices: &mpsc::UnboundedSender<SpawnerNotice>,
    msg: Message,
) {
    let args = msg.args();
    match msg.name() {
        "service.state" => {
            if args.len() < 2 {
                warn!("malformed service.state event");
                return;
            }
            let name = &args[0];
            let up = args[1].eq_ignore_ascii_case("up");
            let pid = args.get(2).and_then(|p| p.parse::<u64>().ok());
            mirror.write().note_state(name, up, pid);
            let _ = notices.send(SpawnerNotice::Service(name.clone()));
        }
        "service.exit" => {
            if args.len() < 3 {
                warn!("malformed service.exit event");
                return;
            }
            let name = &args[0];
            let reason = match ExitReason::from_wire(&args[1]) {
                Some(reason) => reason,
                None => {
                    warn!(reason = %args[1], "unknown exit reason");
                    return;
                }
            };
            let exit = ServiceExit {
                reason,
                value: args[2].clone(),
            };
            mirror.write().note_exit(name, exit.clone());
            if let Some(waiters) = watches.lock().remove(name) {
                for tx in waiters {
                    let _ = tx.send(exit.clone());
                }
            }
            let _ = notices.send(SpawnerNotice::Service(name.clone()));
        }
        "service.args" => {
            if args.is_empty() {
                return;
            }
            mirror.write().note_args(&args[0], args[1..].to_vec());
        }
        "service.fds" => {
            if args.is_empty() {
                return;
            }
            mirror.write().note_fds(&args[0], args[1..].to_vec());
        }
        "service.auto_up" => {
            if args.len() < 2 {
                return;
            }
            mirror.write().note_auto_up(&args[0], args[1] == "1");
        }
        "service.tag" => {
            if args.len() < 3 {
                return;
            }
            mirror.write().note_tag(&args[0], &args[1], &args[2]);
        }
        "signal" => {
            if args.is_empty() {
                warn!("malformed signal event");
                return;
            }
            mirror.write().note_signal(&args[0]);
            let _ = notices.send(SpawnerNotice::Signal(args[0].clone()));
        }
        "statedump_complete" => {
            mirror.write().synced = true;
        }
        other => {
            debug!(event = other, "ignoring unrecognized spawner event");
        }
    }
}
