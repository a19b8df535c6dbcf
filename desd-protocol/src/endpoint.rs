//! Protocol endpoint: the client and server roles composed over the
//! framing layer.
//!
//! Both roles share the wire rules: every command carries a correlation
//! id, id `0` means synchronous (replies for id 0 are emitted in order,
//! never interleaved with other lines), and every command terminates in
//! exactly one `ok`/`error` line with the same id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{ClientError, FrameError};
use crate::frame::{FrameReader, FrameWriter, Message};
use crate::registry::Registry;

pub const VERB_OK: &str = "ok";
pub const VERB_ERROR: &str = "error";

/// A terminal reply: the fields after the correlation id, starting with
/// `ok` or `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub fields: Vec<String>,
}

impl Reply {
    pub fn ok<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = vec![VERB_OK.to_string()];
        fields.extend(args.into_iter().map(Into::into));
        Reply { fields }
    }

    pub fn error<I, S>(kind: &str, detail: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = vec![VERB_ERROR.to_string(), kind.to_string()];
        fields.extend(detail.into_iter().map(Into::into));
        Reply { fields }
    }

    pub fn invalid(detail: &str) -> Self {
        if detail.is_empty() {
            Reply::error::<_, String>("invalid", [])
        } else {
            Reply::error("invalid", [detail])
        }
    }

    pub fn is_ok(&self) -> bool {
        self.verb() == VERB_OK
    }

    pub fn verb(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// Fields after the `ok`/`error` verb.
    pub fn args(&self) -> &[String] {
        self.fields.get(1..).unwrap_or(&[])
    }
}

fn is_terminal_verb(verb: &str) -> bool {
    verb == VERB_OK || verb == VERB_ERROR
}

/// Invoked inline from the client's read loop for every non-terminal
/// inbound line, in wire order relative to terminal replies. Must not
/// block.
pub type EventCallback = Box<dyn Fn(Message) + Send + Sync>;

// ---------------------------------------------------------------------------
// Client role
// ---------------------------------------------------------------------------

struct PendingState {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

struct ClientShared {
    registry: Registry,
    writer: tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>,
    state: parking_lot::Mutex<PendingState>,
}

/// The client role of an endpoint: correlates outbound commands with ids,
/// routes inbound terminal replies to their waiters, and hands non-terminal
/// lines (events) to an optional channel.
///
/// Cloning yields another handle onto the same connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
    reader: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl Client {
    /// Build a client over a connected stream. When `events` is set,
    /// non-terminal inbound lines are handed to it in read order;
    /// otherwise they are discarded.
    pub fn new(stream: UnixStream, registry: Registry, events: Option<EventCallback>) -> Self {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(ClientShared {
            registry,
            writer: tokio::sync::Mutex::new(FrameWriter::new(write_half)),
            state: parking_lot::Mutex::new(PendingState {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            }),
        });
        let reader = tokio::spawn(client_read_loop(read_half, shared.clone(), events));
        Client {
            shared,
            reader: Arc::new(parking_lot::Mutex::new(Some(reader))),
        }
    }

    /// Send a command with a fresh non-zero correlation id and await its
    /// terminal reply.
    pub async fn call<I, S>(&self, name: &str, args: I) -> Result<Reply, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.validate(name, &args)?;

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ClientError::Disconnected);
            }
            let id = Self::allocate_id(&mut state);
            state.pending.insert(id, tx);
            id
        };

        if let Err(e) = self.write(Message::new(id, name, args)).await {
            self.shared.state.lock().pending.remove(&id);
            return Err(e);
        }
        rx.await.map_err(|_| ClientError::Canceled)
    }

    /// Send a command on correlation id `0` and await its reply. The server
    /// guarantees id-0 replies arrive in send order before any other line,
    /// so at most one id-0 command may be in flight here.
    pub async fn call_sync<I, S>(&self, name: &str, args: I) -> Result<Reply, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.validate(name, &args)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ClientError::Disconnected);
            }
            if state.pending.contains_key(&0) {
                return Err(ClientError::InvalidOutbound {
                    name: name.to_string(),
                });
            }
            state.pending.insert(0, tx);
        }

        if let Err(e) = self.write(Message::new(0, name, args)).await {
            self.shared.state.lock().pending.remove(&0);
            return Err(e);
        }
        rx.await.map_err(|_| ClientError::Canceled)
    }

    /// Tear the endpoint down: stop the reader and fail every pending
    /// command with "canceled".
    pub fn close(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.pending.clear();
    }

    fn validate(&self, name: &str, args: &[String]) -> Result<(), ClientError> {
        let validator = self
            .shared
            .registry
            .lookup(name)
            .ok_or_else(|| ClientError::InvalidOutbound {
                name: name.to_string(),
            })?;
        if !validator(args) {
            return Err(ClientError::InvalidOutbound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn write(&self, msg: Message) -> Result<(), ClientError> {
        let mut writer = self.shared.writer.lock().await;
        writer.send(&msg).await.map_err(ClientError::from)
    }

    fn allocate_id(state: &mut PendingState) -> u64 {
        loop {
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1);
            if id != 0 && !state.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

async fn client_read_loop(
    read_half: OwnedReadHalf,
    shared: Arc<ClientShared>,
    events: Option<EventCallback>,
) {
    let mut reader = FrameReader::new(BufReader::new(read_half));
    loop {
        match reader.read_message().await {
            Ok(Some(msg)) => {
                if is_terminal_verb(msg.name()) {
                    let waiter = shared.state.lock().pending.remove(&msg.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Reply { fields: msg.fields });
                        }
                        None => debug!(id = msg.id, "terminal reply for unknown correlation id"),
                    }
                } else if let Some(callback) = &events {
                    callback(msg);
                } else {
                    debug!(event = msg.name(), "discarding event with no subscriber");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "framing error from peer, closing endpoint");
                break;
            }
        }
    }
    // Dropping the senders fails every outstanding command with "canceled".
    let mut state = shared.state.lock();
    state.closed = true;
    state.pending.clear();
}

// ---------------------------------------------------------------------------
// Server role
// ---------------------------------------------------------------------------

/// What a command handler produces. `Err` is mapped onto the wire by
/// substring: errors mentioning `denied` become `error denied`, everything
/// else `error failed`.
pub type HandlerResult = anyhow::Result<Reply>;

/// Serve one accepted connection until the peer hangs up.
///
/// Inbound lines are dispatched one at a time. Commands on id `0` run to
/// completion inline so their replies keep total order; commands on
/// non-zero ids run as tasks tracked per id, and a reused in-flight id
/// cancels its predecessor. All replies funnel through a single writer so
/// writes to the peer are totally ordered.
pub async fn serve_connection<F, Fut>(
    stream: UnixStream,
    registry: Registry,
    handler: F,
) -> Result<(), FrameError>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    let (read_half, write_half) = stream.into_split();
    let handler = Arc::new(handler);

    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(write_loop(write_half, reply_rx));

    let result = read_dispatch_loop(read_half, registry, handler, reply_tx).await;

    // Reader done: let the writer drain queued replies, then stop.
    let _ = writer_task.await;
    result
}

async fn write_loop(write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Message>) {
    let mut writer = FrameWriter::new(write_half);
    while let Some(msg) = rx.recv().await {
        if let Err(e) = writer.send(&msg).await {
            debug!(error = %e, "dropping peer: reply write failed");
            break;
        }
    }
}

async fn read_dispatch_loop<F, Fut>(
    read_half: OwnedReadHalf,
    registry: Registry,
    handler: Arc<F>,
    reply_tx: mpsc::UnboundedSender<Message>,
) -> Result<(), FrameError>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    let mut reader = FrameReader::new(BufReader::new(read_half));
    let mut inflight: HashMap<u64, JoinHandle<()>> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();

    let result = loop {
        let msg = tokio::select! {
            msg = reader.read_message() => msg,
            Some(id) = done_rx.recv() => {
                inflight.remove(&id);
                continue;
            }
        };

        match msg {
            Ok(Some(msg)) => {
                dispatch_message(
                    msg,
                    &registry,
                    &handler,
                    &reply_tx,
                    &mut inflight,
                    &done_tx,
                )
                .await;
            }
            Ok(None) => break Ok(()),
            Err(e) if e.is_per_line() => {
                debug!(error = %e, "framing error on inbound line");
                let reply = Reply::invalid("protocol formatting");
                let _ = reply_tx.send(Message {
                    id: 0,
                    fields: reply.fields,
                });
            }
            Err(e) => break Err(e),
        }
    };

    // Endpoint teardown cancels every in-flight handler; dropping their
    // futures disarms any armed continuations before they can fire.
    for (_, task) in inflight.drain() {
        task.abort();
    }
    drop(reply_tx);
    result
}

async fn dispatch_message<F, Fut>(
    msg: Message,
    registry: &Registry,
    handler: &Arc<F>,
    reply_tx: &mpsc::UnboundedSender<Message>,
    inflight: &mut HashMap<u64, JoinHandle<()>>,
    done_tx: &mpsc::UnboundedSender<u64>,
) where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    let id = msg.id;
    let name = msg.name().to_string();

    let validator = match registry.lookup(&name) {
        Some(v) => v,
        None => {
            let reply = Reply::invalid(&format!("unknown message {name}"));
            let _ = reply_tx.send(Message {
                id,
                fields: reply.fields,
            });
            return;
        }
    };
    if !validator(msg.args()) {
        let _ = reply_tx.send(Message {
            id,
            fields: Reply::invalid("").fields,
        });
        return;
    }

    if id == 0 {
        // Synchronous path: the reply must precede any other line, so the
        // handler runs before the next inbound line is read.
        let reply = run_handler(handler, msg).await;
        let _ = reply_tx.send(Message {
            id: 0,
            fields: reply.fields,
        });
        return;
    }

    if let Some(previous) = inflight.remove(&id) {
        warn!(id, command = %name, "correlation id reused while in flight, canceling predecessor");
        previous.abort();
    }

    let handler = handler.clone();
    let reply_tx = reply_tx.clone();
    let done_tx = done_tx.clone();
    let task = tokio::spawn(async move {
        let reply = run_handler(&handler, msg).await;
        let _ = reply_tx.send(Message {
            id,
            fields: reply.fields,
        });
        let _ = done_tx.send(id);
    });
    inflight.insert(id, task);
}

async fn run_handler<F, Fut>(handler: &Arc<F>, msg: Message) -> Reply
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    let command = msg.name().to_string();
    match handler.as_ref()(msg).await {
        Ok(reply) => reply,
        Err(e) => {
            let text = e.to_string();
            debug!(command = %command, error = %text, "handler failed");
            if text.contains("denied") {
                Reply::error::<_, String>("denied", [])
            } else {
                Reply::error::<_, String>("failed", [])
            }
        }
    }
}

#[cfg(test)]
mod tests;
