//! In-process scripted spawner used by unit tests. Speaks the real wire
//! protocol over a socketpair: acknowledges every directive, replays a
//! canned statedump, and lets tests inject event lines and failure
//! behavior.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::spawner::{SpawnerClient, SpawnerNotice};

pub(crate) struct FakeSpawner {
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    inject_tx: mpsc::UnboundedSender<String>,
}

impl FakeSpawner {
    /// Start the scripted peer. `dump` lines are replayed as id-0 events
    /// when a `statedump` arrives. Any directive whose fields contain the
    /// literal `reject` is answered with `error invalid`.
    pub(crate) fn start(dump: Vec<&str>) -> (FakeSpawner, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let commands: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<String>();
        let dump: Vec<String> = dump.into_iter().map(str::to_string).collect();

        let recorded = commands.clone();
        tokio::spawn(async move {
            let (rx, mut tx) = ours.into_split();
            let mut reader = BufReader::new(rx);
            let mut line = String::new();
            let mut next_pid: u64 = 100;
            loop {
                line.clear();
                tokio::select! {
                    read = reader.read_line(&mut line) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        let fields: Vec<String> =
                            line.trim_end().split('\t').map(str::to_string).collect();
                        let id = fields[0].clone();
                        let name = fields[1].clone();
                        recorded.lock().push(fields[1..].to_vec());

                        if name == "statedump" {
                            for event in &dump {
                                if tx.write_all(format!("0\t{event}\n").as_bytes()).await.is_err() {
                                    return;
                                }
                            }
                        }
                        let rejected = fields.iter().any(|f| f == "reject");
                        let reply = if rejected {
                            format!("{id}\terror\tinvalid\n")
                        } else {
                            format!("{id}\tok\n")
                        };
                        if tx.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                        // A started service comes up, like the real host.
                        if name == "service.start" && !rejected {
                            let event =
                                format!("0\tservice.state\t{}\tup\t{next_pid}\n", fields[2]);
                            next_pid += 1;
                            if tx.write_all(event.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(event) = inject_rx.recv() => {
                        if tx.write_all(format!("0\t{event}\n").as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (
            FakeSpawner {
                commands,
                inject_tx,
            },
            theirs,
        )
    }

    /// Write an event line (without the leading id field) to the peer.
    pub(crate) fn inject(&self, event: &str) {
        self.inject_tx.send(event.to_string()).unwrap();
    }

    /// Every directive received so far, name first, id stripped.
    pub(crate) fn sent(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    pub(crate) fn sent_named(&self, name: &str) -> Vec<Vec<String>> {
        self.sent()
            .into_iter()
            .filter(|fields| fields[0] == name)
            .collect()
    }
}

/// A connected spawner client over a fresh fake peer.
pub(crate) fn connected_spawner(
    dump: Vec<&str>,
) -> (
    FakeSpawner,
    SpawnerClient,
    mpsc::UnboundedReceiver<SpawnerNotice>,
) {
    let (fake, stream) = FakeSpawner::start(dump);
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let client = SpawnerClient::connect(stream, notice_tx);
    (fake, client, notice_rx)
}

/// Wait until `predicate` holds over the fake's received directives, with
/// a bounded number of scheduling yields.
pub(crate) async fn wait_for(fake: &FakeSpawner, predicate: impl Fn(&[Vec<String>]) -> bool) {
    for _ in 0..200 {
        if predicate(&fake.sent()) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached; directives so far: {:?}", fake.sent());
}
