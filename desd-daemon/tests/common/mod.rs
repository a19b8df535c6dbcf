//! Harness for control-socket scenarios: a scripted spawner speaking the
//! real wire protocol, a full core, and a raw line-level client.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use desd_daemon::config::ConfigSnapshot;
use desd_daemon::control;
use desd_daemon::reconciler::{Core, Work};
use desd_daemon::spawner::SpawnerClient;

pub struct FakeSpawner {
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    inject_tx: mpsc::UnboundedSender<String>,
}

impl FakeSpawner {
    pub fn start(dump: Vec<&str>) -> (FakeSpawner, UnixStream) {
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
                        if tx.write_all(format!("{id}\tok\n").as_bytes()).await.is_err() {
                            return;
                        }
                        if name == "service.start" {
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

    pub fn inject(&self, event: &str) {
        self.inject_tx.send(event.to_string()).unwrap();
    }

    pub fn sent(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    pub fn sent_named(&self, name: &str) -> Vec<Vec<String>> {
        self.sent()
            .into_iter()
            .filter(|fields| fields[0] == name)
            .collect()
    }

    pub async fn wait_for(&self, predicate: impl Fn(&[Vec<String>]) -> bool) {
        for _ in 0..200 {
            if predicate(&self.sent()) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached; directives so far: {:?}", self.sent());
    }
}

pub struct TestDaemon {
    pub fake: FakeSpawner,
    pub socket_path: PathBuf,
    pub work_tx: mpsc::UnboundedSender<Work>,
    _dir: tempfile::TempDir,
}

/// Boot a full daemon (core + control server) against a scripted spawner.
pub async fn boot(config: &str, dump: Vec<&str>) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("desd.conf.yaml");
    std::fs::write(&config_path, config).unwrap();
    let cfg = ConfigSnapshot::load(&config_path).unwrap();

    let (fake, stream) = FakeSpawner::start(dump);
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let spawner = SpawnerClient::connect(stream, notice_tx);

    let (core, work_tx) = Core::new(cfg, Some(config_path), spawner, notice_rx, None);
    tokio::spawn(core.run());

    let socket_path = dir.path().join("desd.sock");
    let listener = control::bind_control_socket(&socket_path).unwrap();
    tokio::spawn(control::run_control_server(listener, work_tx.clone()));

    // The statedump fence has completed once the echo went out.
    let daemon = TestDaemon {
        fake,
        socket_path,
        work_tx,
        _dir: dir,
    };
    daemon
        .fake
        .wait_for(|sent| sent.iter().any(|f| f[0] == "echo"))
        .await;
    daemon
}

/// Raw line-level control client for exact-byte assertions.
pub struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    pub async fn connect(path: &std::path::Path) -> RawClient {
        let stream = UnixStream::connect(path).await.unwrap();
        let (rx, tx) = stream.into_split();
        RawClient {
            reader: BufReader::new(rx),
            writer: tx,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    pub async fn recv_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }
}
