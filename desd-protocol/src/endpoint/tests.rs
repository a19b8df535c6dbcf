use super::*;
use crate::registry::control_registry;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

fn echo_handler(msg: Message) -> impl std::future::Future<Output = HandlerResult> + Send {
    async move {
        match msg.name() {
            "echo" => Ok(Reply::ok(msg.args().to_vec())),
            "service_action" => {
                if msg.args()[0] == "locked" {
                    Err(anyhow::anyhow!("access denied for {}", msg.args()[0]))
                } else if msg.args()[0] == "broken" {
                    Err(anyhow::anyhow!("something else went wrong"))
                } else if msg.args()[0] == "slow" {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    Ok(Reply::ok(["complete"]))
                } else {
                    Ok(Reply::ok(["complete"]))
                }
            }
            other => Ok(Reply::invalid(&format!("unknown message {other}"))),
        }
    }
}

/// Spawn a server over one end of a socketpair and return the raw peer end.
fn start_server() -> UnixStream {
    let (server, peer) = UnixStream::pair().unwrap();
    tokio::spawn(async move {
        let _ = serve_connection(server, control_registry(), echo_handler).await;
    });
    peer
}

async fn read_line(reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

#[tokio::test]
async fn echo_roundtrips_fields_verbatim() {
    let peer = start_server();
    let (rx, mut tx) = peer.into_split();
    let mut reader = BufReader::new(rx);

    tx.write_all(b"0\techo\thello\tworld\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "0\tok\thello\tworld\n");
}

#[tokio::test]
async fn unknown_command_yields_error_invalid() {
    let peer = start_server();
    let (rx, mut tx) = peer.into_split();
    let mut reader = BufReader::new(rx);

    tx.write_all(b"7\tfrobnicate\tx\n").await.unwrap();
    assert_eq!(
        read_line(&mut reader).await,
        "7\terror\tinvalid\tunknown message frobnicate\n"
    );
}

#[tokio::test]
async fn failing_validator_yields_error_invalid() {
    let peer = start_server();
    let (rx, mut tx) = peer.into_split();
    let mut reader = BufReader::new(rx);

    // service_action wants exactly two well-formed names.
    tx.write_all(b"4\tservice_action\tweb\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "4\terror\tinvalid\n");
}

#[tokio::test]
async fn malformed_line_reports_formatting_error_and_recovers() {
    let peer = start_server();
    let (rx, mut tx) = peer.into_split();
    let mut reader = BufReader::new(rx);

    tx.write_all(b"abc\techo\thi\n").await.unwrap();
    assert_eq!(
        read_line(&mut reader).await,
        "0\terror\tinvalid\tprotocol formatting\n"
    );

    // The endpoint keeps reading after a per-line framing error.
    tx.write_all(b"0\techo\tstill-alive\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "0\tok\tstill-alive\n");
}

#[tokio::test]
async fn id_zero_replies_preserve_send_order() {
    let peer = start_server();
    let (rx, mut tx) = peer.into_split();
    let mut reader = BufReader::new(rx);

    tx.write_all(b"0\techo\tfirst\n0\techo\tsecond\n0\techo\tthird\n")
        .await
        .unwrap();
    assert_eq!(read_line(&mut reader).await, "0\tok\tfirst\n");
    assert_eq!(read_line(&mut reader).await, "0\tok\tsecond\n");
    assert_eq!(read_line(&mut reader).await, "0\tok\tthird\n");
}

#[tokio::test]
async fn distinct_ids_each_get_one_terminal_reply() {
    let peer = start_server();
    let (rx, mut tx) = peer.into_split();
    let mut reader = BufReader::new(rx);

    tx.write_all(b"1\techo\ta\n2\techo\tb\n3\techo\tc\n")
        .await
        .unwrap();

    let mut seen = std::collections::HashMap::new();
    for _ in 0..3 {
        let line = read_line(&mut reader).await;
        let mut fields = line.trim_end().split('\t');
        let id: u64 = fields.next().unwrap().parse().unwrap();
        assert_eq!(fields.next().unwrap(), "ok");
        let prev = seen.insert(id, fields.next().unwrap().to_string());
        assert!(prev.is_none(), "duplicate terminal reply for id {id}");
    }
    assert_eq!(seen[&1], "a");
    assert_eq!(seen[&2], "b");
    assert_eq!(seen[&3], "c");
}

#[tokio::test]
async fn reused_inflight_id_cancels_predecessor() {
    let peer = start_server();
    let (rx, mut tx) = peer.into_split();
    let mut reader = BufReader::new(rx);

    // First command on id 5 parks in the handler; the second takes the id.
    tx.write_all(b"5\tservice_action\tslow\tstart\n").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    tx.write_all(b"5\tservice_action\tweb\tstart\n").await.unwrap();

    assert_eq!(read_line(&mut reader).await, "5\tok\tcomplete\n");
}

#[tokio::test]
async fn handler_errors_map_by_substring() {
    let peer = start_server();
    let (rx, mut tx) = peer.into_split();
    let mut reader = BufReader::new(rx);

    tx.write_all(b"0\tservice_action\tlocked\tstart\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "0\terror\tdenied\n");

    tx.write_all(b"0\tservice_action\tbroken\tstart\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "0\terror\tfailed\n");
}

#[tokio::test]
async fn client_call_correlates_interleaved_replies() {
    let (server, peer) = UnixStream::pair().unwrap();
    tokio::spawn(async move {
        let _ = serve_connection(server, control_registry(), echo_handler).await;
    });

    let client = Client::new(peer, control_registry(), None);
    let (a, b) = tokio::join!(client.call("echo", ["a"]), client.call("echo", ["b"]));
    let a = a.unwrap();
    let b = b.unwrap();
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(a.args(), ["a".to_string()]);
    assert_eq!(b.args(), ["b".to_string()]);
}

#[tokio::test]
async fn client_call_sync_uses_id_zero() {
    let (server, peer) = UnixStream::pair().unwrap();
    let (raw_rx, raw_tx) = server.into_split();
    // Hand-rolled peer that asserts the id and answers on id 0.
    tokio::spawn(async move {
        let mut reader = BufReader::new(raw_rx);
        let mut writer = raw_tx;
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("0\techo\t"));
        writer.write_all(b"0\tok\tpong\n").await.unwrap();
    });

    let client = Client::new(peer, control_registry(), None);
    let reply = client.call_sync("echo", ["pong"]).await.unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.args(), ["pong".to_string()]);
}

#[tokio::test]
async fn client_rejects_invalid_outbound() {
    let (_server, peer) = UnixStream::pair().unwrap();
    let client = Client::new(peer, control_registry(), None);

    let err = client.call("nonsense", Vec::<String>::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidOutbound { .. }));

    let err = client
        .call("service_action", ["only-one-arg"])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidOutbound { .. }));
}

#[tokio::test]
async fn client_close_cancels_pending_commands() {
    let (_server, peer) = UnixStream::pair().unwrap();
    let client = Client::new(peer, control_registry(), None);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("echo", ["never answered"]).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    client.close();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Canceled));
}

#[tokio::test]
async fn client_peer_hangup_cancels_pending_commands() {
    let (server, peer) = UnixStream::pair().unwrap();
    let client = Client::new(peer, control_registry(), None);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("echo", ["x"]).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    drop(server);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Canceled));
}

#[tokio::test]
async fn client_routes_events_to_channel() {
    let (server, peer) = UnixStream::pair().unwrap();
    let (mut raw_rx, mut raw_tx) = {
        let (r, t) = server.into_split();
        (BufReader::new(r), t)
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let callback: EventCallback = Box::new(move |msg| {
        let _ = event_tx.send(msg);
    });
    let client = Client::new(peer, control_registry(), Some(callback));

    // An unsolicited event, then the reply to the client's command.
    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("echo", ["hi"]).await })
    };
    let mut line = String::new();
    raw_rx.read_line(&mut line).await.unwrap();
    raw_tx
        .write_all(b"0\tservice.state\tweb\tUP\t42\n")
        .await
        .unwrap();
    let id: u64 = line.split('\t').next().unwrap().parse().unwrap();
    raw_tx
        .write_all(format!("{id}\tok\thi\n").as_bytes())
        .await
        .unwrap();

    let event = event_rx.recv().await.unwrap();
    assert_eq!(event.name(), "service.state");
    assert_eq!(event.args(), ["web".to_string(), "UP".to_string(), "42".to_string()]);

    let reply = caller.await.unwrap().unwrap();
    assert!(reply.is_ok());
}
