//! End-to-end control-socket scenarios: a real client line stream against
//! the full daemon, with the spawner scripted.

mod common;

use common::{boot, RawClient};

const EMPTY_CONFIG: &str = "service: {}\n";

const WEB_CONFIG: &str = r#"
service:
  web:
    run: ["/usr/bin/web"]
    goal: once
    action:
      stop:
        run: { internal: "killscript SIGTERM 0.05" }
"#;

#[tokio::test]
async fn echo_roundtrips_exactly() {
    let daemon = boot(EMPTY_CONFIG, vec!["statedump_complete"]).await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client.send("0\techo\thello\tworld\n").await;
    assert_eq!(client.recv_line().await, "0\tok\thello\tworld\n");
}

#[tokio::test]
async fn unknown_command_is_invalid() {
    let daemon = boot(EMPTY_CONFIG, vec!["statedump_complete"]).await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client.send("7\tfrobnicate\tx\n").await;
    assert_eq!(
        client.recv_line().await,
        "7\terror\tinvalid\tunknown message frobnicate\n"
    );
}

#[tokio::test]
async fn service_action_start_completes() {
    let daemon = boot(WEB_CONFIG, vec!["statedump_complete"]).await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client.send("0\tservice_action\tweb\tstart\n").await;
    assert_eq!(client.recv_line().await, "0\tok\tcomplete\n");
}

#[tokio::test]
async fn service_action_unknown_service_is_invalid() {
    let daemon = boot(EMPTY_CONFIG, vec!["statedump_complete"]).await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client.send("5\tservice_action\tghost\tstart\n").await;
    assert_eq!(
        client.recv_line().await,
        "5\terror\tinvalid\tunknown service\n"
    );
}

#[tokio::test]
async fn killscript_reports_reap_and_sends_no_further_signals() {
    let daemon = boot(
        EMPTY_CONFIG,
        vec!["service.state\tw\tup\t42", "statedump_complete"],
    )
    .await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client.send("3\tkillscript\tw\tSIGTERM 5 SIGKILL 1\n").await;
    daemon
        .fake
        .wait_for(|sent| {
            sent.iter()
                .any(|f| f == &["service.signal", "w", "SIGTERM"])
        })
        .await;
    daemon.fake.inject("service.exit\tw\tsignal\tSIGTERM");

    assert_eq!(
        client.recv_line().await,
        "3\tok\treaped\tsignal\tSIGTERM\n"
    );
    assert_eq!(daemon.fake.sent_named("service.signal").len(), 1);
}

#[tokio::test]
async fn killscript_exhausts_to_still_running() {
    let daemon = boot(
        EMPTY_CONFIG,
        vec!["service.state\tw\tup\t42", "statedump_complete"],
    )
    .await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client
        .send("3\tkillscript\tw\tSIGTERM 0.05 SIGKILL 0.05\n")
        .await;
    assert_eq!(client.recv_line().await, "3\terror\tstill_running\n");

    let signals = daemon.fake.sent_named("service.signal");
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[1], vec!["service.signal", "w", "SIGKILL"]);
}

#[tokio::test]
async fn killscript_on_stopped_service_is_not_running() {
    let daemon = boot(EMPTY_CONFIG, vec!["statedump_complete"]).await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client.send("9\tkillscript\tidle\tSIGTERM 1\n").await;
    assert_eq!(client.recv_line().await, "9\tok\tnot_running\n");
    assert!(daemon.fake.sent_named("service.signal").is_empty());
}

#[tokio::test]
async fn restricted_tokens_deny_other_services() {
    let config = r#"
service:
  web:
    run: ["/usr/bin/web"]
    goal: once
  db:
    run: ["/usr/bin/db"]
    goal: once
control:
  tokens: ["service_action:web:*"]
"#;
    let daemon = boot(config, vec!["statedump_complete"]).await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client.send("0\tservice_action\tdb\tstart\n").await;
    assert_eq!(client.recv_line().await, "0\terror\tdenied\n");

    client.send("0\tkillscript\tweb\tSIGTERM 1\n").await;
    assert_eq!(client.recv_line().await, "0\terror\tdenied\n");

    // The granted scope still works.
    client.send("0\tservice_action\tweb\tstart\n").await;
    assert_eq!(client.recv_line().await, "0\tok\tcomplete\n");
}

#[tokio::test]
async fn id_zero_commands_answer_in_order() {
    let daemon = boot(EMPTY_CONFIG, vec!["statedump_complete"]).await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    client
        .send("0\techo\tone\n0\techo\ttwo\n0\techo\tthree\n")
        .await;
    assert_eq!(client.recv_line().await, "0\tok\tone\n");
    assert_eq!(client.recv_line().await, "0\tok\ttwo\n");
    assert_eq!(client.recv_line().await, "0\tok\tthree\n");
}

#[tokio::test]
async fn interleaved_ids_each_get_one_reply() {
    let daemon = boot(
        EMPTY_CONFIG,
        vec!["service.state\tw\tup\t42", "statedump_complete"],
    )
    .await;
    let mut client = RawClient::connect(&daemon.socket_path).await;

    // A slow command on id 2 does not block id 4.
    client.send("2\tkillscript\tw\tSIGTERM 5\n").await;
    client.send("4\techo\tquick\n").await;
    assert_eq!(client.recv_line().await, "4\tok\tquick\n");

    daemon.fake.inject("service.exit\tw\texit\t0");
    assert_eq!(client.recv_line().await, "2\tok\treaped\texit\t0\n");
}
