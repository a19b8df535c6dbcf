use super::*;
use tokio::io::{AsyncWriteExt, BufReader};

#[test]
fn encode_joins_fields_with_tabs() {
    let msg = Message::new(3, "echo", ["hello", "world"]);
    assert_eq!(encode(&msg).unwrap(), "3\techo\thello\tworld\n");
}

#[test]
fn encode_allows_empty_argument_fields() {
    let msg = Message::new(0, "echo", ["", "x"]);
    assert_eq!(encode(&msg).unwrap(), "0\techo\t\tx\n");
}

#[test]
fn encode_rejects_tab_in_field() {
    let msg = Message::new(1, "echo", ["a\tb"]);
    assert!(matches!(
        encode(&msg),
        Err(FrameError::ForbiddenByte { index: 2 })
    ));
}

#[test]
fn encode_rejects_lf_in_field() {
    let msg = Message::new(1, "echo", ["a\nb"]);
    assert!(matches!(encode(&msg), Err(FrameError::ForbiddenByte { .. })));
}

#[test]
fn encode_rejects_empty_command() {
    let msg = Message { id: 1, fields: vec![] };
    assert!(matches!(encode(&msg), Err(FrameError::MissingCommand)));
}

#[test]
fn parse_roundtrips_encode() {
    let msg = Message::new(42, "service.args", ["web", "/usr/bin/web", "--port", "80"]);
    let line = encode(&msg).unwrap();
    let parsed = parse(line.trim_end_matches('\n')).unwrap();
    assert_eq!(parsed, msg);
}

#[test]
fn parse_rejects_empty_id() {
    assert!(matches!(
        parse("\techo\thi"),
        Err(FrameError::BadCorrelationId)
    ));
}

#[test]
fn parse_rejects_non_numeric_id() {
    assert!(matches!(
        parse("abc\techo"),
        Err(FrameError::BadCorrelationId)
    ));
    assert!(matches!(
        parse("-1\techo"),
        Err(FrameError::BadCorrelationId)
    ));
    assert!(matches!(
        parse("1x\techo"),
        Err(FrameError::BadCorrelationId)
    ));
}

#[test]
fn parse_rejects_id_overflow() {
    assert!(matches!(
        parse("99999999999999999999999\techo"),
        Err(FrameError::BadCorrelationId)
    ));
}

#[test]
fn parse_rejects_missing_command() {
    assert!(matches!(parse("7"), Err(FrameError::MissingCommand)));
    assert!(matches!(parse("7\t"), Err(FrameError::MissingCommand)));
}

#[test]
fn parse_keeps_empty_trailing_fields() {
    let msg = parse("5\techo\t\t").unwrap();
    assert_eq!(msg.id, 5);
    assert_eq!(msg.fields, vec!["echo", "", ""]);
}

#[tokio::test]
async fn reader_yields_one_message_per_line() {
    let (mut tx, rx) = tokio::io::duplex(1024);
    tx.write_all(b"0\techo\ta\n7\tstatedump\n").await.unwrap();
    drop(tx);

    let mut reader = FrameReader::new(BufReader::new(rx));
    let first = reader.read_message().await.unwrap().unwrap();
    assert_eq!(first.id, 0);
    assert_eq!(first.name(), "echo");
    assert_eq!(first.args(), ["a".to_string()]);

    let second = reader.read_message().await.unwrap().unwrap();
    assert_eq!(second.id, 7);
    assert_eq!(second.name(), "statedump");

    assert!(reader.read_message().await.unwrap().is_none());
}

#[tokio::test]
async fn reader_accepts_final_line_without_lf() {
    let (mut tx, rx) = tokio::io::duplex(1024);
    tx.write_all(b"1\techo\tlast").await.unwrap();
    drop(tx);

    let mut reader = FrameReader::new(BufReader::new(rx));
    let msg = reader.read_message().await.unwrap().unwrap();
    assert_eq!(msg.args(), ["last".to_string()]);
    assert!(reader.read_message().await.unwrap().is_none());
}

#[tokio::test]
async fn reader_rejects_oversized_line() {
    let (mut tx, rx) = tokio::io::duplex(MAX_LINE_LEN * 2);
    let long = vec![b'x'; MAX_LINE_LEN + 16];
    tx.write_all(b"1\techo\t").await.unwrap();
    tx.write_all(&long).await.unwrap();
    tx.write_all(b"\n").await.unwrap();
    drop(tx);

    let mut reader = FrameReader::new(BufReader::new(rx));
    assert!(matches!(
        reader.read_message().await,
        Err(FrameError::LineTooLong)
    ));
}

#[tokio::test]
async fn reader_rejects_invalid_utf8() {
    let (mut tx, rx) = tokio::io::duplex(1024);
    tx.write_all(b"1\techo\t\xff\xfe\n").await.unwrap();
    drop(tx);

    let mut reader = FrameReader::new(BufReader::new(rx));
    assert!(matches!(
        reader.read_message().await,
        Err(FrameError::NotUtf8)
    ));
}

#[tokio::test]
async fn writer_emits_whole_lines() {
    let (tx, rx) = tokio::io::duplex(1024);
    let mut writer = FrameWriter::new(tx);
    writer
        .send(&Message::new(9, "ok", ["done"]))
        .await
        .unwrap();
    drop(writer);

    let mut reader = FrameReader::new(BufReader::new(rx));
    let msg = reader.read_message().await.unwrap().unwrap();
    assert_eq!(msg.id, 9);
    assert_eq!(msg.fields, vec!["ok", "done"]);
}
