//! Unit tests for `OutputLineCodec` framing of captured process output.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use futures_util::StreamExt;

use pimd_orchestrator::orchestrator::codec::{OutputLineCodec, MAX_LINE_BYTES};

/// Every complete line in the buffer is emitted in order.
#[test]
fn splits_batched_lines() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from("step 1\nstep 2\n");

    assert_eq!(codec.decode(&mut buf).unwrap(), Some("step 1".to_owned()));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("step 2".to_owned()));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

/// A partial line stays buffered until its newline arrives.
#[test]
fn buffers_partial_line() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from("Starting MD");

    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    buf.extend_from_slice(b" run\n");
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some("Starting MD run".to_owned())
    );
}

/// CRLF endings lose the carriage return; empty lines are kept.
#[test]
fn strips_carriage_return_and_keeps_empty_lines() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from("done\r\n\n");

    assert_eq!(codec.decode(&mut buf).unwrap(), Some("done".to_owned()));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(String::new()));
}

/// Invalid UTF-8 is replaced instead of failing the stream.
#[test]
fn replaces_invalid_utf8() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from(&b"T=\xff300K\n"[..]);

    let line = codec.decode(&mut buf).unwrap().unwrap();
    assert!(line.starts_with("T="));
    assert!(line.ends_with("300K"));
    assert!(line.contains('\u{fffd}'));
}

/// A line longer than the limit is emitted in limit-sized pieces.
#[test]
fn splits_overlong_line() {
    let mut codec = OutputLineCodec::with_max_length(4);
    let mut buf = BytesMut::from("abcdefghij\n");

    assert_eq!(codec.decode(&mut buf).unwrap(), Some("abcd".to_owned()));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("efgh".to_owned()));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("ij".to_owned()));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

/// The stock limit is 64 KiB.
#[test]
fn default_limit_is_64_kib() {
    assert_eq!(MAX_LINE_BYTES, 64 * 1024);
    let mut codec = OutputLineCodec::default();
    let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_BYTES + 10].as_slice());

    let first = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(first.len(), MAX_LINE_BYTES);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert_eq!(buf.len(), 10);
}

/// An unterminated final line is emitted at end of stream.
#[test]
fn flushes_trailing_text_at_eof() {
    let mut codec = OutputLineCodec::new();
    let mut buf = BytesMut::from("last words");

    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert_eq!(
        codec.decode_eof(&mut buf).unwrap(),
        Some("last words".to_owned())
    );
    assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
}

/// Framing over an async reader yields every line, including the last.
#[tokio::test]
async fn frames_async_reader() {
    let input: &[u8] = b"A\nB\r\nC";
    let lines: Vec<String> = FramedRead::new(input, OutputLineCodec::new())
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(lines, ["A", "B", "C"]);
}
