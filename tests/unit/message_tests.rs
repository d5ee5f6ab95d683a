//! Unit tests for the protocol message view and request builder.

use bytes::BytesMut;
use pretty_assertions::assert_eq;
use tokio_util::codec::Decoder;

use repl_intercom::bencode::{encode_to_vec, BencodeCodec, Value};
use repl_intercom::message::Message;
use repl_intercom::Op;

#[test]
fn request_survives_a_wire_round_trip() {
    let msg = Message::request(Op::Eval, "12")
        .field("session", "sess-1")
        .field("code", "(+ 1 2)")
        .field("line", 3_i64);

    let bytes = encode_to_vec(&msg.into_value());
    let mut codec = BencodeCodec::new();
    let mut buf = BytesMut::from(bytes.as_slice());
    let decoded = codec.decode(&mut buf).expect("decode").expect("complete");
    let parsed = Message::from_value(decoded).expect("dictionary");

    assert_eq!(parsed.get_str("op"), Some("eval"));
    assert_eq!(parsed.id(), Some("12"));
    assert_eq!(parsed.session(), Some("sess-1"));
    assert_eq!(parsed.get("line").and_then(Value::as_int), Some(3));
}

#[test]
fn opt_field_skips_absent_values() {
    let msg = Message::request(Op::Eval, "1")
        .opt_field("ns", None::<&str>)
        .opt_field("file", Some("core.clj"));
    assert_eq!(msg.get("ns"), None);
    assert_eq!(msg.get_str("file"), Some("core.clj"));
}

#[test]
fn status_is_a_set_of_tags() {
    let msg = Message::from_value(Value::Dict(vec![
        ("id".into(), Value::Str("9".into())),
        (
            "status".into(),
            Value::List(vec![
                Value::Str("eval-error".into()),
                Value::Str("done".into()),
            ]),
        ),
    ]))
    .expect("dictionary");

    assert!(msg.has_status("done"));
    assert!(msg.has_status("eval-error"));
    assert!(!msg.has_status("interrupted"));
    assert!(msg.is_terminal());
}

#[test]
fn missing_status_means_not_terminal() {
    let msg = Message::from_value(Value::Dict(vec![(
        "out".into(),
        Value::Str("hello\n".into()),
    )]))
    .expect("dictionary");
    assert!(msg.status().is_empty());
    assert!(!msg.is_terminal());
}

#[test]
fn non_dictionary_values_have_no_message_view() {
    assert!(Message::from_value(Value::Int(1)).is_none());
    assert!(Message::from_value(Value::List(vec![])).is_none());
}

#[test]
fn new_session_reads_the_clone_response_field() {
    let msg = Message::from_value(Value::Dict(vec![
        ("id".into(), Value::Str("2".into())),
        ("new-session".into(), Value::Str("sess-7".into())),
    ]))
    .expect("dictionary");
    assert_eq!(msg.new_session(), Some("sess-7"));
}
