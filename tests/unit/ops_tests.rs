//! Unit tests for the op vocabulary and capability set.

use pretty_assertions::assert_eq;

use repl_intercom::bencode::Value;
use repl_intercom::message::Message;
use repl_intercom::ops::{CapabilitySet, Op};

/// Every op the client knows, paired with its wire spelling.
const ALL_OPS: &[(Op, &str)] = &[
    (Op::Eval, "eval"),
    (Op::Clone, "clone"),
    (Op::Describe, "describe"),
    (Op::Close, "close"),
    (Op::Interrupt, "interrupt"),
    (Op::Stdin, "stdin"),
    (Op::LoadFile, "load-file"),
    (Op::Complete, "complete"),
    (Op::Info, "info"),
    (Op::Classpath, "classpath"),
    (Op::TestVarQuery, "test-var-query"),
    (Op::TestStacktrace, "test-stacktrace"),
    (Op::Retest, "retest"),
    (Op::NsLoadAll, "ns-load-all"),
    (Op::NsList, "ns-list"),
    (Op::NsPath, "ns-path"),
    (Op::Refresh, "refresh"),
    (Op::RefreshAll, "refresh-all"),
    (Op::FormatCode, "format-code"),
    (Op::InitDebugger, "init-debugger"),
    (Op::DebugInput, "debug-input"),
    (Op::DebugInstrumentedDefs, "debug-instrumented-defs"),
    (Op::LsSessions, "ls-sessions"),
    (Op::OutSubscribe, "out-subscribe"),
    (Op::Stacktrace, "stacktrace"),
    (Op::ClojuredocsRefreshCache, "clojuredocs-refresh-cache"),
    (Op::ClojuredocsLookup, "clojuredocs-lookup"),
];

#[test]
fn every_op_name_round_trips() {
    for (op, name) in ALL_OPS {
        assert_eq!(op.as_str(), *name);
        assert_eq!(Op::from_name(name), Some(*op));
        assert_eq!(op.to_string(), *name);
    }
}

#[test]
fn full_describe_yields_a_full_capability_set() {
    let entries: Vec<(String, Value)> = ALL_OPS
        .iter()
        .map(|(_, name)| ((*name).to_owned(), Value::Dict(vec![])))
        .collect();
    let describe =
        Message::from_value(Value::Dict(vec![("ops".into(), Value::Dict(entries))]))
            .expect("dictionary");

    let caps = CapabilitySet::from_describe(&describe);
    assert_eq!(caps.len(), ALL_OPS.len());
    for (op, _) in ALL_OPS {
        assert!(caps.supports(*op), "{op} must be advertised");
    }
}

#[test]
fn absent_ops_dictionary_yields_an_empty_set() {
    let describe = Message::from_value(Value::Dict(vec![(
        "versions".into(),
        Value::Dict(vec![]),
    )]))
    .expect("dictionary");
    let caps = CapabilitySet::from_describe(&describe);
    assert!(caps.is_empty());
    assert!(!caps.supports(Op::Eval));
}

#[test]
fn partial_describe_gates_the_rest() {
    let describe = Message::from_value(Value::Dict(vec![(
        "ops".into(),
        Value::Dict(vec![
            ("eval".into(), Value::Dict(vec![])),
            ("clone".into(), Value::Dict(vec![])),
            ("describe".into(), Value::Dict(vec![])),
        ]),
    )]))
    .expect("dictionary");
    let caps = CapabilitySet::from_describe(&describe);
    assert!(caps.supports(Op::Eval));
    assert!(!caps.supports(Op::Interrupt));
    assert!(!caps.supports(Op::Complete));
}
