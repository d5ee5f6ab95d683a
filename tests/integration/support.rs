//! In-process scripted nREPL server for integration tests.
//!
//! Listens on an ephemeral local port, accepts one connection, and answers
//! each request with a canned message sequence keyed by op (and, for
//! `eval`, by the submitted code). Every inbound request is recorded so
//! tests can assert on exactly what reached the wire — in particular that
//! capability-gated calls sent nothing.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use repl_intercom::bencode::{BencodeCodec, Value};
use repl_intercom::ConnectConfig;

/// Ops advertised by default: the full vocabulary the client knows.
pub const DEFAULT_OPS: &[&str] = &[
    "eval",
    "clone",
    "describe",
    "close",
    "interrupt",
    "stdin",
    "load-file",
    "complete",
    "info",
    "classpath",
    "test-var-query",
    "test-stacktrace",
    "retest",
    "ns-load-all",
    "ns-list",
    "ns-path",
    "refresh",
    "refresh-all",
    "format-code",
    "init-debugger",
    "debug-input",
    "debug-instrumented-defs",
    "ls-sessions",
    "out-subscribe",
    "stacktrace",
    "clojuredocs-refresh-cache",
    "clojuredocs-lookup",
];

/// Server behavior knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Op names listed in the `describe` response.
    pub ops: Vec<String>,
    /// Ops answered with an `unknown-op` status despite being advertised,
    /// simulating a stale capability set.
    pub unknown_ops: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ops: DEFAULT_OPS.iter().map(|s| (*s).to_owned()).collect(),
            unknown_ops: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Advertise only the given ops.
    pub fn advertising(ops: &[&str]) -> Self {
        Self {
            ops: ops.iter().map(|s| (*s).to_owned()).collect(),
            unknown_ops: Vec::new(),
        }
    }
}

/// Handle to a running fake server.
pub struct FakeServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeServer {
    /// Spawn with the full default op vocabulary.
    pub async fn spawn() -> Self {
        Self::spawn_with(ServerConfig::default()).await
    }

    /// Spawn with explicit behavior.
    pub async fn spawn_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                serve(stream, config, recorded).await;
            }
        });

        Self { addr, requests }
    }

    /// Client config pointing at this server.
    pub fn client_config(&self) -> ConnectConfig {
        let mut config = ConnectConfig::new("127.0.0.1", self.addr.port());
        config.connect_timeout_seconds = 5;
        config.handshake_timeout_seconds = 5;
        config
    }

    /// Every op name received so far, in arrival order.
    pub fn recorded_ops(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter_map(|v| v.get("op").and_then(Value::as_str).map(str::to_owned))
            .collect()
    }

    /// Every recorded request for the given op.
    pub fn requests_for(&self, op: &str) -> Vec<Value> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|v| v.get("op").and_then(Value::as_str) == Some(op))
            .cloned()
            .collect()
    }
}

/// Await `fut` with a hard test timeout.
pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test step timed out")
}

/// Poll `condition` until it holds, failing after the test timeout. Used
/// for effects that race the assertion, e.g. fire-and-forget sends.
pub async fn eventually(condition: impl Fn() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

// ── Message construction helpers ──────────────────────────────────────────────

pub fn s(text: &str) -> Value {
    Value::Str(text.to_owned())
}

pub fn dict(entries: &[(&str, Value)]) -> Value {
    Value::Dict(
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect(),
    )
}

pub fn status(tags: &[&str]) -> Value {
    Value::List(tags.iter().map(|t| s(t)).collect())
}

fn field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

// ── Server loop ───────────────────────────────────────────────────────────────

async fn serve(stream: TcpStream, config: ServerConfig, requests: Arc<Mutex<Vec<Value>>>) {
    let mut framed = Framed::new(stream, BencodeCodec::new());
    let mut session_counter = 0_u32;
    // Evals of "slow" park here until an interrupt targets them.
    let mut parked: Vec<(String, String)> = Vec::new();

    while let Some(Ok(value)) = framed.next().await {
        requests.lock().expect("requests lock").push(value.clone());

        let Some(op) = field(&value, "op") else { continue };
        let id = field(&value, "id").unwrap_or_default();
        let session = field(&value, "session");

        let replies = script(
            &op,
            &id,
            session.as_deref(),
            &value,
            &config,
            &mut session_counter,
            &mut parked,
        );
        for reply in replies {
            if framed.send(reply).await.is_err() {
                return;
            }
        }
    }
}

#[allow(clippy::too_many_lines)]
fn script(
    op: &str,
    id: &str,
    session: Option<&str>,
    request: &Value,
    config: &ServerConfig,
    session_counter: &mut u32,
    parked: &mut Vec<(String, String)>,
) -> Vec<Value> {
    let sess = session.unwrap_or("no-session");

    if config.unknown_ops.iter().any(|o| o == op) {
        return vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("status", status(&["unknown-op", "done"])),
        ])];
    }

    match op {
        // Bootstrap namespace probe: an eval without a session.
        "eval" if session.is_none() => vec![dict(&[
            ("id", s(id)),
            ("ns", s("user")),
            ("value", s("\"user\"")),
            ("status", status(&["done"])),
        ])],

        "clone" => {
            *session_counter += 1;
            vec![dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("new-session", s(&format!("sess-{session_counter}"))),
                ("status", status(&["done"])),
            ])]
        }

        "describe" => {
            let ops: Vec<(String, Value)> = config
                .ops
                .iter()
                .map(|name| (name.clone(), Value::Dict(vec![])))
                .collect();
            vec![dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("ops", Value::Dict(ops)),
                ("status", status(&["done"])),
            ])]
        }

        "eval" => script_eval(id, sess, request, parked),

        "load-file" => vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("value", s("#'user/loaded")),
            ("ns", s("user")),
            ("status", status(&["done"])),
        ])],

        "interrupt" => {
            let target = field(request, "interrupt-id").unwrap_or_default();
            let mut replies = vec![dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("status", status(&["done"])),
            ])];
            if let Some(pos) = parked.iter().position(|(eid, _)| *eid == target) {
                let (eval_id, eval_sess) = parked.remove(pos);
                // Late terminal for the interrupted evaluation.
                replies.push(dict(&[
                    ("id", s(&eval_id)),
                    ("session", s(&eval_sess)),
                    ("status", status(&["done", "interrupted"])),
                ]));
            }
            replies
        }

        "stacktrace" => vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            (
                "stacktrace",
                Value::List(vec![dict(&[
                    ("class", s("clojure.lang.ExceptionInfo")),
                    ("method", s("invokeStatic")),
                    ("line", Value::Int(12)),
                ])]),
            ),
            ("status", status(&["done"])),
        ])],

        "refresh" | "refresh-all" => vec![
            dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                (
                    "reloading",
                    Value::List(vec![s("app.core"), s("app.util")]),
                ),
            ]),
            dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("status", status(&["ok"])),
            ]),
            dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("status", status(&["done"])),
            ]),
        ],

        // Unsolicited traffic ahead of the subscription ack: exercises the
        // default handler's flavor tracking and running-id bookkeeping.
        "out-subscribe" => vec![
            dict(&[
                ("id", s("999")),
                ("session", s(sess)),
                ("repl-type", s("clj")),
                ("out", s("noise\n")),
            ]),
            dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("status", status(&["done"])),
            ]),
        ],

        "complete" => vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            (
                "completions",
                Value::List(vec![
                    dict(&[("candidate", s("map")), ("type", s("function"))]),
                    dict(&[("candidate", s("mapv")), ("type", s("function"))]),
                ]),
            ),
            ("status", status(&["done"])),
        ])],

        "classpath" => vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("classpath", Value::List(vec![s("src"), s("test")])),
            ("status", status(&["done"])),
        ])],

        "ls-sessions" => vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("sessions", Value::List(vec![s(sess)])),
            ("status", status(&["done"])),
        ])],

        "close" => vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("status", status(&["done", "session-closed"])),
        ])],

        // Everything else acknowledges with a bare terminal.
        _ => vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("status", status(&["done"])),
        ])],
    }
}

fn script_eval(
    id: &str,
    sess: &str,
    request: &Value,
    parked: &mut Vec<(String, String)>,
) -> Vec<Value> {
    let code = field(request, "code").unwrap_or_default();

    if code == "(+ 1 2)" {
        return vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("ns", s("user")),
            ("value", s("3")),
            ("status", status(&["done"])),
        ])];
    }

    if code.contains("println") {
        return vec![
            dict(&[("id", s(id)), ("session", s(sess)), ("out", s("hi\n"))]),
            dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("ns", s("user")),
                ("value", s("nil")),
                ("status", status(&["done"])),
            ]),
        ];
    }

    if code == "boom" {
        return vec![
            dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("err", s("Execution error at user/eval1\n")),
            ]),
            dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("ex", s("clojure.lang.ExceptionInfo: boom")),
                ("status", status(&["eval-error"])),
            ]),
            dict(&[
                ("id", s(id)),
                ("session", s(sess)),
                ("status", status(&["done"])),
            ]),
        ];
    }

    if code == "slow" {
        parked.push((id.to_owned(), sess.to_owned()));
        // First fragment only; the terminal arrives via interrupt handling.
        return vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("out", s("working\n")),
        ])];
    }

    if code.starts_with("(in-ns") {
        return vec![dict(&[
            ("id", s(id)),
            ("session", s(sess)),
            ("ns", s("app.core")),
            ("value", s("#namespace[app.core]")),
            ("status", status(&["done"])),
        ])];
    }

    vec![dict(&[
        ("id", s(id)),
        ("session", s(sess)),
        ("ns", s("user")),
        ("value", s("nil")),
        ("status", status(&["done"])),
    ])]
}
