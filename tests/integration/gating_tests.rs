//! Integration tests for capability gating and the unknown-op double-check.

use pretty_assertions::assert_eq;

use repl_intercom::{Connection, Error, EvalOptions, Hooks, Op};

use super::support::{within, FakeServer, ServerConfig};

#[tokio::test]
async fn unadvertised_op_is_never_sent_and_resolves_empty() {
    let server = FakeServer::spawn_with(ServerConfig::advertising(&[
        "eval", "clone", "describe", "close",
    ]))
    .await;
    let (connection, session) =
        within(Connection::connect(&server.client_config(), Hooks::default()))
            .await
            .expect("connect");

    assert!(!connection.supports(Op::Complete));

    let result = within(session.complete(Some("user"), "ma"))
        .await
        .expect("gated call must not fail");
    assert_eq!(result, None);

    // Nothing reached the wire for the gated op.
    assert!(server.requests_for("complete").is_empty());
}

#[tokio::test]
async fn unsupported_interrupt_rejects_instead_of_resolving() {
    let server = FakeServer::spawn_with(ServerConfig::advertising(&[
        "eval", "clone", "describe",
    ]))
    .await;
    let (_connection, session) =
        within(Connection::connect(&server.client_config(), Hooks::default()))
            .await
            .expect("connect");

    let err = within(session.interrupt("17")).await.expect_err("reject");
    assert_eq!(err, Error::UnsupportedOp("interrupt".into()));
    assert!(server.requests_for("interrupt").is_empty());
}

#[tokio::test]
async fn unadvertised_eval_resolves_empty_without_sending() {
    let server = FakeServer::spawn_with(ServerConfig::advertising(&[
        "clone", "describe",
    ]))
    .await;
    let (_connection, session) =
        within(Connection::connect(&server.client_config(), Hooks::default()))
            .await
            .expect("connect");

    let eval = within(session.eval("(+ 1 2)", EvalOptions::default()))
        .await
        .expect("gated eval must not fail");
    assert_eq!(within(eval.wait()).await.expect("empty value"), "");

    // Only the bootstrap probe reached the wire.
    assert_eq!(server.requests_for("eval").len(), 1);
}

#[tokio::test]
async fn stale_capability_set_still_rejects_on_unknown_op() {
    // The server advertises classpath but answers it with unknown-op, as a
    // dynamically unloaded middleware would.
    let mut config = ServerConfig::default();
    config.unknown_ops.push("classpath".into());
    let server = FakeServer::spawn_with(config).await;
    let (connection, session) =
        within(Connection::connect(&server.client_config(), Hooks::default()))
            .await
            .expect("connect");

    assert!(connection.supports(Op::Classpath));
    let err = within(session.classpath()).await.expect_err("reject");
    assert_eq!(err, Error::UnknownOp("classpath".into()));
}
