//! Unit tests for connection configuration parsing and validation.

use pretty_assertions::assert_eq;

use repl_intercom::{ConnectConfig, Error};

#[test]
fn minimal_toml_gets_defaults() {
    let config = ConnectConfig::from_toml_str("port = 7888\n").expect("parse");
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 7888);
    assert_eq!(config.connect_timeout_seconds, 10);
    assert_eq!(config.handshake_timeout_seconds, 30);
}

#[test]
fn explicit_fields_override_defaults() {
    let raw = "host = \"repl.internal\"\nport = 45001\nconnect_timeout_seconds = 3\nhandshake_timeout_seconds = 5\n";
    let config = ConnectConfig::from_toml_str(raw).expect("parse");
    assert_eq!(config.host, "repl.internal");
    assert_eq!(config.connect_timeout().as_secs(), 3);
    assert_eq!(config.handshake_timeout().as_secs(), 5);
}

#[test]
fn zero_port_is_rejected() {
    let err = ConnectConfig::from_toml_str("port = 0\n").expect_err("must fail");
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn blank_host_is_rejected() {
    let err = ConnectConfig::from_toml_str("host = \" \"\nport = 7888\n").expect_err("must fail");
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn invalid_toml_is_a_config_error() {
    let err = ConnectConfig::from_toml_str("port = \"not a number\"").expect_err("must fail");
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn builder_matches_parsed_defaults() {
    let built = ConnectConfig::new("127.0.0.1", 7888);
    let parsed = ConnectConfig::from_toml_str("port = 7888\n").expect("parse");
    assert_eq!(built, parsed);
}
