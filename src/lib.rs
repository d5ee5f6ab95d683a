#![forbid(unsafe_code)]

//! Async nREPL client.
//!
//! One [`Connection`] owns one TCP transport, speaks bencode over it, and
//! multiplexes any number of [`Session`]s — each a logical conversation
//! identified by a server-assigned id, carrying capability-gated operations
//! and streaming [`eval::Evaluation`]s.

pub mod bencode;
pub mod collab;
pub mod config;
pub mod connection;
pub mod errors;
pub mod eval;
pub mod message;
pub mod ops;
pub mod session;

pub use collab::Hooks;
pub use config::ConnectConfig;
pub use connection::Connection;
pub use errors::{Error, Result};
pub use eval::{EvalOptions, Evaluation};
pub use ops::Op;
pub use session::Session;
