//! Bencode wire encoding for nREPL streams.
//!
//! nREPL frames every message as a bencode dictionary. This module is a
//! purely structural transcoder: it knows how to turn a [`Value`] tree into
//! bytes and how to incrementally parse a byte stream back into values, and
//! nothing about what the protocol layer puts inside them.
//!
//! Submodules:
//! - `value`: the [`Value`] model (byte strings, integers, lists,
//!   insertion-ordered dictionaries).
//! - `codec`: [`BencodeCodec`], a [`tokio_util::codec`] `Decoder`/`Encoder`
//!   pair whose decoder tolerates message boundaries falling anywhere inside
//!   a read chunk.

pub mod codec;
pub mod value;

pub use codec::{encode_to_vec, BencodeCodec, MAX_DEPTH, MAX_STRING_BYTES};
pub use value::Value;
