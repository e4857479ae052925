//! `warpproto`: the shared vocabulary of the warpnet fleet.
//!
//! Three things live here:
//! - the keyspace every backend uses in the coordination store ([`keys`]),
//! - the JSON records those keys hold ([`records`]),
//! - the binary backend<->gateway protocol ([`gateway`]), carried inside a
//!   `u32` big-endian length-prefixed frame.
//!
//! The gateway decoder is "zero-copy" on parse: it returns `bytes::Bytes`
//! slices referencing the original frame payload.

pub mod frame;
pub mod gateway;
pub mod keys;
pub mod player;
pub mod records;

pub use keys::Keys;
pub use player::PlayerId;

#[derive(Debug, Clone)]
pub enum ProtoError {
    TooShort { need: usize, got: usize },
    UnknownType(u8),
    Malformed(&'static str),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::TooShort { need, got } => {
                write!(f, "message too short: need {need}, got {got}")
            }
            ProtoError::UnknownType(t) => write!(f, "unknown message type: 0x{t:02x}"),
            ProtoError::Malformed(s) => write!(f, "malformed message: {s}"),
        }
    }
}

impl std::error::Error for ProtoError {}
