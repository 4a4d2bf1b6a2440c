//! Protocol definitions and constants
//!
//! A message is an ordered map of named, typed fields. Every message carries
//! an `identifier` (the logical connection, 0 for tunnel-scoped commands) and
//! a `command`. See [`codec`] for the byte layout.

pub mod codec;
mod message;
mod value;

pub use message::{
    keys, CloseDirection, Command, Datagram, FlowKind, Message, OpenRequest, OpenResult, Packet,
    PacketProtocol,
};
pub use value::{Map, Value};

use thiserror::Error;

/// Protocol errors
///
/// Every variant is a `MalformedMessage` in the tunnel's error taxonomy: the
/// stream position can no longer be trusted, so the tunnel is torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Invalid frame length: {0}")]
    InvalidLength(usize),

    #[error("Unknown command: {0}")]
    UnknownCommand(i64),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} has wrong type, expected {expected}")]
    UnexpectedType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame size, length prefix included (128 KB)
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// Connection identifier reserved for tunnel-scoped commands
pub const TUNNEL_CONNECTION_ID: u32 = 0;
