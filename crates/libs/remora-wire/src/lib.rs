//! Wire format for the remora remote-object protocol.
//!
//! Everything that crosses a connection is a msgpack value inside a
//! length-prefixed frame. After the version handshake every frame carries a
//! [`Message`]: a map keyed by short header names (`CMD`, `TK`, `ID`, ...).
//!
//! - [`message`]: header keys, commands, statuses and the envelope itself
//! - [`frame`]: 4-byte big-endian length prefix plus msgpack payload
//! - [`signature`]: the `Name(T1;T2) Ret` method signature grammar
//! - [`compress`]: the 8-byte length header used for stream payloads

pub mod compress;
pub mod error;
pub mod frame;
pub mod message;
pub mod signature;

pub use error::WireError;
pub use message::{header, Command, Message, Status};
pub use rmpv::Value;
pub use signature::{ParamType, Signature, TypeTag};

/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: f64 = 1.0;

/// Server reply accepting the client's handshake.
pub const HANDSHAKE_OK: &str = "OK";

/// Server reply rejecting the client's handshake; the server closes afterwards.
pub const HANDSHAKE_UNSUPPORTED: &str = "Unsupported version";

/// Returns `true` when a handshake frame announces a version we speak.
pub fn is_supported_version(value: &Value) -> bool {
    match value {
        Value::F64(v) => *v == PROTOCOL_VERSION,
        Value::F32(v) => f64::from(*v) == PROTOCOL_VERSION,
        Value::Integer(v) => v.as_u64() == Some(1),
        _ => false,
    }
}
