//! Remote streams: a byte stream owned by one peer, driven by the other.
//!
//! The owner runs a [`provider`] that answers `CMD=STRM` requests tagged with
//! the stream's token; the other side holds a [`RemoteStream`] consumer that
//! turns each operation into one request/reply pair on the same connection.

mod byte_stream;
mod consumer;
pub(crate) mod provider;

use std::io::SeekFrom;

use remora_wire::{header, Command, Message, Value};

pub use byte_stream::{ByteStream, FileStream};
pub use consumer::RemoteStream;

use crate::RpcError;

pub(crate) const FLUSH: &str = "FLUSH";
pub(crate) const SEEK: &str = "SEEK";
pub(crate) const SET_LENGTH: &str = "SETLENGTH";
pub(crate) const READ: &str = "READ";
pub(crate) const WRITE: &str = "WRITE";
pub(crate) const DISPOSE: &str = "DISPOSE";
pub(crate) const GET_PROPERTY: &str = "GET_PROPERTY";
pub(crate) const SET_PROPERTY: &str = "SET_PROPERTY";

/// Largest read a provider serves in one reply.
pub(crate) const MAX_READ_CHUNK: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamProperty {
    CanRead,
    CanSeek,
    CanWrite,
    Length,
    Position,
}

impl StreamProperty {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::CanRead => "CanRead",
            Self::CanSeek => "CanSeek",
            Self::CanWrite => "CanWrite",
            Self::Length => "Length",
            Self::Position => "Position",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        [Self::CanRead, Self::CanSeek, Self::CanWrite, Self::Length, Self::Position]
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(raw))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StreamOp {
    Flush,
    Seek(SeekFrom),
    SetLength(u64),
    Read(usize),
    /// Payload still in its compression wrapper.
    Write(Vec<u8>),
    Dispose,
    GetProperty(StreamProperty),
    SetProperty(StreamProperty, Value),
}

impl StreamOp {
    fn method(&self) -> &'static str {
        match self {
            Self::Flush => FLUSH,
            Self::Seek(_) => SEEK,
            Self::SetLength(_) => SET_LENGTH,
            Self::Read(_) => READ,
            Self::Write(_) => WRITE,
            Self::Dispose => DISPOSE,
            Self::GetProperty(_) => GET_PROPERTY,
            Self::SetProperty(..) => SET_PROPERTY,
        }
    }

    /// Request envelope without an id; the caller decides whether one is
    /// needed.
    pub(crate) fn to_request(&self, token: &str) -> Message {
        let args = match self {
            Self::Flush | Self::Dispose => vec![],
            Self::Seek(pos) => {
                let (offset, origin) = match *pos {
                    SeekFrom::Start(offset) => (Value::from(offset), 0),
                    SeekFrom::Current(offset) => (Value::from(offset), 1),
                    SeekFrom::End(offset) => (Value::from(offset), 2),
                };
                vec![offset, Value::from(origin)]
            }
            Self::SetLength(len) => vec![Value::from(*len)],
            Self::Read(count) => vec![Value::from(*count as u64)],
            Self::Write(wrapped) => vec![Value::Binary(wrapped.clone())],
            Self::GetProperty(property) => vec![Value::from(property.as_str())],
            Self::SetProperty(property, value) => {
                vec![Value::from(property.as_str()), value.clone()]
            }
        };
        Message::for_command(Command::Stream)
            .with_token(token)
            .with_method(self.method())
            .with_args(args)
    }

    pub(crate) fn from_request(request: &Message) -> Result<Self, RpcError> {
        let method = request
            .method()
            .ok_or_else(|| RpcError::protocol(format!("Parameter missing: {}", header::METHOD)))?;
        let args = request.args().unwrap_or(&[]);
        let arg = |index: usize| {
            args.get(index)
                .ok_or_else(|| RpcError::protocol(format!("{method} expects argument {index}")))
        };
        let int = |index: usize| {
            arg(index)?
                .as_i64()
                .ok_or_else(|| {
                    RpcError::protocol(format!("{method} argument {index} is not an integer"))
                })
        };
        let unsigned = |index: usize| {
            arg(index)?
                .as_u64()
                .ok_or_else(|| {
                    RpcError::protocol(format!("{method} argument {index} is not a length"))
                })
        };
        let property = |index: usize| {
            let raw = arg(index)?
                .as_str()
                .ok_or_else(|| RpcError::protocol("property name is not a string"))?;
            StreamProperty::parse(raw)
                .ok_or_else(|| RpcError::protocol(format!("Unknown stream property {raw}")))
        };

        let op = match method.to_ascii_uppercase().as_str() {
            FLUSH => Self::Flush,
            SEEK => {
                let offset = int(0)?;
                let pos = match int(1)? {
                    0 => SeekFrom::Start(
                        u64::try_from(offset)
                            .map_err(|_| RpcError::protocol("negative absolute seek"))?,
                    ),
                    1 => SeekFrom::Current(offset),
                    2 => SeekFrom::End(offset),
                    other => return Err(RpcError::protocol(format!("Unknown seek origin {other}"))),
                };
                Self::Seek(pos)
            }
            SET_LENGTH => Self::SetLength(unsigned(0)?),
            READ => Self::Read(usize::try_from(unsigned(0)?).unwrap_or(usize::MAX)),
            WRITE => match arg(0)? {
                Value::Binary(bytes) => Self::Write(bytes.clone()),
                _ => return Err(RpcError::protocol("WRITE payload is not binary")),
            },
            DISPOSE => Self::Dispose,
            GET_PROPERTY => Self::GetProperty(property(0)?),
            SET_PROPERTY => Self::SetProperty(property(0)?, arg(1)?.clone()),
            _ => return Err(RpcError::protocol(format!("Unknown stream method {method}"))),
        };
        Ok(op)
    }
}
