use std::sync::{Arc, Mutex};

use remora_wire::{compress, header, Command, Message, Status, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ByteStream, StreamOp, StreamProperty, MAX_READ_CHUNK};
use crate::connection::Connection;
use crate::RpcError;

type SharedStream = Arc<Mutex<Box<dyn ByteStream>>>;

struct Outcome {
    status: Status,
    value: Option<Value>,
    buffer: Option<Vec<u8>>,
}

impl Outcome {
    fn void() -> Self {
        Self { status: Status::Void, value: None, buffer: None }
    }

    fn value(value: impl Into<Value>) -> Self {
        Self { status: Status::Ok, value: Some(value.into()), buffer: None }
    }
}

/// Serves `stream` under a fresh token until it is disposed, `scope` is
/// cancelled, or it can neither read nor write. Returns the token.
pub(crate) fn spawn(
    connection: Connection,
    stream: Box<dyn ByteStream>,
    writable: bool,
    scope: CancellationToken,
) -> String {
    let token = Uuid::new_v4().to_string();
    let mut requests = connection.subscribe(Command::Stream, &token);
    let stream: SharedStream = Arc::new(Mutex::new(stream));

    {
        let token = token.clone();
        tokio::spawn(async move {
            log::debug!("stream_provider: serving {token} (writable={writable})");
            loop {
                let request = tokio::select! {
                    _ = scope.cancelled() => break,
                    next = requests.recv() => match next {
                        Some(request) => request,
                        None => break,
                    },
                };
                let id = request.id();
                let op = StreamOp::from_request(&request);
                let disposing = matches!(op, Ok(StreamOp::Dispose));

                let result = match op {
                    Ok(StreamOp::Dispose) => Ok((Outcome::void(), false)),
                    Ok(op) => execute(Arc::clone(&stream), op, writable).await,
                    Err(err) => Err(err),
                };
                let unusable = matches!(result, Ok((_, true)));

                if let Some(id) = id {
                    let reply = match result {
                        Ok((outcome, _)) => success_reply(&token, id, outcome),
                        Err(err) => Message::error(err.to_wire())
                            .with_command(Command::Stream)
                            .with_token(&token)
                            .with_id(id),
                    };
                    if connection.send(reply).is_err() {
                        break;
                    }
                } else if let Err(err) = result {
                    log::debug!("stream_provider: {token} fire-and-forget request failed: {err}");
                }

                if disposing {
                    log::debug!("stream_provider: {token} disposed by peer");
                    break;
                }
                if unusable {
                    log::debug!("stream_provider: {token} can no longer read or write");
                    break;
                }
            }
            drop(requests);
            let _ = tokio::task::spawn_blocking(move || {
                lock(&stream).close();
            })
            .await;
        });
    }

    token
}

fn lock(stream: &SharedStream) -> std::sync::MutexGuard<'_, Box<dyn ByteStream>> {
    stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn success_reply(token: &str, id: u32, outcome: Outcome) -> Message {
    let mut reply = Message::for_command(Command::Stream)
        .with_token(token)
        .with_id(id)
        .with_status(outcome.status);
    if let Some(value) = outcome.value {
        reply.set(header::VALUE, value);
    }
    if let Some(buffer) = outcome.buffer {
        reply.set(header::BUFFER, Value::Binary(buffer));
    }
    reply
}

/// Runs `op` on the blocking pool. The flag reports whether the stream has
/// become unusable for both reading and writing.
async fn execute(
    stream: SharedStream,
    op: StreamOp,
    writable: bool,
) -> Result<(Outcome, bool), RpcError> {
    tokio::task::spawn_blocking(move || {
        let mut stream = lock(&stream);
        let outcome = apply(&mut **stream, op, writable);
        let unusable = !stream.can_read() && !stream.can_write();
        outcome.map(|outcome| (outcome, unusable))
    })
    .await
    .map_err(|err| RpcError::fault("Panic", format!("stream operation panicked: {err}")))?
}

fn apply(stream: &mut dyn ByteStream, op: StreamOp, writable: bool) -> Result<Outcome, RpcError> {
    let io_fault = |err: std::io::Error| RpcError::fault("Io", err.to_string());
    let unsupported = |action: &str| {
        RpcError::fault("NotSupported", format!("{action} is not supported for this stream"))
    };
    match op {
        StreamOp::Flush => {
            stream.flush().map_err(io_fault)?;
            Ok(Outcome::void())
        }
        StreamOp::Seek(pos) => {
            if !stream.can_seek() {
                return Err(unsupported("Seeking"));
            }
            Ok(Outcome::value(stream.seek(pos).map_err(io_fault)?))
        }
        StreamOp::SetLength(len) => {
            if !writable || !stream.can_write() {
                return Err(unsupported("Writing"));
            }
            stream.set_len(len).map_err(io_fault)?;
            Ok(Outcome::void())
        }
        StreamOp::Read(count) => {
            if !stream.can_read() {
                return Err(unsupported("Reading"));
            }
            let mut buf = vec![0u8; count.min(MAX_READ_CHUNK)];
            let read = stream.read(&mut buf).map_err(io_fault)?;
            buf.truncate(read);
            Ok(Outcome {
                status: Status::Ok,
                value: Some(Value::from(read as u64)),
                buffer: Some(compress::pack(&buf)),
            })
        }
        StreamOp::Write(wrapped) => {
            if !writable || !stream.can_write() {
                return Err(unsupported("Writing"));
            }
            let data = compress::unpack(&wrapped)?;
            stream.write(&data).map_err(io_fault)?;
            Ok(Outcome::void())
        }
        StreamOp::GetProperty(property) => Ok(match property {
            StreamProperty::CanRead => Outcome::value(stream.can_read()),
            StreamProperty::CanSeek => Outcome::value(stream.can_seek()),
            StreamProperty::CanWrite => Outcome::value(writable && stream.can_write()),
            StreamProperty::Length => Outcome::value(stream.len().map_err(io_fault)?),
            StreamProperty::Position => Outcome::value(stream.position().map_err(io_fault)?),
        }),
        StreamOp::SetProperty(StreamProperty::Position, value) => {
            let position = value
                .as_u64()
                .ok_or_else(|| RpcError::protocol("Position must be a non-negative integer"))?;
            stream.seek(std::io::SeekFrom::Start(position)).map_err(io_fault)?;
            Ok(Outcome::void())
        }
        StreamOp::SetProperty(property, _) => {
            let message = format!("Property {} is read-only", property.as_str());
            Err(RpcError::fault("NotSupported", message))
        }
        StreamOp::Dispose => Ok(Outcome::void()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::FileStream;
    use std::io::Cursor;

    const WRITE_REFUSED: &str =
        "remote fault (NotSupported): Writing is not supported for this stream";

    #[test]
    fn read_only_providers_reject_writes() {
        let mut stream = Cursor::new(vec![1u8, 2, 3]);
        let err = apply(&mut stream, StreamOp::Write(compress::pack(b"x")), false)
            .err()
            .expect("read-only");
        assert_eq!(err.to_string(), WRITE_REFUSED);

        let can_write = apply(&mut stream, StreamOp::GetProperty(StreamProperty::CanWrite), false)
            .expect("property");
        assert_eq!(can_write.value, Some(Value::Boolean(false)));
    }

    #[test]
    fn read_only_files_reject_writes_even_on_writable_operations() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), b"data").expect("seed");
        let mut stream = FileStream::open(file.path()).expect("open");

        let err = apply(&mut stream, StreamOp::Write(compress::pack(b"x")), true)
            .err()
            .expect("read-only file");
        assert_eq!(err.to_string(), WRITE_REFUSED);
        assert!(apply(&mut stream, StreamOp::SetLength(0), true).is_err());

        let can_write = apply(&mut stream, StreamOp::GetProperty(StreamProperty::CanWrite), true)
            .expect("property");
        assert_eq!(can_write.value, Some(Value::Boolean(false)));
        assert_eq!(std::fs::read(file.path()).expect("read back"), b"data");
    }

    #[test]
    fn empty_reads_still_carry_a_count() {
        let mut stream = Cursor::new(Vec::new());
        let outcome = apply(&mut stream, StreamOp::Read(16), true).expect("read");
        assert_eq!(outcome.value, Some(Value::from(0u64)));
        let buffer = compress::unpack(&outcome.buffer.expect("buffer")).expect("unpack");
        assert_eq!(buffer, Vec::<u8>::new());
    }

    #[test]
    fn only_position_is_settable() {
        let mut stream = Cursor::new(vec![0u8; 10]);
        apply(&mut stream, StreamOp::SetProperty(StreamProperty::Position, Value::from(4)), true)
            .expect("position");
        assert_eq!(ByteStream::position(&mut stream).expect("pos"), 4);
        let length = StreamOp::SetProperty(StreamProperty::Length, Value::from(1));
        assert!(apply(&mut stream, length, true).is_err());
    }
}
