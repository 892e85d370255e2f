use std::io::SeekFrom;
use std::time::Duration;

use remora_wire::{compress, header, Message, Status, Value};

use super::{StreamOp, StreamProperty, MAX_READ_CHUNK};
use crate::connection::Connection;
use crate::correlation::Expect;
use crate::RpcError;

/// Handle to a byte stream living on the other side of the connection.
///
/// Every operation is one request and one reply. Dropping the handle sends a
/// fire-and-forget dispose to the provider.
pub struct RemoteStream {
    connection: Connection,
    token: String,
    timeout: Duration,
}

impl RemoteStream {
    pub(crate) fn new(connection: Connection, token: String, timeout: Duration) -> Self {
        Self { connection, token, timeout }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    async fn call(&self, op: StreamOp) -> Result<Message, RpcError> {
        let reply = self
            .connection
            .request(op.to_request(&self.token), Expect::stream(&self.token), self.timeout, None)
            .await?;
        match reply.status() {
            Some(Status::Ok) | Some(Status::Void) => Ok(reply),
            Some(Status::Error) => {
                let text =
                    reply.value().and_then(Value::as_str).unwrap_or("stream operation failed");
                Err(RpcError::from_remote(text, None, Some(&self.token)))
            }
            _ => Err(RpcError::UnsupportedStatus {
                status: reply.status_raw().unwrap_or_default().to_string(),
            }),
        }
    }

    async fn call_u64(&self, op: StreamOp) -> Result<u64, RpcError> {
        let reply = self.call(op).await?;
        reply
            .value()
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::protocol("stream reply lacks an integer value"))
    }

    async fn property_bool(&self, property: StreamProperty) -> Result<bool, RpcError> {
        let reply = self.call(StreamOp::GetProperty(property)).await?;
        reply
            .value()
            .and_then(Value::as_bool)
            .ok_or_else(|| RpcError::protocol(format!("{} is not a bool", property.as_str())))
    }

    /// Reads up to `buf.len()` bytes; `Ok(0)` means end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, RpcError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reply = self.call(StreamOp::Read(buf.len())).await?;
        let count = reply.value().and_then(Value::as_u64).unwrap_or(0) as usize;
        let data = match reply.remove(header::BUFFER) {
            Some(Value::Binary(wrapped)) => compress::unpack(&wrapped)?,
            Some(_) => return Err(RpcError::protocol("read buffer is not binary")),
            None => Vec::new(),
        };
        if data.len() != count || count > buf.len() {
            return Err(RpcError::protocol(format!(
                "read reply promised {count} bytes and carried {}",
                data.len()
            )));
        }
        buf[..count].copy_from_slice(&data);
        Ok(count)
    }

    /// Reads from the current position to the end of the stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>, RpcError> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let read = self.read(&mut chunk).await?;
            if read == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..read]);
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), RpcError> {
        for part in data.chunks(MAX_READ_CHUNK) {
            self.call(StreamOp::Write(compress::pack(part))).await?;
        }
        Ok(())
    }

    pub async fn seek(&self, pos: SeekFrom) -> Result<u64, RpcError> {
        self.call_u64(StreamOp::Seek(pos)).await
    }

    pub async fn flush(&self) -> Result<(), RpcError> {
        self.call(StreamOp::Flush).await.map(|_| ())
    }

    pub async fn set_len(&self, len: u64) -> Result<(), RpcError> {
        self.call(StreamOp::SetLength(len)).await.map(|_| ())
    }

    pub async fn len(&self) -> Result<u64, RpcError> {
        self.call_u64(StreamOp::GetProperty(StreamProperty::Length)).await
    }

    pub async fn is_empty(&self) -> Result<bool, RpcError> {
        Ok(self.len().await? == 0)
    }

    pub async fn position(&self) -> Result<u64, RpcError> {
        self.call_u64(StreamOp::GetProperty(StreamProperty::Position)).await
    }

    pub async fn set_position(&self, position: u64) -> Result<(), RpcError> {
        self.call(StreamOp::SetProperty(StreamProperty::Position, Value::from(position)))
            .await
            .map(|_| ())
    }

    pub async fn can_read(&self) -> Result<bool, RpcError> {
        self.property_bool(StreamProperty::CanRead).await
    }

    pub async fn can_write(&self) -> Result<bool, RpcError> {
        self.property_bool(StreamProperty::CanWrite).await
    }

    pub async fn can_seek(&self) -> Result<bool, RpcError> {
        self.property_bool(StreamProperty::CanSeek).await
    }

    /// Releases the remote stream without waiting for the peer.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        if self.connection.send(StreamOp::Dispose.to_request(&self.token)).is_err() {
            log::trace!("stream_consumer: {} outlived its connection", self.token);
        }
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream").field("token", &self.token).finish()
    }
}
