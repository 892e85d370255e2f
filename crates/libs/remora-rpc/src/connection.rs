//! One framed msgpack connection: a reader task, a writer task, reply
//! correlation and standing routes keyed by `(command, token)`.
//!
//! Inbound messages are delivered in this order:
//!
//! 1. replies (`STS` present) complete the matching pending call;
//! 2. requests and events (no `STS`) go to the route registered for their
//!    command and token;
//! 3. anything left over is handed to the [`Inbound`] queue, which the server
//!    dispatcher consumes as commands.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use remora_wire::frame::{read_frame, write_frame};
use remora_wire::{Command, Message, Value, HANDSHAKE_OK, HANDSHAKE_UNSUPPORTED, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::correlation::{Correlator, Expect};
use crate::RpcError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RouteKey {
    command: Command,
    token: String,
}

impl RouteKey {
    fn new(command: Command, token: &str) -> Self {
        Self { command, token: token.to_ascii_lowercase() }
    }
}

#[derive(Default)]
struct RouteTable {
    next_id: u64,
    closed: bool,
    entries: HashMap<RouteKey, Vec<(u64, mpsc::UnboundedSender<Message>)>>,
}

struct Shared {
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Message>,
    correlator: Correlator,
    routes: Mutex<RouteTable>,
    cancel: CancellationToken,
}

impl Shared {
    fn routes(&self) -> std::sync::MutexGuard<'_, RouteTable> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, message: Message, unrouted: &mpsc::UnboundedSender<Message>) {
        let Some(message) = self.correlator.complete(message) else {
            return;
        };
        let Some(message) = self.route(message) else {
            return;
        };
        if unrouted.send(message).is_err() {
            log::trace!("connection: nobody consumes unrouted messages");
        }
    }

    fn route(&self, message: Message) -> Option<Message> {
        if message.status_raw().is_some() {
            return Some(message);
        }
        let (Some(command), Some(token)) = (message.command(), message.token()) else {
            return Some(message);
        };
        let key = RouteKey::new(command, token);
        let mut routes = self.routes();
        let Some(subscribers) = routes.entries.get_mut(&key) else {
            return Some(message);
        };
        subscribers.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        if subscribers.is_empty() {
            routes.entries.remove(&key);
        }
        None
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        self.correlator.fail_all();
        let mut routes = self.routes();
        routes.closed = true;
        routes.entries.clear();
    }
}

/// Messages no pending call or route claimed.
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Inbound {
    /// `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// A standing route for `(command, token)`. Dropping it removes the route.
pub struct Subscription {
    key: RouteKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Weak<Shared>,
}

impl Subscription {
    /// `None` once the connection closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut routes = shared.routes();
        if let Some(subscribers) = routes.entries.get_mut(&self.key) {
            subscribers.retain(|(id, _)| *id != self.id);
            if subscribers.is_empty() {
                routes.entries.remove(&self.key);
            }
        }
    }
}

struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.unregister(self.id);
    }
}

/// Cheap, cloneable handle to a live connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Starts the reader and writer tasks over `io`. The handshake must
    /// already have happened.
    pub fn spawn<S>(io: S, peer: Option<SocketAddr>, id_ceiling: u32) -> (Self, Inbound)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (unrouted_tx, unrouted_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            peer,
            outbound,
            correlator: Correlator::new(id_ceiling),
            routes: Mutex::new(RouteTable::default()),
            cancel: CancellationToken::new(),
        });
        let (mut reader, mut writer) = tokio::io::split(io);

        // Start receive task
        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shared.cancel.cancelled() => break,
                        frame = read_frame(&mut reader) => match frame {
                            Ok(Some(value)) => match Message::from_value(value) {
                                Ok(message) => shared.deliver(message, &unrouted_tx),
                                Err(err) => {
                                    log::warn!("connection: dropping peer: {err}");
                                    break;
                                }
                            },
                            Ok(None) => {
                                log::debug!("connection: peer {peer:?} closed the stream");
                                break;
                            }
                            Err(err) => {
                                log::warn!("connection: read error from {peer:?}: {err}");
                                break;
                            }
                        }
                    }
                }
                shared.shutdown();
            });
        }

        // Start transmit task
        {
            let cancel = shared.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = outbound_rx.recv() => {
                            let Some(message) = next else { break };
                            let frame = message.into_value();
                            if let Err(err) = write_frame(&mut writer, &frame).await {
                                log::warn!("connection: write error to {peer:?}: {err}");
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                }
                let _ = writer.shutdown().await;
            });
        }

        (Self { shared }, Inbound { rx: unrouted_rx })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Cancels both tasks and aborts every pending call.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// A token cancelled when this connection goes away.
    pub fn scope(&self) -> CancellationToken {
        self.shared.cancel.child_token()
    }

    /// Queues `message` for the writer without waiting.
    pub fn send(&self, message: Message) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::channel("connection closed"));
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| RpcError::channel("connection writer stopped"))
    }

    /// Sends `message` under a fresh id and waits for the reply `expect`
    /// describes.
    pub async fn request(
        &self,
        mut message: Message,
        expect: Expect,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message, RpcError> {
        let operation = describe(&message);
        let correlator = &self.shared.correlator;
        let (id, rx) = correlator.register(expect)?;
        let _guard = PendingGuard { correlator, id };
        message.set_id(id);
        self.send(message)?;

        let cancelled = async {
            match cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            reply = tokio::time::timeout(timeout, rx) => match reply {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => {
                    Err(RpcError::channel(format!("connection lost awaiting {operation}")))
                }
                Err(_) => Err(RpcError::Timeout { operation }),
            },
            _ = cancelled => Err(RpcError::Cancelled { operation }),
        }
    }

    /// Registers a standing route for `(command, token)`.
    pub fn subscribe(&self, command: Command, token: &str) -> Subscription {
        let key = RouteKey::new(command, token);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.shared.routes();
        let id = routes.next_id;
        routes.next_id += 1;
        // A closed table keeps no senders, so the receiver ends immediately.
        if !routes.closed {
            routes.entries.entry(key.clone()).or_default().push((id, tx));
        }
        Subscription { key, id, rx, shared: Arc::downgrade(&self.shared) }
    }

    /// Answers a message nothing claimed. Stream requests for unknown tokens
    /// get an error so their caller does not sit out its timeout.
    pub(crate) fn reject_unrouted(&self, message: Message) {
        match (message.command(), message.status_raw(), message.id()) {
            (Some(Command::Stream), None, Some(id)) => {
                let mut reply = Message::error("Unknown stream token")
                    .with_command(Command::Stream)
                    .with_id(id);
                if let Some(token) = message.token() {
                    reply.set_token(token);
                }
                let _ = self.send(reply);
            }
            (_, Some(_), _) => log::debug!("connection: discarding late reply {:?}", message.id()),
            _ => log::trace!("connection: discarding unrouted {:?}", message.command_raw()),
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.shared.correlator.outstanding()
    }
}

fn describe(message: &Message) -> String {
    match (message.command_raw(), message.method()) {
        (Some(command), Some(method)) => format!("{command} {method}"),
        (Some(command), None) => command.to_string(),
        _ => "request".to_string(),
    }
}

/// Client half of the version handshake.
pub async fn client_handshake<S>(io: &mut S, timeout: Duration) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        write_frame(io, &Value::F64(PROTOCOL_VERSION)).await?;
        read_frame(io).await
    };
    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| RpcError::Timeout { operation: "handshake".into() })?
        .map_err(|err| RpcError::channel(format!("handshake: {err}")))?;
    match reply {
        Some(Value::String(text))
            if text.as_str().is_some_and(|t| t.eq_ignore_ascii_case(HANDSHAKE_OK)) =>
        {
            Ok(())
        }
        Some(other) => Err(RpcError::protocol(format!("handshake rejected: {other}"))),
        None => Err(RpcError::channel("server closed during handshake")),
    }
}

/// Server half of the version handshake. On a version mismatch the rejection
/// is sent before the error is returned; the caller drops the stream.
pub async fn server_handshake<S>(io: &mut S, timeout: Duration) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = tokio::time::timeout(timeout, read_frame(io))
        .await
        .map_err(|_| RpcError::Timeout { operation: "handshake".into() })?
        .map_err(|err| RpcError::channel(format!("handshake: {err}")))?
        .ok_or_else(|| RpcError::channel("client closed during handshake"))?;

    let supported = remora_wire::is_supported_version(&first);
    let answer = if supported { HANDSHAKE_OK } else { HANDSHAKE_UNSUPPORTED };
    write_frame(io, &Value::from(answer))
        .await
        .map_err(|err| RpcError::channel(format!("handshake: {err}")))?;
    if supported {
        Ok(())
    } else {
        Err(RpcError::protocol(format!("unsupported protocol version {first}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_wire::Status;

    fn pair() -> ((Connection, Inbound), (Connection, Inbound)) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Connection::spawn(a, None, 125), Connection::spawn(b, None, 125))
    }

    #[tokio::test]
    async fn request_completes_with_the_matching_reply() {
        let ((client, _), (server, mut server_in)) = pair();
        let responder = tokio::spawn(async move {
            let request = server_in.recv().await.expect("request");
            let reply = Message::new()
                .with_id(request.id().expect("id"))
                .with_status(Status::Ok)
                .with_value("pong");
            server.send(reply).expect("send");
        });

        let reply = client
            .request(
                Message::for_command(Command::Open).with_location("/ping"),
                Expect::reply(),
                Duration::from_secs(5),
                None,
            )
            .await
            .expect("reply");
        assert_eq!(reply.value(), Some(&Value::from("pong")));
        responder.await.expect("responder");
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn timeout_unregisters_the_waiter() {
        let ((client, _), (_server, _server_in)) = pair();
        let err = client
            .request(
                Message::for_command(Command::Open),
                Expect::reply(),
                Duration::from_millis(20),
                None,
            )
            .await
            .expect_err("nobody answers");
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn cancellation_returns_immediately() {
        let ((client, _), (_server, _server_in)) = pair();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let open = Message::for_command(Command::Open);
        let err = client
            .request(open, Expect::reply(), Duration::from_secs(30), Some(&cancel))
            .await
            .expect_err("cancelled");
        assert!(matches!(err, RpcError::Cancelled { .. }));
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn peer_disconnect_fails_pending_calls_with_channel_fault() {
        let ((client, _), (server, _server_in)) = pair();
        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                let open = Message::for_command(Command::Open);
                client.request(open, Expect::reply(), Duration::from_secs(30), None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close();

        let err = pending.await.expect("join").expect_err("disconnect");
        assert!(matches!(err, RpcError::ChannelFault { .. }));
        client.closed().await;
        assert!(client.send(Message::new()).is_err());
    }

    #[tokio::test]
    async fn routes_fan_out_by_command_and_token() {
        let ((client, mut client_in), (server, _server_in)) = pair();
        let mut first = client.subscribe(Command::Event, "ABC");
        let mut second = client.subscribe(Command::Event, "abc");
        let mut other = client.subscribe(Command::Event, "xyz");

        server
            .send(Message::for_command(Command::Event).with_token("abc").with_method("Ticked"))
            .expect("send");
        let seen = first.recv().await.expect("first subscriber");
        assert_eq!(seen.method(), Some("Ticked"));
        assert!(second.recv().await.is_some());
        assert!(other.rx.try_recv().is_err());

        drop(first);
        drop(second);
        server
            .send(Message::for_command(Command::Event).with_token("abc").with_method("Again"))
            .expect("send");
        let leftover = client_in.recv().await.expect("unrouted");
        assert_eq!(leftover.method(), Some("Again"));
    }

    #[tokio::test]
    async fn handshake_accepts_version_one_and_rejects_others() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let server =
            tokio::spawn(async move { server_handshake(&mut b, Duration::from_secs(5)).await });
        client_handshake(&mut a, Duration::from_secs(5)).await.expect("client handshake");
        server.await.expect("join").expect("server handshake");

        let (mut a, mut b) = tokio::io::duplex(1024);
        let server =
            tokio::spawn(async move { server_handshake(&mut b, Duration::from_secs(5)).await });
        write_frame(&mut a, &Value::F64(2.0)).await.expect("write");
        let reply = read_frame(&mut a).await.expect("read");
        assert_eq!(reply, Some(Value::from(HANDSHAKE_UNSUPPORTED)));
        assert!(matches!(server.await.expect("join"), Err(RpcError::Protocol { .. })));
    }
}
