use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remora_wire::{header, Command, Message, Status, TypeTag, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::ClientOptions;
use crate::connection::{Connection, Subscription};
use crate::contract::{Contract, Operation};
use crate::correlation::Expect;
use crate::stream::{provider, ByteStream, RemoteStream};
use crate::RpcError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// One event delivered to a handler.
#[derive(Clone, Debug)]
pub struct EventArgs {
    name: String,
    value: Value,
}

impl EventArgs {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        codec::decode(self.value.clone())
    }
}

type EventHandler = Arc<dyn Fn(&Proxy, &EventArgs) + Send + Sync>;

/// One argument of an outgoing call.
pub enum CallArg {
    Value(Value),
    /// Served from this side for as long as the callee uses it.
    Stream(Box<dyn ByteStream>),
    Missing,
}

impl CallArg {
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self, RpcError> {
        codec::encode(value).map(Self::Value)
    }

    pub fn stream(stream: impl ByteStream + 'static) -> Self {
        Self::Stream(Box::new(stream))
    }
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// What a call produced.
#[derive(Debug)]
pub enum Returned {
    Void,
    Value(Value),
    Service(Proxy),
    Stream(RemoteStream),
}

#[derive(Debug)]
pub struct Invocation {
    pub returned: Returned,
    /// Written-back values, one per parameter; nil at by-value positions.
    pub ref_args: Vec<Value>,
    /// Server-side execution time.
    pub elapsed: Option<Duration>,
}

impl Invocation {
    /// Decodes the returned value. A void return decodes as nil.
    pub fn value<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        match self.returned {
            Returned::Value(value) => codec::decode(value),
            Returned::Void => codec::decode(Value::Nil),
            other => Err(RpcError::codec(format!("call returned {other:?}, not a value"))),
        }
    }

    pub fn into_service(self) -> Result<Proxy, RpcError> {
        match self.returned {
            Returned::Service(proxy) => Ok(proxy),
            other => Err(RpcError::codec(format!("call returned {other:?}, not a service"))),
        }
    }

    pub fn into_stream(self) -> Result<RemoteStream, RpcError> {
        match self.returned {
            Returned::Stream(stream) => Ok(stream),
            other => Err(RpcError::codec(format!("call returned {other:?}, not a stream"))),
        }
    }

    pub fn ref_arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self
            .ref_args
            .get(index)
            .cloned()
            .ok_or_else(|| RpcError::codec(format!("no written-back argument at {index}")))?;
        codec::decode(value)
    }
}

struct Core {
    state: ProxyState,
    token: Option<String>,
    next_handler: u64,
    handlers: HashMap<String, Vec<(HandlerId, EventHandler)>>,
}

struct Inner {
    connection: Connection,
    contract: Arc<Contract>,
    options: ClientOptions,
    path: Option<String>,
    /// Cancelled when the proxy closes; stops its event demux and the
    /// providers serving its stream arguments.
    scope: CancellationToken,
    core: Mutex<Core>,
}

impl Inner {
    fn core(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn abort(&self) {
        let token = {
            let mut core = self.core();
            let token = if core.state == ProxyState::Opened { core.token.clone() } else { None };
            core.state = ProxyState::Closed;
            token
        };
        if let Some(token) = token {
            let close = Message::for_command(Command::Close).with_token(&token);
            if self.connection.send(close).is_err() {
                log::trace!("proxy: {token} outlived its connection");
            }
        }
        self.scope.cancel();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Client-side handle to one remote session. Clones share the session; it
/// is closed when the last clone goes away.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    pub(crate) fn new(
        connection: Connection,
        contract: Arc<Contract>,
        options: ClientOptions,
        path: Option<String>,
    ) -> Self {
        let scope = connection.scope();
        Self {
            inner: Arc::new(Inner {
                connection,
                contract,
                options,
                path,
                scope,
                core: Mutex::new(Core {
                    state: ProxyState::Created,
                    token: None,
                    next_handler: 0,
                    handlers: HashMap::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> ProxyState {
        self.inner.core().state
    }

    pub fn token(&self) -> Option<String> {
        self.inner.core().token.clone()
    }

    pub fn contract(&self) -> &Arc<Contract> {
        &self.inner.contract
    }

    pub fn path(&self) -> Option<&str> {
        self.inner.path.as_deref()
    }

    pub(crate) async fn open_path(&self, path: &str) -> Result<(), RpcError> {
        self.open(Message::for_command(Command::Open).with_location(path)).await
    }

    pub(crate) async fn open_token(&self, token: &str) -> Result<(), RpcError> {
        self.open(Message::for_command(Command::Open).with_token(token)).await
    }

    async fn open(&self, request: Message) -> Result<(), RpcError> {
        {
            let mut core = self.inner.core();
            if core.state != ProxyState::Created {
                return Err(RpcError::invalid_state(format!(
                    "cannot open a proxy that is {:?}",
                    core.state
                )));
            }
            core.state = ProxyState::Opening;
        }
        let requested = request.token().map(str::to_string);
        let result = self
            .inner
            .connection
            .request(
                request,
                Expect::reply(),
                self.inner.options.operation_timeout,
                Some(&self.inner.scope),
            )
            .await
            .and_then(|reply| match reply.status() {
                Some(Status::Ok) => reply
                    .value()
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| RpcError::protocol("open reply carries no token")),
                Some(Status::Error) => Err(remote_error(&reply, requested.as_deref())),
                _ => Err(unsupported(&reply)),
            });

        let token = match result {
            Ok(token) => token,
            Err(err) => {
                let mut core = self.inner.core();
                if core.state == ProxyState::Opening {
                    core.state = ProxyState::Faulted;
                }
                return Err(err);
            }
        };

        let events = self.inner.connection.subscribe(Command::Event, &token);
        {
            let mut core = self.inner.core();
            if core.state != ProxyState::Opening {
                return Err(RpcError::invalid_state(format!(
                    "proxy became {:?} while opening",
                    core.state
                )));
            }
            core.state = ProxyState::Opened;
            core.token = Some(token.clone());
        }
        self.spawn_demux(events);
        log::debug!("proxy: opened {token} ({})", self.inner.contract.name());
        Ok(())
    }

    /// One task per proxy hands inbound events to the local handlers.
    fn spawn_demux(&self, mut events: Subscription) {
        let weak = Arc::downgrade(&self.inner);
        let scope = self.inner.scope.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = scope.cancelled() => break,
                    next = events.recv() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Proxy { inner }.dispatch_event(message);
            }
        });
    }

    fn dispatch_event(&self, mut message: Message) {
        let Some(name) = message.method().map(str::to_string) else {
            log::debug!("proxy: event without a name");
            return;
        };
        let handlers: Vec<EventHandler> = self
            .inner
            .core()
            .handlers
            .get(&name)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            log::trace!("proxy: no handler for {name}");
            return;
        }
        let args = EventArgs { name, value: message.remove(header::VALUE).unwrap_or(Value::Nil) };
        for handler in &handlers {
            handler(self, &args);
        }
    }

    /// Registers `handler` for the contract event `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> Result<HandlerId, RpcError>
    where
        F: Fn(&Proxy, &EventArgs) + Send + Sync + 'static,
    {
        if self.inner.contract.event(event).is_none() {
            return Err(RpcError::mismatch(format!(
                "{} declares no event {event}",
                self.inner.contract.name()
            )));
        }
        let mut core = self.inner.core();
        let id = HandlerId(core.next_handler);
        core.next_handler += 1;
        core.handlers.entry(event.to_string()).or_default().push((id, Arc::new(handler)));
        Ok(id)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut core = self.inner.core();
        let mut removed = false;
        for list in core.handlers.values_mut() {
            let before = list.len();
            list.retain(|(handler, _)| *handler != id);
            removed |= list.len() != before;
        }
        core.handlers.retain(|_, list| !list.is_empty());
        removed
    }

    fn require_token(&self) -> Result<String, RpcError> {
        let core = self.inner.core();
        match (core.state, &core.token) {
            (ProxyState::Opened, Some(token)) => Ok(token.clone()),
            (ProxyState::Faulted, _) => Err(RpcError::channel("proxy is faulted")),
            (state, _) => Err(RpcError::invalid_state(format!("proxy is {state:?}"))),
        }
    }

    /// Faults the proxy on a transport failure.
    fn observe(&self, err: RpcError) -> RpcError {
        match err {
            RpcError::ChannelFault { .. } => {
                self.inner.core().state = ProxyState::Faulted;
                self.inner.scope.cancel();
                err
            }
            RpcError::Cancelled { .. } if self.state() == ProxyState::Faulted => {
                RpcError::channel("proxy faulted during the call")
            }
            other => other,
        }
    }

    /// Calls the first operation named `operation`.
    pub async fn call(&self, operation: &str, args: Vec<CallArg>) -> Result<Invocation, RpcError> {
        let op = self.inner.contract.operation(operation).cloned().ok_or_else(|| {
            let contract = self.inner.contract.name();
            RpcError::mismatch(format!("{contract} declares no operation {operation}"))
        })?;
        self.call_op(&op, args).await
    }

    pub async fn call_op(
        &self,
        operation: &Operation,
        args: Vec<CallArg>,
    ) -> Result<Invocation, RpcError> {
        let token = self.require_token()?;
        let params = operation.params();
        if args.len() > params.len() {
            return Err(RpcError::codec(format!(
                "{} takes {} arguments, got {}",
                operation.name(),
                params.len(),
                args.len()
            )));
        }

        let mut wire = Vec::with_capacity(args.len());
        for (param, arg) in params.iter().zip(args) {
            wire.push(match arg {
                CallArg::Missing => Value::Nil,
                CallArg::Value(value) if param.ty.is_primitive() || param.ty == TypeTag::Bytes => {
                    codec::coerce(&param.ty, value)?
                }
                CallArg::Value(value) => value,
                CallArg::Stream(stream) => {
                    if !param.ty.is_stream() {
                        return Err(RpcError::codec(format!(
                            "{} is not a stream parameter",
                            param.name
                        )));
                    }
                    let served = provider::spawn(
                        self.inner.connection.clone(),
                        stream,
                        true,
                        self.inner.scope.child_token(),
                    );
                    Value::from(served)
                }
            });
        }

        let mut request = Message::for_command(Command::Execute)
            .with_token(&token)
            .with_method(&operation.signature().to_string())
            .with_args(wire);
        if let Some(path) = &self.inner.path {
            request.set(header::LOCATION, path.as_str());
        }
        let reply = self
            .inner
            .connection
            .request(
                request,
                Expect::reply_for(&token),
                self.inner.options.receive_timeout,
                Some(&self.inner.scope),
            )
            .await
            .map_err(|err| self.observe(err))?;
        self.interpret(operation, &token, reply).await
    }

    async fn interpret(
        &self,
        operation: &Operation,
        token: &str,
        mut reply: Message,
    ) -> Result<Invocation, RpcError> {
        let elapsed = reply.elapsed();
        let status = reply.status();
        if status == Some(Status::Error) {
            return Err(remote_error(&reply, Some(token)));
        }
        let ref_args = match reply.remove(header::ARGS) {
            Some(Value::Array(values)) => written_back(operation, values)?,
            Some(Value::Nil) | None => Vec::new(),
            Some(_) => return Err(RpcError::protocol("ARG is not an array")),
        };

        let returned = match status {
            Some(Status::Void) => Returned::Void,
            Some(Status::Ok) => {
                let value = reply.remove(header::VALUE).unwrap_or(Value::Nil);
                let declared = operation.return_type();
                if declared.is_primitive() || *declared == TypeTag::Bytes {
                    Returned::Value(codec::coerce(declared, value)?)
                } else {
                    Returned::Value(value)
                }
            }
            Some(Status::ServiceRef) => {
                let nested = returned_token(&reply)?;
                let contract = operation.service_contract().cloned().ok_or_else(|| {
                    RpcError::mismatch(format!("{} does not return a service", operation.name()))
                })?;
                let proxy = Proxy::new(
                    self.inner.connection.clone(),
                    contract,
                    self.inner.options.clone(),
                    None,
                );
                proxy.open_token(&nested).await.map_err(|err| self.observe(err))?;
                Returned::Service(proxy)
            }
            Some(Status::StreamRef) => {
                let stream = returned_token(&reply)?;
                Returned::Stream(RemoteStream::new(
                    self.inner.connection.clone(),
                    stream,
                    self.inner.options.stream_timeout,
                ))
            }
            Some(Status::Error) | None => return Err(unsupported(&reply)),
        };
        Ok(Invocation { returned, ref_args, elapsed })
    }

    /// Reads the property `name` through its `get_` accessor.
    pub async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, RpcError> {
        self.call(&format!("get_{name}"), Vec::new()).await?.value()
    }

    pub async fn set<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), RpcError> {
        self.call(&format!("set_{name}"), vec![CallArg::value(value)?]).await.map(|_| ())
    }

    /// Closes the remote session and waits for the server to confirm.
    pub async fn close(&self) -> Result<(), RpcError> {
        let token = {
            let mut core = self.inner.core();
            match core.state {
                ProxyState::Opening | ProxyState::Closing => {
                    return Err(RpcError::invalid_state(format!(
                        "cannot close while {:?}",
                        core.state
                    )));
                }
                ProxyState::Opened => {
                    core.state = ProxyState::Closing;
                    core.token.clone()
                }
                ProxyState::Created | ProxyState::Closed | ProxyState::Faulted => {
                    core.state = ProxyState::Closed;
                    None
                }
            }
        };
        let result = match token {
            Some(token) => self
                .inner
                .connection
                .request(
                    Message::for_command(Command::Close).with_token(&token),
                    Expect::reply(),
                    self.inner.options.operation_timeout,
                    None,
                )
                .await
                .and_then(|reply| match reply.status() {
                    Some(Status::Void) | Some(Status::Ok) => Ok(()),
                    Some(Status::Error) => Err(remote_error(&reply, Some(&token))),
                    _ => Err(unsupported(&reply)),
                }),
            None => Ok(()),
        };
        self.inner.core().state = ProxyState::Closed;
        self.inner.scope.cancel();
        result
    }

    /// Closes without waiting for the server. Never fails.
    pub fn abort(&self) {
        self.inner.abort();
    }
}

impl AsRef<Proxy> for Proxy {
    fn as_ref(&self) -> &Proxy {
        self
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core();
        f.debug_struct("Proxy")
            .field("contract", &self.inner.contract.name())
            .field("token", &core.token)
            .field("state", &core.state)
            .finish()
    }
}

fn remote_error(reply: &Message, token: Option<&str>) -> RpcError {
    let text = reply.value().and_then(Value::as_str).unwrap_or("remote call failed");
    RpcError::from_remote(text, reply.location(), token)
}

fn unsupported(reply: &Message) -> RpcError {
    RpcError::UnsupportedStatus { status: reply.status_raw().unwrap_or_default().to_string() }
}

fn returned_token(reply: &Message) -> Result<String, RpcError> {
    reply
        .value()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::protocol("reference reply carries no token"))
}

fn written_back(operation: &Operation, values: Vec<Value>) -> Result<Vec<Value>, RpcError> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| match operation.params().get(index) {
            Some(param) if param.is_by_ref() && !value.is_nil() && param.ty.is_primitive() => {
                codec::coerce(&param.ty, value)
            }
            _ => Ok(value),
        })
        .collect()
}
