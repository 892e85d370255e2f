use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use remora_wire::{header, Command, Message, Signature, Status, TypeTag, Value};

use super::{ConnectionContext, Host};
use crate::codec;
use crate::connection::{Connection, Inbound};
use crate::contract::{Operation, ParamMode};
use crate::service::{Arg, Arguments, EventSubscription, Reply};
use crate::session::Session;
use crate::stream::{provider, RemoteStream};
use crate::RpcError;

const INVALID: &str = "[invalid]";

struct Tracked {
    _forwarders: Vec<EventSubscription>,
}

#[derive(Default)]
struct TrackedSet {
    closed: bool,
    sessions: HashMap<String, Tracked>,
}

/// Where a failed `Execute` happened, for the `LOC` header.
struct Site {
    path: String,
    method: String,
}

impl Site {
    fn location(&self) -> String {
        format!("{}/{}()", self.path, self.method)
    }
}

/// Serves the commands of one connection.
pub(super) struct Dispatcher {
    host: Arc<Host>,
    connection: Connection,
    context: ConnectionContext,
    tracked: Mutex<TrackedSet>,
}

impl Dispatcher {
    pub(super) fn new(
        host: Arc<Host>,
        connection: Connection,
        context: ConnectionContext,
    ) -> Arc<Self> {
        Arc::new(Self { host, connection, context, tracked: Mutex::new(TrackedSet::default()) })
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, TrackedSet> {
        self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) async fn run(self: Arc<Self>, mut inbound: Inbound) {
        let peer = self.context.remote_addr;
        log::debug!("dispatcher: serving {peer:?}");
        loop {
            tokio::select! {
                _ = self.host.cancel.cancelled() => break,
                _ = self.connection.closed() => break,
                next = inbound.recv() => match next {
                    Some(message) => {
                        let dispatcher = Arc::clone(&self);
                        tokio::spawn(async move { dispatcher.handle(message).await });
                    }
                    None => break,
                },
            }
        }
        self.connection.close();
        self.teardown();
        log::debug!("dispatcher: {peer:?} gone");
    }

    async fn handle(&self, message: Message) {
        if message.status_raw().is_some() {
            self.connection.reject_unrouted(message);
            return;
        }
        let reply = match message.command() {
            Some(Command::Open) => match self.open(&message) {
                Ok(token) => Message::new().with_status(Status::Ok).with_value(token),
                Err(err) => Message::error(err.to_wire()),
            },
            Some(Command::Close) => match self.close(&message) {
                Ok(()) => Message::new().with_status(Status::Void),
                Err(err) => Message::error(err.to_wire()),
            },
            Some(Command::Execute) => self.execute(&message).await,
            Some(Command::Stream) => {
                self.connection.reject_unrouted(message);
                return;
            }
            Some(Command::User) | Some(Command::Auth) => Message::error(
                RpcError::fault("NotSupported", "Authentication is not supported").to_wire(),
            ),
            Some(Command::Event) | None => Message::error(
                RpcError::protocol(format!(
                    "Unsupported command: {}",
                    message.command_raw().unwrap_or(INVALID)
                ))
                .to_wire(),
            ),
        };
        self.reply(&message, reply);
    }

    fn reply(&self, request: &Message, mut reply: Message) {
        let Some(id) = request.id() else {
            log::debug!("dispatcher: {:?} without an id gets no reply", request.command_raw());
            return;
        };
        reply.set_id(id);
        if self.connection.send(reply).is_err() {
            log::debug!("dispatcher: connection closed before reply {id}");
        }
    }

    fn open(&self, request: &Message) -> Result<String, RpcError> {
        if let Some(token) = request.token() {
            let session = self
                .host
                .sessions
                .get(token)
                .ok_or_else(|| RpcError::SessionNotFound { token: token.to_string() })?;
            self.track(&session);
            log::debug!("dispatcher: reopened {token}");
            return Ok(session.token().to_string());
        }
        if let Some(path) = request.location() {
            let endpoint = self
                .host
                .find(path)
                .ok_or_else(|| RpcError::protocol(format!("No endpoint is registered at {path}")))?;
            let instance = endpoint.instantiate(&self.context)?;
            let session = Arc::new(Session::new(Some(endpoint), instance));
            self.host.sessions.insert(Arc::clone(&session));
            self.track(&session);
            log::debug!("dispatcher: opened {} at {}", session.token(), session.path());
            return Ok(session.token().to_string());
        }
        Err(RpcError::protocol("No valid path or token was provided."))
    }

    fn close(&self, request: &Message) -> Result<(), RpcError> {
        let token = request.token().ok_or_else(|| RpcError::protocol("Parameter missing: TK"))?;
        if let Some(tracked) = self.untrack(token) {
            drop(tracked);
            self.host.ledger.release(token);
        }
        if self.host.sessions.remove(token) {
            log::debug!("dispatcher: closed {token}");
        }
        Ok(())
    }

    /// Starts forwarding the session's events to this connection, once.
    fn track(&self, session: &Arc<Session>) {
        let key = session.token().to_ascii_lowercase();
        let mut tracked = self.tracked();
        if tracked.closed || tracked.sessions.contains_key(&key) {
            return;
        }
        let forwarders = self.forwarders(session);
        tracked.sessions.insert(key, Tracked { _forwarders: forwarders });
        self.host.ledger.acquire(session.token());
    }

    fn untrack(&self, token: &str) -> Option<Tracked> {
        self.tracked().sessions.remove(&token.to_ascii_lowercase())
    }

    fn forwarders(&self, session: &Arc<Session>) -> Vec<EventSubscription> {
        let instance = session.instance();
        let Some(hub) = instance.events() else {
            return Vec::new();
        };
        instance
            .contract()
            .events()
            .iter()
            .map(|event| {
                let connection = self.connection.clone();
                let token = session.token().to_string();
                let name = event.name.clone();
                hub.subscribe(&event.name, move |args| {
                    let message = Message::for_command(Command::Event)
                        .with_token(&token)
                        .with_method(&name)
                        .with_value(args.clone());
                    if connection.send(message).is_err() {
                        log::trace!("dispatcher: dropped {name} for {token}, connection closed");
                    }
                })
            })
            .collect()
    }

    /// Closes every session this connection tracked unless another
    /// connection still holds it.
    fn teardown(&self) {
        let tracked = {
            let mut tracked = self.tracked();
            tracked.closed = true;
            std::mem::take(&mut tracked.sessions)
        };
        for token in tracked.into_keys() {
            if self.host.ledger.release(&token) && self.host.sessions.remove(&token) {
                log::debug!("dispatcher: closed {token} with its last connection");
            }
        }
    }

    async fn execute(&self, request: &Message) -> Message {
        let started = Instant::now();
        let mut site = Site { path: INVALID.to_string(), method: INVALID.to_string() };
        let mut reply = match self.invoke(request, &mut site).await {
            Ok(reply) => reply,
            Err(err) => {
                log::debug!("dispatcher: {} failed: {err}", site.location());
                Message::error(err.to_wire()).with_location(&site.location())
            }
        };
        if let Some(token) = request.token() {
            reply.set_token(token);
        }
        reply.set_elapsed(started.elapsed());
        reply
    }

    async fn invoke(&self, request: &Message, site: &mut Site) -> Result<Message, RpcError> {
        let token = request.token().ok_or_else(|| RpcError::protocol("Parameter missing: TK"))?;
        let session = self
            .host
            .sessions
            .get(token)
            .ok_or_else(|| RpcError::SessionNotFound { token: token.to_string() })?;
        site.path = session.path().to_string();

        let raw = request.method().ok_or_else(|| RpcError::protocol("Parameter missing: MTH"))?;
        let signature: Signature = raw.parse()?;
        site.method = signature.name.clone();

        let contract = session.instance().contract();
        let operation = contract.find(&signature).cloned().ok_or_else(|| {
            RpcError::mismatch(format!("{} has no operation `{signature}`", contract.name()))
        })?;
        let args = self.arguments(&operation, request.args().unwrap_or_default())?;

        let instance = session.live_instance()?;
        let task = {
            let operation = operation.clone();
            tokio::spawn(async move {
                let mut args = args;
                let result = instance.invoke(&operation, &mut args).await;
                (result, args)
            })
        };
        let (result, args) = task.await.map_err(|err| {
            let cause = if err.is_panic() { panic_text(err.into_panic()) } else { err.to_string() };
            RpcError::fault("Panic", cause)
        })?;
        let mut reply = self.respond(&operation, result?)?;

        if operation.params().iter().any(|param| param.is_by_ref()) {
            reply.set(header::ARGS, ref_values(&operation, args));
        }
        Ok(reply)
    }

    fn arguments(&self, operation: &Operation, raw: &[Value]) -> Result<Arguments, RpcError> {
        let params = operation.params();
        if raw.len() > params.len() {
            return Err(RpcError::protocol(format!(
                "{} takes {} arguments, got {}",
                operation.name(),
                params.len(),
                raw.len()
            )));
        }
        let mut args = Vec::with_capacity(params.len());
        for (index, param) in params.iter().enumerate() {
            let value = raw.get(index).cloned().unwrap_or(Value::Nil);
            let may_skip = param.optional || param.is_by_ref();
            let arg = if value.is_nil() && (may_skip || param.mode == ParamMode::Out) {
                Arg::Missing
            } else if param.ty.is_stream() {
                let token = value.as_str().ok_or_else(|| {
                    RpcError::codec(format!("{} must be a stream token", param.name))
                })?;
                Arg::Stream(RemoteStream::new(
                    self.connection.clone(),
                    token.to_string(),
                    self.host.options.stream_timeout,
                ))
            } else if param.ty.is_primitive() || param.ty == TypeTag::Bytes {
                Arg::Value(codec::coerce(&param.ty, value)?)
            } else {
                Arg::Value(value)
            };
            args.push(arg);
        }
        Ok(Arguments::new(args))
    }

    fn respond(&self, operation: &Operation, reply: Reply) -> Result<Message, RpcError> {
        let declared = operation.return_type();
        match (declared, reply) {
            (TypeTag::Void, Reply::Void) => Ok(Message::new().with_status(Status::Void)),
            (TypeTag::Stream, Reply::Stream(stream)) => {
                let token = provider::spawn(
                    self.connection.clone(),
                    stream,
                    operation.is_writable_stream(),
                    self.connection.scope(),
                );
                Ok(Message::new().with_status(Status::StreamRef).with_value(token))
            }
            (TypeTag::Contract(name), Reply::Service(service)) => {
                let contract = service.contract();
                if contract.name() != name.as_str() {
                    return Err(RpcError::fault(
                        "InvalidReturn",
                        format!(
                            "{} returned a {} where {name} was declared",
                            operation.name(),
                            contract.name()
                        ),
                    ));
                }
                let endpoint = self.host.endpoint_for(contract);
                let session = Arc::new(Session::new(Some(endpoint), service));
                let token = session.token().to_string();
                self.host.sessions.insert(session);
                Ok(Message::new().with_status(Status::ServiceRef).with_value(token))
            }
            (declared, Reply::Value(value))
                if !declared.is_void()
                    && !declared.is_stream()
                    && !matches!(declared, TypeTag::Contract(_)) =>
            {
                let value = if declared.is_primitive() || *declared == TypeTag::Bytes {
                    codec::coerce(declared, value)?
                } else {
                    value
                };
                Ok(Message::new().with_status(Status::Ok).with_value(value))
            }
            (declared, other) => Err(RpcError::fault(
                "InvalidReturn",
                format!(
                    "{} returned {} where {declared} was declared",
                    operation.name(),
                    other.kind()
                ),
            )),
        }
    }
}

/// One slot per parameter: the written-back value at by-ref positions, nil
/// elsewhere.
fn ref_values(operation: &Operation, args: Arguments) -> Vec<Value> {
    operation
        .params()
        .iter()
        .zip(args.into_inner())
        .map(|(param, arg)| match arg {
            Arg::Value(value) if param.is_by_ref() => value,
            _ => Value::Nil,
        })
        .collect()
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(text) => *text,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(text) => (*text).to_string(),
            Err(_) => "service panicked".to_string(),
        },
    }
}
