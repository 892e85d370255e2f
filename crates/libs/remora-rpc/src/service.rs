//! Server-side view of a remote object.
//!
//! A service is registered through an adapter implementing [`RemoteService`]:
//! the dispatcher hands it the matched [`Operation`] and decoded
//! [`Arguments`], and turns its [`Reply`] into the wire response.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use remora_wire::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::contract::{Contract, Operation};
use crate::stream::{ByteStream, RemoteStream};
use crate::RpcError;

#[async_trait]
pub trait RemoteService: Send + Sync + 'static {
    fn contract(&self) -> Arc<Contract>;

    /// Runs `operation`. By-ref and out parameters are written back through
    /// [`Arguments::set`].
    async fn invoke(&self, operation: &Operation, args: &mut Arguments) -> Result<Reply, RpcError>;

    /// Event source for the contract's declared events.
    fn events(&self) -> Option<&EventHub> {
        None
    }

    /// Called once when the session owning this instance ends.
    fn dispose(&self) {}
}

/// One decoded argument.
pub enum Arg {
    Value(Value),
    /// A stream the caller provides; reads and writes go back over the wire.
    Stream(RemoteStream),
    /// An optional argument the caller left out.
    Missing,
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(stream) => f.debug_tuple("Stream").field(&stream.token()).finish(),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Arguments {
    args: Vec<Arg>,
}

impl Arguments {
    pub fn new(args: Vec<Arg>) -> Self {
        Self { args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn is_missing(&self, index: usize) -> bool {
        matches!(self.args.get(index), None | Some(Arg::Missing))
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        match self.args.get(index) {
            Some(Arg::Value(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        match self.args.get(index) {
            Some(Arg::Value(value)) => codec::decode(value.clone()),
            Some(Arg::Stream(_)) => Err(RpcError::codec(format!("argument {index} is a stream"))),
            Some(Arg::Missing) | None => {
                Err(RpcError::codec(format!("argument {index} is missing")))
            }
        }
    }

    /// Like [`Arguments::get`], with `None` for a missing argument.
    pub fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, RpcError> {
        if self.is_missing(index) {
            return Ok(None);
        }
        self.get(index).map(Some)
    }

    pub fn bytes(&self, index: usize) -> Result<Vec<u8>, RpcError> {
        let value = self
            .value(index)
            .ok_or_else(|| RpcError::codec(format!("argument {index} is not a value")))?;
        codec::decode_bytes(value.clone())
    }

    pub fn take_stream(&mut self, index: usize) -> Result<RemoteStream, RpcError> {
        let slot = self
            .args
            .get_mut(index)
            .ok_or_else(|| RpcError::codec(format!("argument {index} is missing")))?;
        match std::mem::replace(slot, Arg::Missing) {
            Arg::Stream(stream) => Ok(stream),
            other => {
                *slot = other;
                Err(RpcError::codec(format!("argument {index} is not a stream")))
            }
        }
    }

    /// Replaces argument `index`, used for by-ref and out parameters.
    pub fn set<T: Serialize + ?Sized>(&mut self, index: usize, value: &T) -> Result<(), RpcError> {
        let slot = self
            .args
            .get_mut(index)
            .ok_or_else(|| RpcError::codec(format!("no argument at {index}")))?;
        *slot = Arg::Value(codec::encode(value)?);
        Ok(())
    }

    pub(crate) fn into_inner(self) -> Vec<Arg> {
        self.args
    }
}

/// What an operation produced.
pub enum Reply {
    Void,
    Value(Value),
    Stream(Box<dyn ByteStream>),
    Service(Arc<dyn RemoteService>),
}

impl Reply {
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self, RpcError> {
        codec::encode(value).map(Self::Value)
    }

    pub fn stream(stream: impl ByteStream + 'static) -> Self {
        Self::Stream(Box::new(stream))
    }

    pub fn service(service: impl RemoteService) -> Self {
        Self::Service(Arc::new(service))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Void => "nothing",
            Self::Value(_) => "a value",
            Self::Stream(_) => "a stream",
            Self::Service(_) => "a service",
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Service(service) => {
                f.debug_tuple("Service").field(&service.contract().name()).finish()
            }
            other => f.write_str(other.kind()),
        }
    }
}

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Handler)>>,
}

/// Named events a service fires; the dispatcher subscribes one forwarder per
/// open session and event.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<Mutex<HubInner>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(inner: &Mutex<HubInner>) -> std::sync::MutexGuard<'_, HubInner> {
        inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> EventSubscription {
        let mut inner = Self::lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.entry(event.to_string()).or_default().push((id, Arc::new(handler)));
        EventSubscription { hub: Arc::downgrade(&self.inner), event: event.to_string(), id }
    }

    /// Fires `event` with `args` and returns how many handlers ran.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, args: &T) -> Result<usize, RpcError> {
        let value = codec::encode(args)?;
        let handlers: Vec<Handler> = Self::lock(&self.inner)
            .handlers
            .get(event)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(&value);
        }
        Ok(handlers.len())
    }

    pub fn handler_count(&self, event: &str) -> usize {
        Self::lock(&self.inner).handlers.get(event).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = Self::lock(&self.inner);
        f.debug_map().entries(inner.handlers.iter().map(|(name, list)| (name, list.len()))).finish()
    }
}

/// Removes its handler from the hub when dropped.
pub struct EventSubscription {
    hub: Weak<Mutex<HubInner>>,
    event: String,
    id: u64,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let mut inner = EventHub::lock(&hub);
        if let Some(list) = inner.handlers.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                inner.handlers.remove(&self.event);
            }
        }
    }
}
