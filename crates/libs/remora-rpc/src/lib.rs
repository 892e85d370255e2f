//! Remote objects over a single msgpack connection.
//!
//! A [`Server`] hosts services registered as [`Endpoint`]s. A [`Client`]
//! opens a [`Proxy`] per session and calls operations, reads and writes
//! properties and subscribes to events as if the object were local. Nested
//! services come back as new proxies and byte streams as [`RemoteStream`]s,
//! all multiplexed over the same connection.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod contract;
pub mod correlation;
pub mod error;
pub mod server;
pub mod service;
pub mod session;
pub mod stream;

pub use client::{
    BlockingProxy, CallArg, CallState, Client, EventArgs, Extended, HandlerId, Invocation,
    Lifecycle, Proxy, ProxyState, RemoteResult, Returned,
};
pub use config::{ClientOptions, RpcConfig, ServerOptions};
pub use contract::{Contract, ContractBuilder, Operation, Param, ParamMode, PropertyAccess};
pub use error::RpcError;
pub use server::{ConnectionContext, Endpoint, Server};
pub use service::{Arg, Arguments, EventHub, EventSubscription, RemoteService, Reply};
pub use session::{Clock, ManualClock, Session, SessionCache, SystemClock};
pub use stream::{ByteStream, FileStream, RemoteStream};

pub use remora_wire::{TypeTag, Value};
