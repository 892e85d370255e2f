//! Local-only call surfaces layered over any proxy.
//!
//! Typed stubs wrap a [`Proxy`] and implement their contract trait; by also
//! exposing the proxy through `AsRef` they pick up [`Extended`] and
//! [`Lifecycle`] for free.

use std::time::Duration;

use async_trait::async_trait;
use remora_wire::Value;

use super::proxy::{CallArg, Invocation, Proxy, ProxyState, Returned};
use crate::RpcError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Completed,
    Faulted,
}

/// Outcome of an explicit call, with its metadata instead of an early error.
#[derive(Debug)]
pub struct RemoteResult {
    pub state: CallState,
    pub value: Option<Returned>,
    pub ref_args: Vec<Value>,
    /// Server-side execution time from the reply's `TIME` header.
    pub execution_time: Option<Duration>,
    pub fault: Option<RpcError>,
}

impl RemoteResult {
    fn from_call(result: Result<Invocation, RpcError>) -> Self {
        match result {
            Ok(invocation) => Self {
                state: CallState::Completed,
                value: Some(invocation.returned),
                ref_args: invocation.ref_args,
                execution_time: invocation.elapsed,
                fault: None,
            },
            Err(err) => Self::faulted(err),
        }
    }

    fn faulted(err: RpcError) -> Self {
        Self {
            state: CallState::Faulted,
            value: None,
            ref_args: Vec::new(),
            execution_time: None,
            fault: Some(err),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == CallState::Completed
    }

    /// The plain value of a completed call, or its fault.
    pub fn into_result(self) -> Result<Option<Value>, RpcError> {
        if let Some(fault) = self.fault {
            return Err(fault);
        }
        match self.value {
            Some(Returned::Value(value)) => Ok(Some(value)),
            Some(Returned::Void) | None => Ok(None),
            Some(other) => Err(RpcError::codec(format!("call returned {other:?}, not a value"))),
        }
    }
}

#[async_trait]
pub trait Extended {
    async fn call_ext(&self, operation: &str, args: Vec<CallArg>) -> RemoteResult;
    async fn get_ext(&self, property: &str) -> RemoteResult;
    async fn set_ext(&self, property: &str, value: Value) -> RemoteResult;
}

#[async_trait]
impl<T> Extended for T
where
    T: AsRef<Proxy> + Send + Sync,
{
    async fn call_ext(&self, operation: &str, args: Vec<CallArg>) -> RemoteResult {
        RemoteResult::from_call(self.as_ref().call(operation, args).await)
    }

    async fn get_ext(&self, property: &str) -> RemoteResult {
        self.call_ext(&format!("get_{property}"), Vec::new()).await
    }

    async fn set_ext(&self, property: &str, value: Value) -> RemoteResult {
        self.call_ext(&format!("set_{property}"), vec![CallArg::Value(value)]).await
    }
}

#[async_trait]
pub trait Lifecycle {
    async fn close(&self) -> Result<(), RpcError>;
    fn abort(&self);
    fn state(&self) -> ProxyState;
}

#[async_trait]
impl<T> Lifecycle for T
where
    T: AsRef<Proxy> + Send + Sync,
{
    async fn close(&self) -> Result<(), RpcError> {
        self.as_ref().close().await
    }

    fn abort(&self) {
        self.as_ref().abort();
    }

    fn state(&self) -> ProxyState {
        self.as_ref().state()
    }
}
