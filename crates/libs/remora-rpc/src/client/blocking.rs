use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;

use super::proxy::{CallArg, Invocation, Proxy, ProxyState};
use crate::RpcError;

/// Synchronous front for a [`Proxy`], for threads outside the runtime.
///
/// Each call drives the async path to completion on `handle`. Calling from
/// a runtime worker would stall that worker, so it is refused.
#[derive(Clone, Debug)]
pub struct BlockingProxy {
    proxy: Proxy,
    handle: Handle,
}

impl BlockingProxy {
    pub fn new(proxy: Proxy, handle: Handle) -> Self {
        Self { proxy, handle }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output, RpcError> {
        if Handle::try_current().is_ok() {
            return Err(RpcError::invalid_state("blocking call from inside the async runtime"));
        }
        Ok(self.handle.block_on(future))
    }

    pub fn call(&self, operation: &str, args: Vec<CallArg>) -> Result<Invocation, RpcError> {
        self.block_on(self.proxy.call(operation, args))?
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, RpcError> {
        self.block_on(self.proxy.get(name))?
    }

    pub fn set<T: Serialize + ?Sized + Sync>(&self, name: &str, value: &T) -> Result<(), RpcError> {
        self.block_on(self.proxy.set(name, value))?
    }

    pub fn close(&self) -> Result<(), RpcError> {
        self.block_on(self.proxy.close())?
    }

    pub fn state(&self) -> ProxyState {
        self.proxy.state()
    }
}

impl AsRef<Proxy> for BlockingProxy {
    fn as_ref(&self) -> &Proxy {
        &self.proxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::connection::Connection;
    use crate::contract::Contract;

    #[tokio::test]
    async fn refuses_to_block_a_runtime_thread() {
        let (io, _peer) = tokio::io::duplex(1024);
        let (connection, _inbound) = Connection::spawn(io, None, 125);
        let contract = Contract::builder("Empty").build().expect("contract");
        let proxy = Proxy::new(connection, contract, ClientOptions::default(), None);
        let blocking = BlockingProxy::new(proxy, Handle::current());

        let err = blocking.call("Anything", Vec::new()).expect_err("refused");
        assert!(matches!(err, RpcError::InvalidState { .. }));
    }
}
