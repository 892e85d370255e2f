//! Hosting side: endpoint registry, listener loop and per-connection
//! dispatch.

mod dispatcher;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerOptions;
use crate::connection::{server_handshake, Connection};
use crate::contract::Contract;
use crate::service::RemoteService;
use crate::session::SessionCache;
use crate::RpcError;

/// What a factory learns about the connection it serves.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    pub remote_addr: Option<SocketAddr>,
}

type Factory =
    dyn Fn(&ConnectionContext) -> Result<Arc<dyn RemoteService>, RpcError> + Send + Sync;

/// A registered path, its contract and the factory producing one service
/// instance per opened session.
pub struct Endpoint {
    path: String,
    contract: Arc<Contract>,
    factory: Option<Box<Factory>>,
}

impl Endpoint {
    pub fn new<F>(path: impl Into<String>, contract: Arc<Contract>, factory: F) -> Self
    where
        F: Fn(&ConnectionContext) -> Result<Arc<dyn RemoteService>, RpcError>
            + Send
            + Sync
            + 'static,
    {
        Self { path: path.into(), contract, factory: Some(Box::new(factory)) }
    }

    /// Endpoint for a nested service whose contract has no registered path.
    /// It cannot be opened by path.
    fn synthesized(contract: Arc<Contract>) -> Self {
        Self { path: format!("/{}", Uuid::new_v4().simple()), contract, factory: None }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn contract(&self) -> &Arc<Contract> {
        &self.contract
    }

    fn instantiate(&self, context: &ConnectionContext) -> Result<Arc<dyn RemoteService>, RpcError> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| RpcError::invalid_state(format!("{} has no factory", self.path)))?;
        let instance = factory(context)?;
        if instance.contract().name() != self.contract.name() {
            return Err(RpcError::Registration {
                message: format!(
                    "{} produced a {} where {} was registered",
                    self.path,
                    instance.contract().name(),
                    self.contract.name()
                ),
            });
        }
        Ok(instance)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("path", &self.path)
            .field("contract", &self.contract.name())
            .finish()
    }
}

/// How many connections currently track each session token.
#[derive(Default)]
struct TokenLedger {
    holders: Mutex<HashMap<String, usize>>,
}

impl TokenLedger {
    fn holders(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.holders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, token: &str) {
        *self.holders().entry(token.to_ascii_lowercase()).or_default() += 1;
    }

    /// Returns `true` when no connection holds `token` any more.
    fn release(&self, token: &str) -> bool {
        let key = token.to_ascii_lowercase();
        let mut holders = self.holders();
        match holders.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                holders.remove(&key);
                true
            }
            None => true,
        }
    }
}

struct Host {
    options: ServerOptions,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    sessions: Arc<SessionCache>,
    ledger: TokenLedger,
    cancel: CancellationToken,
}

impl Host {
    fn endpoints(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Endpoint>>> {
        self.endpoints.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn endpoints_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Endpoint>>> {
        self.endpoints.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn find(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.endpoints().iter().find(|endpoint| endpoint.path.eq_ignore_ascii_case(path)).cloned()
    }

    /// Endpoint serving `contract`, registering nothing if none does.
    fn endpoint_for(&self, contract: Arc<Contract>) -> Arc<Endpoint> {
        self.endpoints()
            .iter()
            .find(|endpoint| endpoint.contract.name() == contract.name())
            .cloned()
            .unwrap_or_else(|| Arc::new(Endpoint::synthesized(contract)))
    }
}

/// Serves registered endpoints to any number of connections. Clones share
/// the registry and the session cache.
#[derive(Clone)]
pub struct Server {
    host: Arc<Host>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let sessions = Arc::new(SessionCache::new(options.session_timeout));
        Self::with_session_cache(options, sessions)
    }

    /// Uses `sessions` instead of a cache of its own, e.g. one driven by a
    /// [`crate::session::ManualClock`].
    pub fn with_session_cache(options: ServerOptions, sessions: Arc<SessionCache>) -> Self {
        Self {
            host: Arc::new(Host {
                options,
                endpoints: RwLock::new(Vec::new()),
                sessions,
                ledger: TokenLedger::default(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn register(&self, endpoint: Endpoint) -> Result<(), RpcError> {
        if endpoint.path.trim().is_empty() {
            return Err(RpcError::Registration { message: "endpoint path is empty".into() });
        }
        let mut endpoints = self.host.endpoints_mut();
        if endpoints.iter().any(|existing| existing.path.eq_ignore_ascii_case(&endpoint.path)) {
            return Err(RpcError::Registration {
                message: format!("{} is already registered", endpoint.path),
            });
        }
        log::info!("server: registered {} ({})", endpoint.path, endpoint.contract.name());
        endpoints.push(Arc::new(endpoint));
        Ok(())
    }

    /// Removes the endpoint at `path`. Sessions it already created live on.
    pub fn unregister(&self, path: &str) -> bool {
        let mut endpoints = self.host.endpoints_mut();
        let before = endpoints.len();
        endpoints.retain(|endpoint| !endpoint.path.eq_ignore_ascii_case(path));
        before != endpoints.len()
    }

    pub fn endpoint(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.host.find(path)
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.host.sessions
    }

    pub fn options(&self) -> &ServerOptions {
        &self.host.options
    }

    /// Accepts connections on `listener` until [`Server::shutdown`]. Also
    /// runs the session sweeper.
    pub async fn serve(&self, listener: TcpListener) {
        let cancel = self.host.cancel.clone();
        let sweeper =
            self.host.sessions.start(self.host.options.sweep_interval, cancel.child_token());
        if let Ok(addr) = listener.local_addr() {
            log::info!("server: listen on <{addr}>");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                client = listener.accept() => match client {
                    Ok((stream, peer)) => {
                        log::info!("server: new client <{peer}> connected");
                        if let Err(err) = stream.set_nodelay(true) {
                            log::debug!("server: nodelay on <{peer}> failed: {err}");
                        }
                        self.accept(stream, Some(peer));
                    }
                    Err(err) => log::warn!("server: accept failed: {err}"),
                }
            }
        }

        let _ = sweeper.await;
        log::info!("server: stopped");
    }

    /// Runs the handshake on `io` and then dispatches its commands until the
    /// peer goes away.
    pub fn accept<S>(&self, mut io: S, peer: Option<SocketAddr>) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let host = Arc::clone(&self.host);
        tokio::spawn(async move {
            if let Err(err) = server_handshake(&mut io, host.options.handshake_timeout).await {
                log::warn!("server: handshake with {peer:?} failed: {err}");
                return;
            }
            let (connection, inbound) = Connection::spawn(io, peer, host.options.id_ceiling);
            dispatcher::Dispatcher::new(host, connection, ConnectionContext { remote_addr: peer })
                .run(inbound)
                .await;
        })
    }

    /// Stops accepting, closes every connection and evicts every session.
    pub fn shutdown(&self) {
        self.host.cancel.cancel();
        let drained = self.host.sessions.drain();
        log::info!("server: shut down, {drained} sessions evicted");
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.host.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Operation;
    use crate::service::{Arguments, Reply};
    use async_trait::async_trait;

    struct Nothing;

    #[async_trait]
    impl RemoteService for Nothing {
        fn contract(&self) -> Arc<Contract> {
            Contract::builder("Nothing")
                .operation(Operation::new("Ping"))
                .build()
                .expect("contract")
        }

        async fn invoke(&self, _: &Operation, _: &mut Arguments) -> Result<Reply, RpcError> {
            Ok(Reply::Void)
        }
    }

    fn endpoint(path: &str) -> Endpoint {
        Endpoint::new(path, Nothing.contract(), |_| Ok(Arc::new(Nothing) as Arc<dyn RemoteService>))
    }

    #[test]
    fn registry_matches_paths_case_insensitively_and_rejects_duplicates() {
        let server = Server::new(ServerOptions::default());
        server.register(endpoint("/Nothing")).expect("register");
        assert!(server.endpoint("/nothing").is_some());

        let err = server.register(endpoint("/NOTHING")).expect_err("duplicate");
        assert!(matches!(err, RpcError::Registration { .. }));
        assert!(server.register(endpoint("  ")).is_err());

        assert!(server.unregister("/nothing"));
        assert!(!server.unregister("/nothing"));
        assert!(server.endpoint("/Nothing").is_none());
    }

    #[test]
    fn ledger_releases_a_token_only_after_its_last_holder() {
        let ledger = TokenLedger::default();
        ledger.acquire("ABC");
        ledger.acquire("abc");
        assert!(!ledger.release("abc"));
        assert!(ledger.release("Abc"));
        assert!(ledger.release("unknown"));
    }

    #[test]
    fn nested_services_reuse_a_registered_endpoint_or_get_a_fresh_one() {
        let server = Server::new(ServerOptions::default());
        server.register(endpoint("/nothing")).expect("register");
        let found = server.host.endpoint_for(Nothing.contract());
        assert_eq!(found.path(), "/nothing");

        let other = Contract::builder("Other").build().expect("contract");
        let synthesized = server.host.endpoint_for(other);
        assert!(synthesized.path().starts_with('/'));
        assert!(server.endpoint(synthesized.path()).is_none());
        assert!(synthesized.instantiate(&ConnectionContext { remote_addr: None }).is_err());
    }
}
