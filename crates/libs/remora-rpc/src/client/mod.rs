//! Calling side: a [`Client`] owns one connection and opens [`Proxy`]
//! handles on it.

mod blocking;
mod extended;
mod proxy;

pub use blocking::BlockingProxy;
pub use extended::{CallState, Extended, Lifecycle, RemoteResult};
pub use proxy::{CallArg, EventArgs, HandlerId, Invocation, Proxy, ProxyState, Returned};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::ClientOptions;
use crate::connection::{client_handshake, Connection};
use crate::contract::Contract;
use crate::RpcError;

/// Owns the connection: dropping the client closes it and faults every
/// proxy opened through it.
pub struct Client {
    connection: Connection,
    options: ClientOptions,
}

impl Client {
    /// Connects and runs the version handshake. With `retry_handshake` set,
    /// network failures are retried up to `handshake_attempts` times; calls
    /// made later are never retried.
    pub async fn connect(addr: &str, options: ClientOptions) -> Result<Self, RpcError> {
        let attempts = if options.retry_handshake { options.handshake_attempts.max(1) } else { 1 };
        let mut attempt = 1;
        loop {
            match Self::try_connect(addr, &options).await {
                Ok(client) => return Ok(client),
                Err(err @ (RpcError::ChannelFault { .. } | RpcError::Timeout { .. }))
                    if attempt < attempts =>
                {
                    log::warn!(
                        "client: connect to {addr} failed (attempt {attempt}/{attempts}): {err}"
                    );
                    attempt += 1;
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_connect(addr: &str, options: &ClientOptions) -> Result<Self, RpcError> {
        let stream = tokio::time::timeout(options.operation_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout { operation: format!("connect {addr}") })?
            .map_err(|err| RpcError::channel(format!("connect {addr}: {err}")))?;
        let peer = stream.peer_addr().ok();
        if let Err(err) = stream.set_nodelay(true) {
            log::debug!("client: nodelay on {addr} failed: {err}");
        }
        Self::establish(stream, peer, options.clone()).await
    }

    /// Runs the handshake over an already connected stream.
    pub async fn from_io<S>(io: S, options: ClientOptions) -> Result<Self, RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(io, None, options).await
    }

    async fn establish<S>(
        mut io: S,
        peer: Option<SocketAddr>,
        options: ClientOptions,
    ) -> Result<Self, RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        client_handshake(&mut io, options.operation_timeout).await?;
        let (connection, mut inbound) = Connection::spawn(io, peer, options.id_ceiling);
        log::debug!("client: connected to {peer:?}");

        // Stream requests for tokens we no longer serve still get an answer.
        {
            let connection = connection.clone();
            tokio::spawn(async move {
                while let Some(message) = inbound.recv().await {
                    connection.reject_unrouted(message);
                }
            });
        }

        Ok(Self { connection, options })
    }

    /// Opens a new session at `path`.
    pub async fn open(&self, path: &str, contract: Arc<Contract>) -> Result<Proxy, RpcError> {
        let proxy = Proxy::new(
            self.connection.clone(),
            contract,
            self.options.clone(),
            Some(path.to_string()),
        );
        proxy.open_path(path).await?;
        Ok(proxy)
    }

    /// Binds a proxy to an existing session, e.g. one handed over by another
    /// client.
    pub async fn attach(&self, token: &str, contract: Arc<Contract>) -> Result<Proxy, RpcError> {
        let proxy = Proxy::new(self.connection.clone(), contract, self.options.clone(), None);
        proxy.open_token(token).await?;
        Ok(proxy)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Drops the connection. Every proxy on it faults.
    pub fn close(&self) {
        self.connection.close();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.connection.is_closed() {
            log::debug!("client: closing {:?} on drop", self.connection.peer());
        }
        self.connection.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.connection.peer())
            .field("closed", &self.connection.is_closed())
            .finish()
    }
}
