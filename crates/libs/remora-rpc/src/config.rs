use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Highest correlation id handed out before wrapping back to 1. Keeps ids
/// inside msgpack's positive fixint range.
pub const DEFAULT_ID_CEILING: u32 = 125;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub wire: WireConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub session_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub handshake_timeout_ms: u64,
    pub stream_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5561".into(),
            session_timeout_secs: 300,
            sweep_interval_secs: 30,
            handshake_timeout_ms: 10_000,
            stream_timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub receive_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub retry_handshake: bool,
    pub handshake_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 30_000,
            operation_timeout_ms: 10_000,
            stream_timeout_ms: 20_000,
            retry_handshake: false,
            handshake_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    pub id_ceiling: u32,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self { id_ceiling: DEFAULT_ID_CEILING }
    }
}

impl RpcConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            session_timeout: Duration::from_secs(self.server.session_timeout_secs),
            sweep_interval: Duration::from_secs(self.server.sweep_interval_secs.max(1)),
            handshake_timeout: Duration::from_millis(self.server.handshake_timeout_ms),
            stream_timeout: Duration::from_millis(self.server.stream_timeout_ms),
            id_ceiling: self.wire.id_ceiling.max(1),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            receive_timeout: Duration::from_millis(self.client.receive_timeout_ms),
            operation_timeout: Duration::from_millis(self.client.operation_timeout_ms),
            stream_timeout: Duration::from_millis(self.client.stream_timeout_ms),
            retry_handshake: self.client.retry_handshake,
            handshake_attempts: self.client.handshake_attempts.max(1),
            retry_delay: Duration::from_millis(self.client.retry_delay_ms),
            id_ceiling: self.wire.id_ceiling.max(1),
        }
    }
}

/// Runtime settings for a [`crate::Server`].
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Sliding expiration window for sessions.
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub handshake_timeout: Duration,
    /// Reply timeout for streams the server consumes from its clients.
    pub stream_timeout: Duration,
    pub id_ceiling: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        RpcConfig::default().server_options()
    }
}

/// Runtime settings for a [`crate::Client`] and the proxies it opens.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Reply timeout for `Execute` calls.
    pub receive_timeout: Duration,
    /// Reply timeout for the handshake, `Open` and `Close`.
    pub operation_timeout: Duration,
    /// Reply timeout for each remote stream request.
    pub stream_timeout: Duration,
    /// Retry connect and handshake on network errors. Never applies to calls.
    pub retry_handshake: bool,
    pub handshake_attempts: u32,
    pub retry_delay: Duration,
    pub id_ceiling: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        RpcConfig::default().client_options()
    }
}
