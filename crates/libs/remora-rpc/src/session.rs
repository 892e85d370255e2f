//! Live sessions and the shared cache that owns them.
//!
//! Every opened endpoint and every returned nested service becomes a
//! [`Session`] under a fresh token. The [`SessionCache`] keeps them with a
//! sliding expiration: each lookup resets the timer, and an entry found
//! expired is evicted instead of refreshed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::server::Endpoint;
use crate::service::RemoteService;
use crate::RpcError;

/// Time source for expiration.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { base: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.base + offset
    }
}

/// A service instance reachable under a token.
pub struct Session {
    token: String,
    endpoint: Option<Arc<Endpoint>>,
    instance: Arc<dyn RemoteService>,
    created: SystemTime,
    disposed: AtomicBool,
}

impl Session {
    pub(crate) fn new(endpoint: Option<Arc<Endpoint>>, instance: Arc<dyn RemoteService>) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            endpoint,
            instance,
            created: SystemTime::now(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        self.endpoint.as_ref()
    }

    /// Registered path, or `[invalid]` for sessions without one.
    pub fn path(&self) -> &str {
        self.endpoint.as_ref().map_or("[invalid]", |endpoint| endpoint.path())
    }

    pub fn instance(&self) -> &Arc<dyn RemoteService> {
        &self.instance
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The instance, unless the session was evicted since it was looked up.
    pub fn live_instance(&self) -> Result<Arc<dyn RemoteService>, RpcError> {
        if self.is_disposed() {
            return Err(RpcError::SessionNotFound { token: self.token.clone() });
        }
        Ok(Arc::clone(&self.instance))
    }

    /// Disposes the instance. Only the first call has an effect.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("session: disposing {} ({})", self.token, self.path());
        self.instance.dispose();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("path", &self.path())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

struct Entry {
    session: Arc<Session>,
    last_access: Instant,
}

/// Token to session map with sliding expiration, shared by every connection
/// of a server.
pub struct SessionCache {
    entries: Mutex<HashMap<String, Entry>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionCache {
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), timeout, clock }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn insert(&self, session: Arc<Session>) {
        let key = session.token().to_ascii_lowercase();
        let entry = Entry { session, last_access: self.clock.now() };
        if let Some(previous) = self.entries().insert(key, entry) {
            previous.session.dispose();
        }
    }

    /// Looks up `token` and restarts its expiration window. An expired entry
    /// is evicted and disposed instead.
    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        let key = token.to_ascii_lowercase();
        let now = self.clock.now();
        let expired = {
            let mut entries = self.entries();
            let entry = entries.get_mut(&key)?;
            if now.saturating_duration_since(entry.last_access) < self.timeout {
                entry.last_access = now;
                return Some(Arc::clone(&entry.session));
            }
            entries.remove(&key)
        };
        if let Some(entry) = expired {
            log::debug!("session: {} expired on access", entry.session.token());
            entry.session.dispose();
        }
        None
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries().contains_key(&token.to_ascii_lowercase())
    }

    /// Evicts and disposes `token`. Returns `false` if it was not cached.
    pub fn remove(&self, token: &str) -> bool {
        let removed = self.entries().remove(&token.to_ascii_lowercase());
        match removed {
            Some(entry) => {
                entry.session.dispose();
                true
            }
            None => false,
        }
    }

    /// Evicts every expired entry and returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<Entry> = {
            let mut entries = self.entries();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| {
                    now.saturating_duration_since(entry.last_access) >= self.timeout
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };
        for entry in &expired {
            entry.session.dispose();
        }
        if !expired.is_empty() {
            log::debug!("session: swept {} expired sessions", expired.len());
        }
        expired.len()
    }

    /// Evicts everything.
    pub fn drain(&self) -> usize {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.session.dispose();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs [`SessionCache::sweep`] every `interval` until `cancel` fires.
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
            log::debug!("session: sweeper stopped");
        })
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("len", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
