//! Connections from the master to per-host daemons.
//!
//! Connectors are created lazily per host and cached until a
//! connector-affecting table is invalidated. A host whose connection fails is
//! flagged down, whichever caller saw the failure; for the retry window every
//! call to it fails fast without touching the network.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use hostmaster_core::{HostId, TableId};

use crate::config::{DaemonConfig, PoolConfig};
use crate::error::{PoolError, ProtocolError};
use crate::protocol::{read_frame_blocking, write_frame_blocking, DaemonFrame, Request, Response};
use crate::registry::InvalidationListener;

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Where and how to reach one daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonEndpoint {
    pub host: HostId,
    pub address: String,
    pub port: u16,
    pub key: String,
    pub protocol_version: u16,
}

impl From<&DaemonConfig> for DaemonEndpoint {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            host: config.host.clone(),
            address: config.address.clone(),
            port: config.port,
            key: config.key.clone(),
            protocol_version: config.protocol_version,
        }
    }
}

/// Resolves a host to its daemon endpoint.
pub trait DaemonDirectory: Send + Sync {
    fn resolve(&self, host: &HostId) -> Option<DaemonEndpoint>;
}

/// Endpoints held in memory, seeded from config.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    endpoints: RwLock<HashMap<HostId, DaemonEndpoint>>,
}

impl StaticDirectory {
    pub fn new(daemons: &[DaemonConfig]) -> Self {
        let endpoints = daemons
            .iter()
            .map(|daemon| (daemon.host.clone(), DaemonEndpoint::from(daemon)))
            .collect();
        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    /// Replace or add an endpoint. Cached connectors keep the old address
    /// until a connector table is invalidated.
    pub fn upsert(&self, endpoint: DaemonEndpoint) {
        self.endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(endpoint.host.clone(), endpoint);
    }

    pub fn remove(&self, host: &HostId) -> Option<DaemonEndpoint> {
        self.endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(host)
    }
}

impl DaemonDirectory for StaticDirectory {
    fn resolve(&self, host: &HostId) -> Option<DaemonEndpoint> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(host)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

/// Host-down bookkeeping. Every method takes the current instant so the
/// retry window can be exercised without sleeping.
#[derive(Debug)]
pub struct AvailabilityBreaker {
    retry_window: Duration,
    down: HashMap<HostId, Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownHost {
    pub host: HostId,
    pub down_for_ms: u64,
    pub retry_in_ms: u64,
}

impl AvailabilityBreaker {
    pub fn new(retry_window: Duration) -> Self {
        Self {
            retry_window,
            down: HashMap::new(),
        }
    }

    pub fn retry_window(&self) -> Duration {
        self.retry_window
    }

    /// Returns `true` if the host was up before this call.
    pub fn flag_down(&mut self, host: &HostId, now: Instant) -> bool {
        self.down.insert(host.clone(), now).is_none()
    }

    pub fn mark_up(&mut self, host: &HostId) -> bool {
        self.down.remove(host).is_some()
    }

    /// `Err(remaining)` while inside the retry window. Once the window has
    /// passed the host is forgotten and the caller may try again.
    pub fn check(&mut self, host: &HostId, now: Instant) -> Result<(), Duration> {
        let Some(since) = self.down.get(host).copied() else {
            return Ok(());
        };
        let elapsed = now.saturating_duration_since(since);
        if elapsed < self.retry_window {
            return Err(self.retry_window - elapsed);
        }
        self.down.remove(host);
        tracing::info!(%host, down_for_ms = elapsed.as_millis() as u64, "retry window passed; trying daemon again");
        Ok(())
    }

    pub fn is_available(&self, host: &HostId, now: Instant) -> bool {
        match self.down.get(host) {
            Some(since) => now.saturating_duration_since(*since) >= self.retry_window,
            None => true,
        }
    }

    pub fn down_hosts(&self, now: Instant) -> Vec<DownHost> {
        let mut hosts: Vec<_> = self
            .down
            .iter()
            .map(|(host, since)| {
                let elapsed = now.saturating_duration_since(*since);
                DownHost {
                    host: host.clone(),
                    down_for_ms: elapsed.as_millis() as u64,
                    retry_in_ms: self.retry_window.saturating_sub(elapsed).as_millis() as u64,
                }
            })
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        hosts
    }
}

// ---------------------------------------------------------------------------
// Shared availability
// ---------------------------------------------------------------------------

/// Breaker and connector cache, shared by the pool and every connector it
/// hands out.
#[derive(Debug)]
struct Availability {
    breaker: Mutex<AvailabilityBreaker>,
    connectors: Mutex<HashMap<HostId, Arc<DaemonConnector>>>,
}

impl Availability {
    fn lock_breaker(&self) -> MutexGuard<'_, AvailabilityBreaker> {
        self.breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_connectors(&self) -> MutexGuard<'_, HashMap<HostId, Arc<DaemonConnector>>> {
        self.connectors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flag_down_at(&self, host: &HostId, now: Instant) {
        let mut breaker = self.lock_breaker();
        if breaker.flag_down(host, now) {
            tracing::warn!(
                %host,
                retry_window_ms = breaker.retry_window().as_millis() as u64,
                "daemon flagged down",
            );
        }
        drop(breaker);
        self.lock_connectors().remove(host);
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slots {
    idle: Vec<TcpStream>,
    in_use: usize,
}

/// A bounded set of connections to one daemon. An I/O failure on any of
/// them flags the host down in the pool that created the connector.
#[derive(Debug)]
pub struct DaemonConnector {
    endpoint: DaemonEndpoint,
    availability: Weak<Availability>,
    max_connections: usize,
    connect_timeout: Duration,
    slots: Mutex<Slots>,
    released: Condvar,
    next_request_id: AtomicU64,
}

/// A checked-out connection. Healthy streams go back to the idle list on
/// drop; a stream taken out with [`Checkout::discard`] is closed instead.
struct Checkout<'a> {
    connector: &'a DaemonConnector,
    stream: Option<TcpStream>,
}

impl Checkout<'_> {
    fn stream(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    fn discard(&mut self) {
        self.stream = None;
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        let mut slots = self.connector.lock_slots();
        slots.in_use = slots.in_use.saturating_sub(1);
        if let Some(stream) = self.stream.take() {
            slots.idle.push(stream);
        }
        drop(slots);
        self.connector.released.notify_one();
    }
}

impl DaemonConnector {
    fn new(
        endpoint: DaemonEndpoint,
        settings: &PoolConfig,
        availability: Weak<Availability>,
    ) -> Self {
        Self {
            endpoint,
            availability,
            max_connections: settings.size.max(1),
            connect_timeout: settings.connect_timeout(),
            slots: Mutex::new(Slots::default()),
            released: Condvar::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &DaemonEndpoint {
        &self.endpoint
    }

    pub fn idle_connections(&self) -> usize {
        self.lock_slots().idle.len()
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unavailable(&self, reason: impl Into<String>) -> PoolError {
        PoolError::Unavailable {
            host: self.endpoint.host.clone(),
            reason: reason.into(),
        }
    }

    fn protocol_error(&self, err: ProtocolError) -> PoolError {
        match err {
            ProtocolError::Io(_) | ProtocolError::ConnectionClosed => self.unavailable(err.to_string()),
            other => PoolError::Protocol {
                host: self.endpoint.host.clone(),
                message: other.to_string(),
            },
        }
    }

    fn checkout(&self) -> Result<Checkout<'_>, PoolError> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut slots = self.lock_slots();
        loop {
            if let Some(stream) = slots.idle.pop() {
                slots.in_use += 1;
                return Ok(Checkout {
                    connector: self,
                    stream: Some(stream),
                });
            }
            if slots.in_use < self.max_connections {
                slots.in_use += 1;
                drop(slots);
                let mut checkout = Checkout {
                    connector: self,
                    stream: None,
                };
                checkout.stream = Some(self.open()?);
                return Ok(checkout);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Busy {
                    host: self.endpoint.host.clone(),
                    max_connections: self.max_connections,
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots = guard;
        }
    }

    fn resolve_addr(&self) -> Result<SocketAddr, PoolError> {
        (self.endpoint.address.as_str(), self.endpoint.port)
            .to_socket_addrs()
            .map_err(|e| self.unavailable(format!("resolve {}: {e}", self.endpoint.address)))?
            .next()
            .ok_or_else(|| self.unavailable(format!("no address for {}", self.endpoint.address)))
    }

    /// Connect and authenticate a fresh stream.
    fn open(&self) -> Result<TcpStream, PoolError> {
        let addr = self.resolve_addr()?;
        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| self.unavailable(format!("connect {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| self.unavailable(e.to_string()))?;

        let hello = DaemonFrame::Hello {
            protocol_version: self.endpoint.protocol_version,
            key: self.endpoint.key.clone(),
        };
        write_frame_blocking(&mut stream, &hello).map_err(|e| self.protocol_error(e))?;
        let reply: Response =
            read_frame_blocking(&mut stream).map_err(|e| self.protocol_error(e))?;
        if !reply.ok {
            let message = reply
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "hello refused".to_string());
            return Err(PoolError::Daemon {
                host: self.endpoint.host.clone(),
                message,
            });
        }
        tracing::debug!(host = %self.endpoint.host, %addr, "opened daemon connection");
        Ok(stream)
    }

    /// Send one request to the daemon and wait for its response. Resolve,
    /// connect and stream failures flag the host down for every caller.
    pub fn request(&self, cmd: &str, args: Value) -> Result<Value, PoolError> {
        let result = self.exchange(cmd, args);
        if let Err(PoolError::Unavailable { .. }) = &result {
            self.report_down();
        }
        result
    }

    fn report_down(&self) {
        if let Some(availability) = self.availability.upgrade() {
            availability.flag_down_at(&self.endpoint.host, Instant::now());
        }
    }

    fn exchange(&self, cmd: &str, args: Value) -> Result<Value, PoolError> {
        let mut checkout = self.checkout()?;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = DaemonFrame::Request(Request {
            id,
            cmd: cmd.to_string(),
            args,
        });

        let Some(stream) = checkout.stream() else {
            return Err(self.unavailable("no connection"));
        };
        let result = write_frame_blocking(stream, &frame)
            .and_then(|()| read_frame_blocking::<_, Response>(stream));
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                checkout.discard();
                return Err(self.protocol_error(err));
            }
        };
        if response.id != id {
            checkout.discard();
            return Err(PoolError::Protocol {
                host: self.endpoint.host.clone(),
                message: format!("response id {} does not match request {id}", response.id),
            });
        }
        if response.ok {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(PoolError::Daemon {
                host: self.endpoint.host.clone(),
                message: response
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "request failed".to_string()),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Availability of one host, for the `daemon_status` command.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub host: HostId,
    pub configured: bool,
    pub available: bool,
    pub connector_cached: bool,
    pub idle_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub down: Option<DownHost>,
}

pub struct DaemonConnectionPool {
    directory: Arc<dyn DaemonDirectory>,
    settings: PoolConfig,
    shared: Arc<Availability>,
}

impl DaemonConnectionPool {
    pub fn new(directory: Arc<dyn DaemonDirectory>, settings: PoolConfig) -> Self {
        let shared = Arc::new(Availability {
            breaker: Mutex::new(AvailabilityBreaker::new(settings.retry_window())),
            connectors: Mutex::new(HashMap::new()),
        });
        Self {
            directory,
            settings,
            shared,
        }
    }

    fn lock_connectors(&self) -> MutexGuard<'_, HashMap<HostId, Arc<DaemonConnector>>> {
        self.shared.lock_connectors()
    }

    fn lock_breaker(&self) -> MutexGuard<'_, AvailabilityBreaker> {
        self.shared.lock_breaker()
    }

    pub fn get_connector(&self, host: &HostId) -> Result<Arc<DaemonConnector>, PoolError> {
        self.get_connector_at(host, Instant::now())
    }

    /// Breaker first, then the cached connector, then lazy creation.
    /// Creating a connector does not open a socket.
    pub fn get_connector_at(
        &self,
        host: &HostId,
        now: Instant,
    ) -> Result<Arc<DaemonConnector>, PoolError> {
        if let Err(remaining) = self.lock_breaker().check(host, now) {
            return Err(PoolError::Unavailable {
                host: host.clone(),
                reason: format!("flagged down, retry in {}s", remaining.as_secs()),
            });
        }

        let mut connectors = self.lock_connectors();
        if let Some(connector) = connectors.get(host) {
            return Ok(connector.clone());
        }
        let endpoint = self
            .directory
            .resolve(host)
            .ok_or_else(|| PoolError::UnknownHost(host.clone()))?;
        let connector = Arc::new(DaemonConnector::new(
            endpoint,
            &self.settings,
            Arc::downgrade(&self.shared),
        ));
        connectors.insert(host.clone(), connector.clone());
        tracing::debug!(%host, "created daemon connector");
        Ok(connector)
    }

    /// Run one daemon command on the host's cached connector.
    pub fn call(&self, host: &HostId, cmd: &str, args: Value) -> Result<Value, PoolError> {
        self.get_connector(host)?.request(cmd, args)
    }

    pub fn flag_down(&self, host: &HostId) {
        self.flag_down_at(host, Instant::now());
    }

    pub fn flag_down_at(&self, host: &HostId, now: Instant) {
        self.shared.flag_down_at(host, now);
    }

    pub fn is_available(&self, host: &HostId) -> bool {
        self.is_available_at(host, Instant::now())
    }

    pub fn is_available_at(&self, host: &HostId, now: Instant) -> bool {
        self.lock_breaker().is_available(host, now)
    }

    pub fn down_hosts(&self) -> Vec<DownHost> {
        self.lock_breaker().down_hosts(Instant::now())
    }

    /// Forget the cached connector for one host; its idle streams close.
    pub fn evict(&self, host: &HostId) -> bool {
        self.lock_connectors().remove(host).is_some()
    }

    /// Forget every cached connector.
    pub fn clear(&self) -> usize {
        let mut connectors = self.lock_connectors();
        let count = connectors.len();
        connectors.clear();
        count
    }

    pub fn cached_connectors(&self) -> usize {
        self.lock_connectors().len()
    }

    pub fn status(&self, host: &HostId) -> DaemonStatus {
        let now = Instant::now();
        let connector = self.lock_connectors().get(host).cloned();
        let down = self
            .lock_breaker()
            .down_hosts(now)
            .into_iter()
            .find(|down| &down.host == host);
        DaemonStatus {
            host: host.clone(),
            configured: self.directory.resolve(host).is_some(),
            available: self.is_available_at(host, now),
            connector_cached: connector.is_some(),
            idle_connections: connector.map_or(0, |c| c.idle_connections()),
            down,
        }
    }
}

impl InvalidationListener for DaemonConnectionPool {
    fn on_invalidate(&self, table: TableId) {
        if table.affects_daemon_connectors() {
            let cleared = self.clear();
            if cleared > 0 {
                tracing::debug!(%table, cleared, "cleared daemon connectors");
            }
        }
    }
}
