//! Master configuration, loaded from YAML.
//!
//! Every field has a default so an empty file (or no file at all when the
//! default location is used) yields a runnable, if user-less, master.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hostmaster_core::HostId;

use crate::error::{io_err, MasterError};
use crate::paths::{
    self, DEFAULT_BARRIER_CEILING, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_LISTEN, DEFAULT_LISTEN_KEEPALIVE, DEFAULT_RETRY_WINDOW,
};
use crate::protocol::VersionRange;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen: SocketAddr,
    pub protocol: VersionRange,
    pub handshake_timeout_ms: u64,
    pub listen_caches_keepalive_ms: u64,
    pub barrier: BarrierConfig,
    pub pool: PoolConfig,
    pub users: Vec<UserConfig>,
    pub daemons: Vec<DaemonConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// Upper bound on a single `wait_for_invalidates` call.
    pub ceiling_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent connections per daemon host.
    pub size: usize,
    /// How long a host stays flagged down before it is tried again.
    pub retry_window_ms: u64,
    pub connect_timeout_ms: u64,
}

/// A principal allowed to open sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub secret: String,
    /// Master administrators may run the privileged built-in commands.
    #[serde(default)]
    pub master: bool,
    /// Hosts this principal may bind a daemon session to.
    #[serde(default)]
    pub daemon_hosts: BTreeSet<HostId>,
}

/// How the master reaches one daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub host: HostId,
    pub address: String,
    pub port: u16,
    pub key: String,
    #[serde(default = "default_daemon_protocol")]
    pub protocol_version: u16,
}

fn default_daemon_protocol() -> u16 {
    VersionRange::default().max
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 4582))),
            protocol: VersionRange::default(),
            handshake_timeout_ms: millis(DEFAULT_HANDSHAKE_TIMEOUT),
            listen_caches_keepalive_ms: millis(DEFAULT_LISTEN_KEEPALIVE),
            barrier: BarrierConfig::default(),
            pool: PoolConfig::default(),
            users: Vec::new(),
            daemons: Vec::new(),
        }
    }
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            ceiling_ms: millis(DEFAULT_BARRIER_CEILING),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            retry_window_ms: millis(DEFAULT_RETRY_WINDOW),
            connect_timeout_ms: millis(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

impl MasterConfig {
    /// Load from an explicit path, or from `~/.hostmaster/master.yaml`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, MasterError> {
        match explicit {
            Some(path) => Self::load_at(path),
            None => {
                let path = paths::default_config_path().ok_or(MasterError::HomeNotFound)?;
                if !path.exists() {
                    tracing::info!(path = %path.display(), "no master config found, using defaults");
                    return Ok(Self::default());
                }
                Self::load_at(&path)
            }
        }
    }

    pub fn load_at(path: &Path) -> Result<Self, MasterError> {
        if !path.exists() {
            return Err(MasterError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| io_err(format!("read {}", path.display()), e))?;
        let config: MasterConfig =
            serde_yaml::from_str(&contents).map_err(|source| MasterError::Config {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MasterError> {
        if self.protocol.min > self.protocol.max {
            return Err(MasterError::InvalidConfig(format!(
                "protocol.min ({}) is greater than protocol.max ({})",
                self.protocol.min, self.protocol.max
            )));
        }
        if self.pool.size == 0 {
            return Err(MasterError::InvalidConfig("pool.size must be > 0".to_string()));
        }
        let mut seen = BTreeSet::new();
        for daemon in &self.daemons {
            if !seen.insert(&daemon.host) {
                return Err(MasterError::InvalidConfig(format!(
                    "daemon host {} configured twice",
                    daemon.host
                )));
            }
        }
        Ok(())
    }

    /// Copy with user secrets and daemon keys masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for user in &mut copy.users {
            user.secret = "********".to_string();
        }
        for daemon in &mut copy.daemons {
            daemon.key = "********".to_string();
        }
        copy
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn listen_caches_keepalive(&self) -> Duration {
        Duration::from_millis(self.listen_caches_keepalive_ms)
    }
}

impl BarrierConfig {
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }
}

impl PoolConfig {
    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
