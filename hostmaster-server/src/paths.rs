use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MASTER_CONFIG: &str = "master.yaml";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:4582";
/// Log filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "HOSTMASTER_LOG";

pub const DEFAULT_BARRIER_CEILING: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LISTEN_KEEPALIVE: Duration = Duration::from_secs(60);

pub fn master_root(home: &Path) -> PathBuf {
    home.join(".hostmaster")
}

pub fn config_path(home: &Path) -> PathBuf {
    master_root(home).join(MASTER_CONFIG)
}

/// `~/.hostmaster/master.yaml`, derived from `dirs::home_dir()`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| config_path(&home))
}
