use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hostmaster_core::HostId;

/// Error surface for the master runtime, configuration and client.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config not found at {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("cannot determine home directory; pass --config explicitly")]
    HomeNotFound,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("daemon pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("connection rejected ({kind}): {message}")]
    Rejected { kind: RejectKind, message: String },

    #[error("request failed ({kind}): {message}")]
    Service { kind: String, message: String },

    #[error("task failure: {0}")]
    Task(String),

    #[error("master {task} task stopped: {source}")]
    TaskStopped {
        task: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Framing and handshake violations. Always fatal for the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame { expected: &'static str, got: String },

    #[error("unsupported protocol version {requested} (supported {min}..={max})")]
    UnsupportedVersion { requested: u16, min: u16, max: u16 },

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reaching a daemon through the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no daemon endpoint configured for host {0}")]
    UnknownHost(HostId),

    #[error("server unavailable: {host} ({reason})")]
    Unavailable { host: HostId, reason: String },

    /// Every connection to a reachable daemon stayed checked out past the
    /// connect timeout. Not a sign the host is down.
    #[error("daemon {host} busy: all {max_connections} connections in use")]
    Busy { host: HostId, max_connections: usize },

    #[error("daemon protocol error from {host}: {message}")]
    Protocol { host: HostId, message: String },

    #[error("daemon {host} refused request: {message}")]
    Daemon { host: HostId, message: String },
}

/// Why a handshake was refused. Sent on the wire in `rejected` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    UnsupportedVersion,
    AuthFailed,
    BindingDenied,
    Malformed,
}

impl std::fmt::Display for RejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RejectKind::UnsupportedVersion => "unsupported_version",
            RejectKind::AuthFailed => "auth_failed",
            RejectKind::BindingDenied => "binding_denied",
            RejectKind::Malformed => "malformed",
        };
        f.write_str(label)
    }
}

/// A typed business failure. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn unknown_command(cmd: &str) -> Self {
        Self::new("unknown_command", format!("unknown command '{cmd}'"))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new("invalid_argument", message)
    }
}

impl From<PoolError> for ServiceError {
    fn from(err: PoolError) -> Self {
        let kind = match &err {
            PoolError::Unavailable { .. } => "server_unavailable",
            PoolError::Busy { .. } => "daemon_busy",
            PoolError::UnknownHost(_) => "unknown_host",
            PoolError::Protocol { .. } | PoolError::Daemon { .. } => "daemon_error",
        };
        Self::new(kind, err.to_string())
    }
}

pub(crate) fn io_err(context: impl Into<String>, source: std::io::Error) -> MasterError {
    MasterError::Io {
        context: context.into(),
        source,
    }
}
