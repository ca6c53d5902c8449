//! hostmaster control-plane server: sessions, invalidation fanout, the
//! daemon sync barrier and the daemon connection pool.

pub mod auth;
pub mod barrier;
pub mod config;
mod error;
pub mod handler;
pub mod paths;
pub mod pool;
pub mod protocol;
pub mod registry;
mod runtime;
pub mod services;
pub mod session;

pub use auth::{Authenticator, Principal, StaticAuthenticator};
pub use barrier::{BarrierOutcome, SyncBarrier, SyncToken};
pub use config::MasterConfig;
pub use error::{MasterError, PoolError, ProtocolError, RejectKind, ServiceError};
pub use handler::{HandlerReply, NoCommands, RequestContext, RequestHandler};
pub use pool::{
    AvailabilityBreaker, DaemonConnectionPool, DaemonConnector, DaemonDirectory, DaemonEndpoint,
    StaticDirectory,
};
pub use protocol::{Hello, InvalidateFrame, MasterClient, Request, Response};
pub use registry::{InvalidationListener, PublishSummary, SessionRegistry};
pub use runtime::{init_tracing, run, serve, spawn, start_blocking, MasterHandle};
pub use services::Services;
pub use session::{ConnectionId, SessionHandle, SessionPhase};
