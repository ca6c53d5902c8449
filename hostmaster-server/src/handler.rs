//! The seam between the session loop and business logic.

use serde_json::Value;

use hostmaster_core::{HostId, InvalidationSet};

use crate::auth::Principal;
use crate::barrier::SyncBarrier;
use crate::error::ServiceError;
use crate::pool::DaemonConnectionPool;
use crate::protocol::Request;
use crate::session::ConnectionId;

/// What a handler sees about the calling session.
pub struct RequestContext<'a> {
    pub connection_id: ConnectionId,
    pub protocol_version: u16,
    pub principal: &'a Principal,
    pub daemon_host: Option<&'a HostId>,
    pub pool: &'a DaemonConnectionPool,
    pub barrier: &'a SyncBarrier,
}

/// A successful handler result. `invalidations` are published only because
/// the handler returned `Ok`; an `Err` discards whatever it had recorded.
#[derive(Debug, Default)]
pub struct HandlerReply {
    pub data: Value,
    pub invalidations: InvalidationSet,
}

impl HandlerReply {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            invalidations: InvalidationSet::new(),
        }
    }

    pub fn with_invalidations(mut self, invalidations: InvalidationSet) -> Self {
        self.invalidations = invalidations;
        self
    }
}

/// Executes every command the master does not answer itself. Runs on the
/// blocking thread pool, so implementations may block on I/O or the barrier.
pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        ctx: &RequestContext<'_>,
        request: &Request,
    ) -> Result<HandlerReply, ServiceError>;
}

/// Answers every command with `unknown_command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCommands;

impl RequestHandler for NoCommands {
    fn handle(
        &self,
        _ctx: &RequestContext<'_>,
        request: &Request,
    ) -> Result<HandlerReply, ServiceError> {
        Err(ServiceError::unknown_command(&request.cmd))
    }
}
