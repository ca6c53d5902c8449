//! Live session table and invalidation fanout.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;

use hostmaster_core::{InvalidationSet, TableId};

use crate::barrier::{SyncBarrier, SyncToken};
use crate::session::{ConnectionId, Enqueued, SessionHandle, SessionSnapshot};

/// Receives one call per invalidated table per published batch, before any
/// session is told about it. Handlers use this to drop memoized lookups.
pub trait InvalidationListener: Send + Sync {
    fn on_invalidate(&self, table: TableId);
}

impl<F> InvalidationListener for F
where
    F: Fn(TableId) + Send + Sync,
{
    fn on_invalidate(&self, table: TableId) {
        self(table)
    }
}

/// What a single [`SessionRegistry::publish`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    pub tables: Vec<TableId>,
    /// Sessions that received the batch.
    pub sessions: usize,
    /// Tokens reserved for daemon-bound sessions.
    pub tokens: Vec<SyncToken>,
}

pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<ConnectionId, Arc<SessionHandle>>>,
    next_id: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,
    barrier: Arc<SyncBarrier>,
}

impl SessionRegistry {
    pub fn new(barrier: Arc<SyncBarrier>) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
            barrier,
        }
    }

    pub fn barrier(&self) -> &Arc<SyncBarrier> {
        &self.barrier
    }

    fn lock_sessions(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Arc<SessionHandle>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create and track a session for a freshly accepted connection.
    pub fn register(&self, peer: impl Into<String>) -> Arc<SessionHandle> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(SessionHandle::new(id, peer));
        self.lock_sessions().insert(id, session.clone());
        session
    }

    /// Tear a session down: stop accepting batches, forget it, and release
    /// any barrier waiters blocked on its pending tokens.
    pub fn close(&self, session: &SessionHandle) {
        let first_close = session.mark_closed();
        self.lock_sessions().remove(&session.id());
        let purged = self.barrier.purge_session(session.id());
        if first_close {
            tracing::debug!(
                connection_id = %session.id(),
                purged_tokens = purged,
                "session closed",
            );
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<SessionHandle>> {
        self.lock_sessions().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.lock_sessions()
            .values()
            .map(|session| session.snapshot())
            .collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn InvalidationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Fan a committed transaction's invalidations out to listeners and to
    /// every live session. Consumes the set; it cannot be published twice.
    pub fn publish(&self, invalidations: InvalidationSet) -> PublishSummary {
        let tables = invalidations.tables();
        if tables.is_empty() {
            return PublishSummary::default();
        }

        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for table in &tables {
            for listener in &listeners {
                listener.on_invalidate(*table);
            }
        }

        let sessions: Vec<_> = self.lock_sessions().values().cloned().collect();
        let mut summary = PublishSummary {
            tables: tables.clone(),
            ..PublishSummary::default()
        };
        for session in sessions {
            match session.enqueue(tables.clone(), &self.barrier) {
                Enqueued::Queued(token) => {
                    summary.sessions += 1;
                    summary.tokens.extend(token);
                }
                Enqueued::SessionClosed => {}
            }
        }

        tracing::debug!(
            tables = ?summary.tables,
            sessions = summary.sessions,
            tokens = summary.tokens.len(),
            "published invalidations",
        );
        summary
    }
}
