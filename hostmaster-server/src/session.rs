//! Per-connection session state shared with the fanout path.
//!
//! A session is owned by its connection task. The only part other threads
//! touch is the outbound invalidation queue, which has its own lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use hostmaster_core::{HostId, TableId};

use crate::auth::Principal;
use crate::barrier::{SyncBarrier, SyncToken};

/// Monotonic connection identifier assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Connected,
    Handshaking,
    Serving,
    Closed,
}

/// The tables changed by one committed transaction, as queued for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationBatch {
    pub tables: Vec<TableId>,
    /// Present for daemon-bound sessions; released once the batch is written.
    pub token: Option<SyncToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Queued(Option<SyncToken>),
    SessionClosed,
}

#[derive(Debug, Default)]
struct SessionQueue {
    batches: VecDeque<InvalidationBatch>,
    closed: bool,
}

#[derive(Debug)]
pub struct SessionHandle {
    id: ConnectionId,
    peer: String,
    connected_at: DateTime<Utc>,
    protocol_version: OnceLock<u16>,
    principal: OnceLock<Principal>,
    daemon_host: OnceLock<HostId>,
    queue: Mutex<SessionQueue>,
    closed: AtomicBool,
    wake: Notify,
}

/// Point-in-time view of a session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub peer: String,
    pub username: Option<String>,
    pub daemon_host: Option<HostId>,
    pub protocol_version: Option<u16>,
    pub connected_at: DateTime<Utc>,
    pub queued_batches: usize,
}

impl SessionHandle {
    pub(crate) fn new(id: ConnectionId, peer: impl Into<String>) -> Self {
        Self {
            id,
            peer: peer.into(),
            connected_at: Utc::now(),
            protocol_version: OnceLock::new(),
            principal: OnceLock::new(),
            daemon_host: OnceLock::new(),
            queue: Mutex::new(SessionQueue::default()),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn protocol_version(&self) -> Option<u16> {
        self.protocol_version.get().copied()
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.get()
    }

    pub fn daemon_host(&self) -> Option<&HostId> {
        self.daemon_host.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the handshake outcome. Returns `false` if the session was
    /// already established; the first values stay in place.
    pub(crate) fn establish(
        &self,
        protocol_version: u16,
        principal: Principal,
        daemon_host: Option<HostId>,
    ) -> bool {
        let version_set = self.protocol_version.set(protocol_version).is_ok();
        let principal_set = self.principal.set(principal).is_ok();
        let host_set = daemon_host.map_or(true, |host| self.daemon_host.set(host).is_ok());
        version_set && principal_set && host_set
    }

    fn lock_queue(&self) -> MutexGuard<'_, SessionQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `tables` for delivery at the next flush point. Daemon-bound
    /// sessions reserve a barrier token while the queue lock is held, so a
    /// concurrent close either sees the token (and purges it) or prevents it.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        tables: Vec<TableId>,
        barrier: &SyncBarrier,
    ) -> Enqueued {
        let mut queue = self.lock_queue();
        if queue.closed {
            return Enqueued::SessionClosed;
        }
        let token = self.daemon_host().map(|host| barrier.reserve(host, self));
        queue.batches.push_back(InvalidationBatch {
            tables,
            token: token.clone(),
        });
        drop(queue);
        self.wake.notify_one();
        Enqueued::Queued(token)
    }

    /// Take every queued batch, oldest first.
    pub(crate) fn drain(&self) -> Vec<InvalidationBatch> {
        self.lock_queue().batches.drain(..).collect()
    }

    pub fn queued_batches(&self) -> usize {
        self.lock_queue().batches.len()
    }

    /// Mark closed and discard queued batches. Returns `false` if the session
    /// was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut queue = self.lock_queue();
        if queue.closed {
            return false;
        }
        queue.closed = true;
        queue.batches.clear();
        self.closed.store(true, Ordering::Release);
        drop(queue);
        self.wake.notify_one();
        true
    }

    /// Wait until a batch is queued, the session closes, or `keepalive`
    /// elapses. Returns whether work is pending.
    pub async fn wait_for_work(&self, keepalive: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + keepalive;
        loop {
            if self.queued_batches() > 0 {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            if tokio::time::timeout_at(deadline, self.wake.notified())
                .await
                .is_err()
            {
                return self.queued_batches() > 0;
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.id,
            peer: self.peer.clone(),
            username: self.principal().map(|p| p.username.clone()),
            daemon_host: self.daemon_host().cloned(),
            protocol_version: self.protocol_version(),
            connected_at: self.connected_at,
            queued_batches: self.queued_batches(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn principal(hosts: &[&str]) -> Principal {
        Principal {
            username: "daemon".to_string(),
            master: false,
            daemon_hosts: hosts.iter().map(|h| HostId::from(*h)).collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn queue_is_fifo() {
        let barrier = SyncBarrier::new(Duration::from_secs(1));
        let session = Arc::new(SessionHandle::new(ConnectionId(1), "test"));
        session.enqueue(vec![TableId::Accounts], &barrier);
        session.enqueue(vec![TableId::DnsZones], &barrier);
        let drained = session.drain();
        assert_eq!(drained[0].tables, vec![TableId::Accounts]);
        assert_eq!(drained[1].tables, vec![TableId::DnsZones]);
        assert!(session.drain().is_empty());
    }

    #[test]
    fn closed_session_ignores_enqueue() {
        let barrier = SyncBarrier::new(Duration::from_secs(1));
        let session = Arc::new(SessionHandle::new(ConnectionId(1), "test"));
        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        assert_eq!(
            session.enqueue(vec![TableId::Accounts], &barrier),
            Enqueued::SessionClosed
        );
        assert_eq!(session.queued_batches(), 0);
    }

    #[test]
    fn daemon_host_is_set_once() {
        let session = SessionHandle::new(ConnectionId(1), "test");
        assert!(session.establish(2, principal(&["web1"]), Some(HostId::from("web1"))));
        assert!(!session.establish(2, principal(&["web2"]), Some(HostId::from("web2"))));
        assert_eq!(session.daemon_host(), Some(&HostId::from("web1")));
    }

    #[test]
    fn daemon_bound_enqueue_reserves_a_token() {
        let barrier = SyncBarrier::new(Duration::from_secs(1));
        let session = Arc::new(SessionHandle::new(ConnectionId(9), "test"));
        session.establish(2, principal(&["web1"]), Some(HostId::from("web1")));
        let Enqueued::Queued(Some(token)) = session.enqueue(vec![TableId::NetBinds], &barrier)
        else {
            panic!("expected a reserved token");
        };
        assert_eq!(token.sequence, 1);
        assert_eq!(barrier.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_work_wakes_on_enqueue() {
        let barrier = Arc::new(SyncBarrier::new(Duration::from_secs(1)));
        let session = Arc::new(SessionHandle::new(ConnectionId(1), "test"));
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_work(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        session.enqueue(vec![TableId::Tickets], &barrier);
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_work_times_out_empty() {
        let session = SessionHandle::new(ConnectionId(1), "test");
        assert!(!session.wait_for_work(Duration::from_secs(5)).await);
    }
}
