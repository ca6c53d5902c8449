//! Per-host pending-sequence tracking.
//!
//! Every batch queued for a daemon-bound session reserves the host's next
//! sequence number. The token stays pending until the session writes the
//! batch to the wire or closes. [`SyncBarrier::wait_for_invalidates`] blocks
//! until every token issued for a host so far has cleared, bounded by a
//! ceiling after which it gives up and lets the caller proceed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use hostmaster_core::HostId;

use crate::session::{ConnectionId, SessionHandle};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SyncToken {
    pub host: HostId,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierOutcome {
    /// Every batch issued before the call has been flushed or abandoned.
    Clear,
    /// The ceiling elapsed first; the caller proceeds anyway.
    TimedOut,
}

#[derive(Debug, Default)]
struct BarrierState {
    last_issued: HashMap<HostId, u64>,
    pending: HashMap<HostId, BTreeMap<u64, Arc<SessionHandle>>>,
}

impl BarrierState {
    fn purge_closed(&mut self, host: &HostId) {
        let Some(pending) = self.pending.get_mut(host) else {
            return;
        };
        pending.retain(|sequence, session| {
            let open = !session.is_closed();
            if !open {
                tracing::debug!(
                    %host,
                    sequence,
                    connection_id = %session.id(),
                    "purging sync token of closed session",
                );
            }
            open
        });
        if pending.is_empty() {
            self.pending.remove(host);
        }
    }

    fn oldest_pending(&self, host: &HostId) -> Option<u64> {
        self.pending
            .get(host)
            .and_then(|pending| pending.keys().next().copied())
    }
}

#[derive(Debug)]
pub struct SyncBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
    ceiling: Duration,
}

impl SyncBarrier {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            changed: Condvar::new(),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the next sequence number for `host` on behalf of `session`.
    pub fn reserve(&self, host: &HostId, session: &Arc<SessionHandle>) -> SyncToken {
        let mut state = self.lock();
        let counter = state.last_issued.entry(host.clone()).or_insert(0);
        *counter += 1;
        let sequence = *counter;
        state
            .pending
            .entry(host.clone())
            .or_default()
            .insert(sequence, session.clone());
        SyncToken {
            host: host.clone(),
            sequence,
        }
    }

    /// Clear a token after its batch was written. Returns `false` if it was
    /// no longer pending.
    pub fn release(&self, token: &SyncToken) -> bool {
        let mut state = self.lock();
        let removed = match state.pending.get_mut(&token.host) {
            Some(pending) => {
                let removed = pending.remove(&token.sequence).is_some();
                if pending.is_empty() {
                    state.pending.remove(&token.host);
                }
                removed
            }
            None => false,
        };
        drop(state);
        if removed {
            self.changed.notify_all();
        }
        removed
    }

    /// Drop every token held by a session. Returns how many were removed.
    pub fn purge_session(&self, id: ConnectionId) -> usize {
        let mut state = self.lock();
        let mut removed = 0usize;
        state.pending.retain(|_, pending| {
            let before = pending.len();
            pending.retain(|_, session| session.id() != id);
            removed += before - pending.len();
            !pending.is_empty()
        });
        drop(state);
        if removed > 0 {
            tracing::debug!(connection_id = %id, removed, "purged sync tokens of closed session");
            self.changed.notify_all();
        }
        removed
    }

    /// Block until every batch issued for `host` before this call has
    /// cleared, or the configured ceiling elapses.
    pub fn wait_for_invalidates(&self, host: &HostId) -> BarrierOutcome {
        self.wait_with_ceiling(host, self.ceiling)
    }

    pub fn wait_with_ceiling(&self, host: &HostId, ceiling: Duration) -> BarrierOutcome {
        let started = Instant::now();
        let deadline = started + ceiling;
        let mut state = self.lock();
        let target = state.last_issued.get(host).copied().unwrap_or(0);

        loop {
            state.purge_closed(host);
            match state.oldest_pending(host) {
                Some(oldest) if oldest <= target => {}
                _ => return BarrierOutcome::Clear,
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::error!(
                    %host,
                    target_sequence = target,
                    oldest_pending = ?state.oldest_pending(host),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "timed out waiting for daemon to receive invalidations; proceeding",
                );
                return BarrierOutcome::TimedOut;
            }

            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    pub fn last_issued(&self, host: &HostId) -> u64 {
        self.lock().last_issued.get(host).copied().unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.values().map(BTreeMap::len).sum()
    }

    pub fn pending_for(&self, host: &HostId) -> Vec<u64> {
        self.lock()
            .pending
            .get(host)
            .map(|pending| pending.keys().copied().collect())
            .unwrap_or_default()
    }
}
