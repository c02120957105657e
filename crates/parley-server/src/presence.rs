use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_core::identity::Identity;
use parley_core::ids::{AgentId, ConnId, VisitorId};
use parley_core::wire::ServerFrame;

/// The server side of one authenticated connection. Exactly one handle
/// per identity is canonical at any instant; a re-handshake for the same
/// identity supersedes the old handle.
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    pub identity: Identity,
    outbound: mpsc::Sender<ServerFrame>,
    pub connected_at: DateTime<Utc>,
    last_traffic: AtomicU64,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(identity: Identity, outbound: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            conn_id: ConnId::new(),
            identity,
            outbound,
            connected_at: Utc::now(),
            last_traffic: AtomicU64::new(now_millis()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue a frame for delivery. Returns false if the client's send
    /// queue is full or its writer has gone away.
    pub fn send(&self, frame: ServerFrame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    conn_id = %self.conn_id,
                    identity = %self.identity,
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Record inbound traffic for liveness.
    pub fn touch(&self) {
        self.last_traffic.store(now_millis(), Ordering::Relaxed);
    }

    /// Millisecond granularity, so sub-second timeouts (as used in
    /// tests) behave the same as the production 90 s window.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        let last = self.last_traffic.load(Ordering::Relaxed);
        now_millis().saturating_sub(last) > timeout.as_millis() as u64
    }

    /// Ask the owning session to close. Idempotent.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    #[cfg(test)]
    pub(crate) fn backdate_traffic(&self, ago: Duration) {
        self.last_traffic.store(
            now_millis().saturating_sub(ago.as_millis() as u64),
            Ordering::Relaxed,
        );
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory mapping from identity to its live connection handle.
///
/// A key is present iff its connection is open and authenticated.
/// Mutated only by session lifecycle events: insert on handshake, guarded
/// delete on teardown, overwrite on re-handshake of the same identity.
#[derive(Default)]
pub struct PresenceRegistry {
    agents: DashMap<AgentId, Arc<ConnectionHandle>>,
    visitors: DashMap<VisitorId, Arc<ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle, unconditionally overwriting any existing entry
    /// for the identity. Returns the superseded handle, if any; the
    /// caller is responsible for cancelling it.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        match &handle.identity {
            Identity::Agent { id } => self.agents.insert(id.clone(), handle.clone()),
            Identity::Visitor { id, .. } => self.visitors.insert(id.clone(), handle.clone()),
        }
    }

    /// Remove the mapping only if it still points at `conn_id`. Returns
    /// whether a deletion occurred. A stale handle (already superseded)
    /// must never remove the current entry.
    pub fn unregister(&self, identity: &Identity, conn_id: &ConnId) -> bool {
        match identity {
            Identity::Agent { id } => self
                .agents
                .remove_if(id, |_, h| &h.conn_id == conn_id)
                .is_some(),
            Identity::Visitor { id, .. } => self
                .visitors
                .remove_if(id, |_, h| &h.conn_id == conn_id)
                .is_some(),
        }
    }

    pub fn lookup(&self, identity: &Identity) -> Option<Arc<ConnectionHandle>> {
        match identity {
            Identity::Agent { id } => self.agents.get(id).map(|e| e.value().clone()),
            Identity::Visitor { id, .. } => self.visitors.get(id).map(|e| e.value().clone()),
        }
    }

    /// Online visitors linked to an agent. Order is not meaningful.
    pub fn visitors_of(&self, agent_id: &AgentId) -> Vec<Identity> {
        self.visitors
            .iter()
            .filter(|e| e.value().identity.owning_agent() == agent_id)
            .map(|e| e.value().identity.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.agents.len() + self.visitors.len()
    }

    /// Cancel connections with no inbound traffic for longer than
    /// `timeout`. Removal is left to the owning session: it wakes on the
    /// cancellation and runs its regular teardown, whose guarded
    /// unregister then persists last-seen and notifies the counterpart.
    pub fn sweep_stale(&self, timeout: Duration) -> usize {
        let stale: Vec<Arc<ConnectionHandle>> = self
            .agents
            .iter()
            .map(|e| e.value().clone())
            .chain(self.visitors.iter().map(|e| e.value().clone()))
            .filter(|h| h.is_stale(timeout) && !h.is_cancelled())
            .collect();

        for handle in &stale {
            handle.cancel();
            tracing::info!(
                identity = %handle.identity,
                conn_id = %handle.conn_id,
                "cancelled dead connection"
            );
        }
        stale.len()
    }
}
