//! Hub — per-principal connection tracking and cancellation routing.
//!
//! Tracks, for each owning principal, the set of currently open connection
//! senders and the single most-recent cancellation handle, so a broadcast
//! can reach every open connection of a principal and a client `stop` can
//! reach the right producer.
//!
//! One mutex protects both maps: "which connections belong to this
//! principal" and "which job can currently be cancelled" are always
//! observed together, never torn.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{ConnectionId, Event, OwnerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct PrincipalEntry {
    connections: HashMap<ConnectionId, mpsc::Sender<Arc<Event>>>,
    cancel: Option<CancellationToken>,
}

/// Connection lifecycle manager.
#[derive(Default)]
pub struct Hub {
    principals: Mutex<HashMap<OwnerId, PrincipalEntry>>,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a principal. The principal's entry is
    /// created on first connection.
    pub fn register(&self, owner: &OwnerId, conn: &ConnectionId, tx: mpsc::Sender<Arc<Event>>) {
        let mut principals = self.principals.lock();
        let entry = principals.entry(owner.clone()).or_default();
        let _ = entry.connections.insert(conn.clone(), tx);
        debug!(owner = %owner, connection = %conn, total = entry.connections.len(), "connection registered");
    }

    /// Unregister a connection. When the principal's last connection
    /// closes, its entry (including any cancellation handle) is removed.
    pub fn unregister(&self, owner: &OwnerId, conn: &ConnectionId) {
        let mut principals = self.principals.lock();
        if let Some(entry) = principals.get_mut(owner) {
            let _ = entry.connections.remove(conn);
            debug!(owner = %owner, connection = %conn, remaining = entry.connections.len(), "connection unregistered");
            if entry.connections.is_empty() {
                let _ = principals.remove(owner);
            }
        }
    }

    /// Record the cancellation handle for the principal's most recently
    /// started job, replacing any previous handle.
    ///
    /// Only the latest handle is kept: starting a second concurrent job for
    /// the same principal makes the first uncancellable through the hub
    /// (its registry eviction path still applies on replacement). The
    /// handle is recorded only for principals with at least one open
    /// connection; a connectionless principal has no way to issue `stop`,
    /// and storing a handle for it would leave an entry nothing removes.
    pub fn set_cancel(&self, owner: &OwnerId, token: CancellationToken) {
        let mut principals = self.principals.lock();
        if let Some(entry) = principals.get_mut(owner) {
            entry.cancel = Some(token);
        }
    }

    /// Invoke and clear the principal's current cancellation handle.
    /// Returns `false` when there is nothing to cancel.
    pub fn cancel(&self, owner: &OwnerId) -> bool {
        let token = {
            let mut principals = self.principals.lock();
            principals.get_mut(owner).and_then(|e| e.cancel.take())
        };
        match token {
            Some(token) => {
                debug!(owner = %owner, "cancelling current job");
                token.cancel();
                true
            }
            None => {
                debug!(owner = %owner, "stop received with no cancellable job");
                false
            }
        }
    }

    /// Best-effort fan-out of an event to every open connection of a
    /// principal. Returns the number of connections reached.
    pub fn broadcast_to_owner(&self, owner: &OwnerId, event: &Arc<Event>) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<Arc<Event>>)> = {
            let principals = self.principals.lock();
            principals
                .get(owner)
                .map(|entry| {
                    entry
                        .connections
                        .iter()
                        .map(|(id, tx)| (id.clone(), tx.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut reached = 0;
        for (conn, tx) in targets {
            if tx.try_send(Arc::clone(event)).is_ok() {
                reached += 1;
            } else {
                warn!(owner = %owner, connection = %conn, event_type = %event.kind, "dropping owner broadcast for slow connection");
            }
        }
        reached
    }

    /// Open connections for one principal.
    #[must_use]
    pub fn connection_count(&self, owner: &OwnerId) -> usize {
        self.principals
            .lock()
            .get(owner)
            .map_or(0, |e| e.connections.len())
    }

    /// Open connections across all principals.
    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.principals
            .lock()
            .values()
            .map(|e| e.connections.len())
            .sum()
    }

    /// Whether no principals are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.principals.lock().is_empty()
    }
}
