//! Per-connection client state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_core::{ConnectionId, Event, OwnerId};
use tokio::sync::mpsc;

/// State for one physical client connection.
///
/// The outbound mailbox (`tx`) is drained by the connection's write loop;
/// it is fed both by the stream pump (the job subscription attached to this
/// connection) and by hub owner-wide broadcasts.
pub struct ClientConnection {
    id: ConnectionId,
    owner: OwnerId,
    tx: mpsc::Sender<Arc<Event>>,
    connected_at: Instant,
    /// Whether the client has responded since the last ping.
    pub is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    #[must_use]
    pub fn new(id: ConnectionId, owner: OwnerId, tx: mpsc::Sender<Arc<Event>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            owner,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owning principal.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Best-effort send of an event to this connection's write loop.
    ///
    /// Returns `false` if the mailbox is full or closed, incrementing the
    /// dropped-message counter.
    pub fn send(&self, event: Arc<Event>) -> bool {
        if self.tx.try_send(event).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Clone of the outbound mailbox sender, for lossless (awaited) sends.
    pub fn sender(&self) -> mpsc::Sender<Arc<Event>> {
        self.tx.clone()
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or any activity received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for the ping cycle.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
